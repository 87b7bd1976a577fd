//! Drives a module to its declared on-chain state, batch by batch.

mod execute;
mod maintenance;
mod resolve;

pub use maintenance::DeploymentStatus;

use crate::chain::ChainClient;
use crate::config::ExecutionConfig;
use crate::error::{AnchorageError, Result};
use crate::graph::DeploymentGraph;
use crate::journal::{
    EntryPayload, ErrorDetail, ExecutionState, FutureResult, Journal, JournalEntry, RunKey,
    read_entries,
};
use crate::module::{DeploymentParameters, FutureId, Module};
use crate::planner::{self, Batch};
use crate::reconciler::{FutureStatus, NonceReusePolicy, ReconciledState, ReconciliationPolicy, Reconciler};
use execute::{FutureTask, TaskContext, TaskOutcome, run_future};
use resolve::Resolver;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RunOutcome {
    /// Every future succeeded.
    Success,
    /// At least one future failed; the journal is kept for a later resume.
    Failed,
    /// Cancelled between batches.
    Aborted,
    /// Every future succeeded or was explicitly abandoned.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedFuture {
    pub id: FutureId,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub run_key: RunKey,
    pub attempt: u32,
    pub outcome: RunOutcome,
    /// Results of every succeeded future, including earlier runs.
    pub results: BTreeMap<FutureId, FutureResult>,
    /// Futures executed to success by this run.
    pub executed: Vec<FutureId>,
    /// Root failures with their error details.
    pub failed: Vec<FailedFuture>,
    /// Futures failed because a dependency failed.
    pub cascaded: Vec<FutureId>,
    pub abandoned: Vec<FutureId>,
    pub not_started: Vec<FutureId>,
}

impl DeploymentReport {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    /// Result of an exported future.
    pub fn export<'a>(&'a self, graph: &DeploymentGraph, name: &str) -> Option<&'a FutureResult> {
        graph
            .exports()
            .get(name)
            .and_then(|future| self.results.get(future.id()))
    }

    fn summarize(
        graph: &DeploymentGraph,
        run_key: RunKey,
        attempt: u32,
        state: &ReconciledState,
        executed: Vec<FutureId>,
        cancelled: bool,
    ) -> Self {
        let mut report = Self {
            run_key,
            attempt,
            outcome: RunOutcome::Success,
            results: BTreeMap::new(),
            executed,
            failed: Vec::new(),
            cascaded: Vec::new(),
            abandoned: Vec::new(),
            not_started: Vec::new(),
        };
        for future in graph.futures() {
            let id = future.id.clone();
            match state.status(&future.id) {
                FutureStatus::Success(result) => {
                    report.results.insert(id, result.clone());
                }
                FutureStatus::Failed(error) if error.cascaded_from.is_some() => report.cascaded.push(id),
                FutureStatus::Failed(error) => report.failed.push(FailedFuture {
                    id,
                    error: error.clone(),
                }),
                FutureStatus::Abandoned => report.abandoned.push(id),
                FutureStatus::Pending { .. } => report.not_started.push(id),
            }
        }
        report.outcome = if !report.failed.is_empty() || !report.cascaded.is_empty() {
            RunOutcome::Failed
        } else if cancelled && !report.not_started.is_empty() {
            RunOutcome::Aborted
        } else if !report.not_started.is_empty() {
            RunOutcome::Failed
        } else if !report.abandoned.is_empty() {
            RunOutcome::Abandoned
        } else {
            RunOutcome::Success
        };
        report
    }
}

/// Deployment engine for one network.
///
/// Holds the journal and chain collaborators; every call to
/// [`Deployer::deploy`] reconciles the journal first, so re-running after a
/// crash or a failure picks up where the last run stopped.
pub struct Deployer {
    journal: Arc<dyn Journal>,
    chain: Arc<dyn ChainClient>,
    policy: Arc<dyn ReconciliationPolicy>,
    config: ExecutionConfig,
}

impl Deployer {
    pub fn new(journal: Arc<dyn Journal>, chain: Arc<dyn ChainClient>, config: ExecutionConfig) -> Self {
        Self {
            journal,
            chain,
            policy: Arc::new(NonceReusePolicy),
            config,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn ReconciliationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    pub async fn deploy(
        &self,
        module: &Module,
        network: &str,
        parameters: &DeploymentParameters,
        cancel: &CancellationToken,
    ) -> Result<DeploymentReport> {
        let graph = DeploymentGraph::build(module)?;
        let run_key = RunKey::new(network, graph.module_id())?;
        let accounts = self.chain.accounts().await?;
        resolve::check_inputs(&graph, parameters, accounts.len())?;

        let entries = read_entries(self.journal.as_ref(), &run_key).await?;
        let attempt = entries.iter().map(|entry| entry.attempt).max().unwrap_or(0) + 1;
        info!(run = %run_key, attempt, futures = graph.len(), "deploy.started");

        let reconciliation = Reconciler::new(self.chain.as_ref(), self.policy.as_ref(), &run_key, attempt)
            .reconcile(&graph, &entries)
            .await?;
        for entry in &reconciliation.synthesized {
            self.journal.append(entry).await?;
        }
        let mut state = reconciliation.state;

        let plan = planner::plan(&graph, &state)?;
        info!(run = %run_key, batches = plan.batches.len(), futures = plan.future_count(), "deploy.planned");

        let context = Arc::new(TaskContext {
            journal: Arc::clone(&self.journal),
            chain: Arc::clone(&self.chain),
            run_key: run_key.clone(),
            attempt,
            future_timeout: self.config.future_timeout(),
            confirmations: self.config.required_confirmations,
            fingerprints: graph
                .futures()
                .iter()
                .filter_map(|future| {
                    graph
                        .fingerprint(&future.id)
                        .map(|fingerprint| (future.id.clone(), fingerprint.to_string()))
                })
                .collect(),
            in_flight: Mutex::new(HashMap::new()),
        });

        let mut executed = Vec::new();
        let mut cancelled = false;
        for (index, batch) in plan.batches.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(run = %run_key, batch = index, "deploy.aborted");
                cancelled = true;
                break;
            }

            let tasks = self.prepare(&graph, &state, batch, parameters, &accounts)?;
            if tasks.is_empty() {
                continue;
            }
            info!(run = %run_key, batch = index, size = tasks.len(), "batch.started");

            let outcomes = self.run_batch(&context, &graph, tasks).await?;
            for (id, outcome) in outcomes {
                match outcome {
                    TaskOutcome::Success(result) => {
                        executed.push(id.clone());
                        state.set(&id, FutureStatus::Success(result));
                    }
                    TaskOutcome::Failed(error) | TaskOutcome::TimedOut(error) => {
                        state.set(&id, FutureStatus::Failed(error));
                    }
                }
            }

            for (id, error) in state.cascade(&graph) {
                info!(future = %id, root = ?error.cascaded_from, "future.cascaded");
                let entry = JournalEntry::new(&run_key, &id, ExecutionState::Failed, EntryPayload::Error(error))
                    .with_attempt(attempt);
                self.journal.append(&entry).await?;
            }
        }

        let report = DeploymentReport::summarize(&graph, run_key, attempt, &state, executed, cancelled);
        info!(
            run = %report.run_key,
            outcome = %report.outcome,
            executed = report.executed.len(),
            failed = report.failed.len(),
            cascaded = report.cascaded.len(),
            "deploy.finished"
        );
        Ok(report)
    }

    /// Resolve every member of a batch before anything in it is submitted.
    fn prepare(
        &self,
        graph: &DeploymentGraph,
        state: &ReconciledState,
        batch: &Batch,
        parameters: &DeploymentParameters,
        accounts: &[String],
    ) -> Result<Vec<FutureTask>> {
        let resolver = Resolver {
            state,
            parameters,
            accounts,
        };
        let mut tasks = Vec::with_capacity(batch.len());
        for id in &batch.futures {
            let resume = match state.status(id) {
                FutureStatus::Pending { resume } => resume.clone(),
                // Failed by a cascade earlier in this run.
                _ => continue,
            };
            let Some(future) = graph.future(id) else {
                return Err(AnchorageError::Other(anyhow::anyhow!(
                    "planned future {id} is not part of the graph"
                )));
            };
            tasks.push(FutureTask {
                future: future.clone(),
                action: resolver.resolve(future)?,
                resume,
            });
        }
        Ok(tasks)
    }

    async fn run_batch(
        &self,
        context: &Arc<TaskContext>,
        graph: &DeploymentGraph,
        tasks: Vec<FutureTask>,
    ) -> Result<Vec<(FutureId, TaskOutcome)>> {
        let members: Vec<FutureId> = tasks.iter().map(|task| task.future.id.clone()).collect();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut set = JoinSet::new();
        let mut outcomes = Vec::with_capacity(members.len());

        let drive = async {
            for task in tasks {
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|error| AnchorageError::Other(error.into()))?;
                let context = Arc::clone(context);
                set.spawn(async move {
                    let _permit = permit;
                    run_future(context, task).await
                });
            }
            while let Some(joined) = set.join_next().await {
                outcomes.push(joined_outcome(joined)?);
            }
            Ok::<(), AnchorageError>(())
        };

        let Ok(driven) = tokio::time::timeout(self.config.batch_timeout(), drive).await else {
            warn!(run = %context.run_key, "batch.timed_out");
            set.abort_all();
            while let Some(joined) = set.join_next().await {
                match joined {
                    Err(error) if error.is_cancelled() => {}
                    joined => outcomes.push(joined_outcome(joined)?),
                }
            }
            for id in &members {
                if outcomes.iter().any(|(done, _)| done == id) {
                    continue;
                }
                let Some(future) = graph.future(id) else {
                    continue;
                };
                let error = ErrorDetail::timeout(
                    format!("batch not finished within {:?}", self.config.batch_timeout()),
                    context.tracked(id),
                );
                context
                    .record(future, ExecutionState::TimedOut, EntryPayload::Error(error.clone()))
                    .await?;
                outcomes.push((id.clone(), TaskOutcome::TimedOut(error)));
            }
            return Ok(outcomes);
        };
        driven?;
        Ok(outcomes)
    }
}

fn joined_outcome(
    joined: std::result::Result<
        std::result::Result<(FutureId, TaskOutcome), crate::error::JournalError>,
        JoinError,
    >,
) -> Result<(FutureId, TaskOutcome)> {
    match joined {
        Ok(outcome) => Ok(outcome?),
        Err(error) => Err(AnchorageError::Other(anyhow::anyhow!(
            "future task did not complete: {error}"
        ))),
    }
}
