use super::Deployer;
use crate::error::{AnchorageError, Result};
use crate::graph::DeploymentGraph;
use crate::journal::{EntryPayload, ExecutionState, JournalEntry, RunKey, read_entries};
use crate::module::{FutureId, Module};
use crate::planner::{self, ExecutionPlan};
use crate::reconciler::{FutureStatus, ReconciledState};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

/// Journal view of one run, read without touching the chain.
#[derive(Debug, Clone)]
pub struct DeploymentStatus {
    pub run_key: RunKey,
    /// Export name → status of the exported future.
    pub exports: BTreeMap<String, FutureStatus>,
    /// Every future in declaration order.
    pub futures: Vec<(FutureId, FutureStatus)>,
}

impl DeploymentStatus {
    /// Every future succeeded or was abandoned.
    pub fn is_terminal(&self) -> bool {
        self.futures
            .iter()
            .all(|(_, status)| matches!(status, FutureStatus::Success(_) | FutureStatus::Abandoned))
    }
}

struct RunView {
    graph: DeploymentGraph,
    run_key: RunKey,
    entries: Vec<JournalEntry>,
}

impl RunView {
    fn latest(&self) -> HashMap<&FutureId, &JournalEntry> {
        let mut latest = HashMap::new();
        for entry in &self.entries {
            latest.insert(&entry.future_id, entry);
        }
        latest
    }

    fn attempt(&self) -> u32 {
        self.entries.iter().map(|entry| entry.attempt).max().unwrap_or(0)
    }
}

fn rejected(operation: &'static str, future: &FutureId, reason: impl Into<String>) -> AnchorageError {
    AnchorageError::Rejected {
        operation,
        future: future.to_string(),
        reason: reason.into(),
    }
}

impl Deployer {
    async fn view(&self, module: &Module, network: &str) -> Result<RunView> {
        let graph = DeploymentGraph::build(module)?;
        let run_key = RunKey::new(network, graph.module_id())?;
        let entries = read_entries(self.journal.as_ref(), &run_key).await?;
        Ok(RunView {
            graph,
            run_key,
            entries,
        })
    }

    pub async fn status(&self, module: &Module, network: &str) -> Result<DeploymentStatus> {
        let view = self.view(module, network).await?;
        let state = ReconciledState::from_journal(&view.graph, &view.entries);
        let exports = view
            .graph
            .exports()
            .iter()
            .map(|(name, future)| (name.clone(), state.status(future.id()).clone()))
            .collect();
        let futures = view
            .graph
            .futures()
            .iter()
            .map(|future| (future.id.clone(), state.status(&future.id).clone()))
            .collect();
        Ok(DeploymentStatus {
            run_key: view.run_key,
            exports,
            futures,
        })
    }

    /// What the next run would execute if nothing in flight changed state.
    pub async fn preview_plan(&self, module: &Module, network: &str) -> Result<ExecutionPlan> {
        let view = self.view(module, network).await?;
        let state = ReconciledState::from_journal(&view.graph, &view.entries);
        Ok(planner::plan(&view.graph, &state)?)
    }

    /// Reset a failed, timed-out or abandoned future so the next run
    /// retries it, along with the dependents that only failed because of it.
    /// Returns the reset futures. A timed-out submission is left to the next
    /// deploy, which reconciles it against the chain.
    pub async fn wipe(&self, module: &Module, network: &str, future: &FutureId) -> Result<Vec<FutureId>> {
        let view = self.view(module, network).await?;
        if !view.graph.contains(future) {
            return Err(rejected("wipe", future, format!("not part of module {}", view.graph.module_id())));
        }
        let latest = view.latest();
        let Some(target) = latest.get(future) else {
            return Err(rejected("wipe", future, "it has no journal entries"));
        };
        if !matches!(
            target.state,
            ExecutionState::Failed | ExecutionState::TimedOut | ExecutionState::Abandoned
        ) {
            return Err(rejected("wipe", future, format!("its last entry is {}", target.state)));
        }
        if let (ExecutionState::TimedOut, Some(in_flight)) = (target.state, target.in_flight()) {
            return Err(rejected(
                "wipe",
                future,
                format!(
                    "its transaction at nonce {} may still land; run deploy to reconcile it first",
                    in_flight.nonce
                ),
            ));
        }
        let was_abandoned = target.state == ExecutionState::Abandoned;

        let mut reset = vec![future.clone()];
        for dependent in view.graph.transitive_dependents(future) {
            let Some(entry) = latest.get(&dependent.id) else {
                continue;
            };
            let follows = entry.is_cascaded() || (was_abandoned && entry.state == ExecutionState::Abandoned);
            if follows {
                reset.push(dependent.id.clone());
            }
        }

        let attempt = view.attempt();
        for id in &reset {
            let entry = JournalEntry::new(&view.run_key, id, ExecutionState::Pending, EntryPayload::Empty)
                .with_attempt(attempt);
            self.journal.append(&entry).await?;
        }
        info!(run = %view.run_key, future = %future, reset = reset.len(), "journal.wiped");
        Ok(reset)
    }

    /// Give up on a future and everything depending on it that has not
    /// succeeded. Returns the abandoned futures.
    pub async fn abandon(&self, module: &Module, network: &str, future: &FutureId) -> Result<Vec<FutureId>> {
        let view = self.view(module, network).await?;
        if !view.graph.contains(future) {
            return Err(rejected("abandon", future, format!("not part of module {}", view.graph.module_id())));
        }
        let latest = view.latest();
        let state_of = |id: &FutureId| latest.get(id).map(|entry| entry.state);
        match state_of(future) {
            Some(ExecutionState::Success) => {
                return Err(rejected("abandon", future, "it already succeeded"));
            }
            Some(ExecutionState::InProgress) => {
                return Err(rejected(
                    "abandon",
                    future,
                    "a transaction may still be in flight; run deploy to reconcile it first",
                ));
            }
            _ => {}
        }

        let mut abandoned = Vec::new();
        let targets = std::iter::once(future.clone()).chain(
            view.graph
                .transitive_dependents(future)
                .into_iter()
                .map(|dependent| dependent.id.clone()),
        );
        for id in targets {
            if matches!(
                state_of(&id),
                Some(ExecutionState::Success | ExecutionState::Abandoned)
            ) {
                continue;
            }
            abandoned.push(id);
        }

        let attempt = view.attempt();
        for id in &abandoned {
            let entry = JournalEntry::new(&view.run_key, id, ExecutionState::Abandoned, EntryPayload::Empty)
                .with_attempt(attempt);
            self.journal.append(&entry).await?;
        }
        info!(run = %view.run_key, future = %future, abandoned = abandoned.len(), "journal.abandoned");
        Ok(abandoned)
    }
}
