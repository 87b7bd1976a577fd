//! Rebuilds per-future state from the journal before every run.

mod policy;

pub use policy::{InFlightObservation, InFlightVerdict, NonceReusePolicy, ReconciliationPolicy};

use crate::chain::ChainClient;
use crate::error::ReconciliationError;
use crate::graph::DeploymentGraph;
use crate::journal::{
    EntryPayload, ErrorDetail, ErrorKind, ExecutionState, FutureResult, InFlight, JournalEntry,
    RunKey,
};
use crate::module::{DeploymentFuture, FutureId};
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum FutureStatus {
    /// To be executed. `resume` carries a broadcast transaction to wait on
    /// instead of submitting a new one.
    Pending { resume: Option<InFlight> },
    Success(FutureResult),
    Failed(ErrorDetail),
    Abandoned,
}

static PENDING: FutureStatus = FutureStatus::Pending { resume: None };

impl FutureStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending { resume: None } => "pending",
            Self::Pending { resume: Some(_) } => "in-progress",
            Self::Success(_) => "success",
            Self::Failed(_) => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Status of every future of a run. Futures without a status are pending.
#[derive(Debug, Clone, Default)]
pub struct ReconciledState {
    statuses: HashMap<FutureId, FutureStatus>,
}

impl ReconciledState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, id: &FutureId) -> &FutureStatus {
        self.statuses.get(id).unwrap_or(&PENDING)
    }

    pub fn set(&mut self, id: &FutureId, status: FutureStatus) {
        self.statuses.insert(id.clone(), status);
    }

    pub fn result(&self, id: &FutureId) -> Option<&FutureResult> {
        match self.statuses.get(id) {
            Some(FutureStatus::Success(result)) => Some(result),
            _ => None,
        }
    }

    /// Fold the journal without consulting the chain: in-flight futures are
    /// reported as resumable, failures are cascaded to pending dependents.
    pub fn from_journal(graph: &DeploymentGraph, entries: &[JournalEntry]) -> Self {
        let latest = latest_entries(entries);
        let mut state = Self::new();
        for future in graph.futures() {
            if let Some(entry) = latest.get(&future.id) {
                state.set(&future.id, offline_status(entry));
            }
        }
        state.reopen_recovered();
        state.cascade(graph);
        state
    }

    /// Futures that only failed because of a root which has since succeeded
    /// or been reset go back to pending. Returns them in id order.
    fn reopen_recovered(&mut self) -> Vec<FutureId> {
        let mut reopened: Vec<FutureId> = self
            .statuses
            .iter()
            .filter_map(|(id, status)| match status {
                FutureStatus::Failed(ErrorDetail {
                    cascaded_from: Some(root),
                    ..
                }) if !matches!(
                    self.status(root),
                    FutureStatus::Failed(_) | FutureStatus::Abandoned
                ) =>
                {
                    Some(id.clone())
                }
                _ => None,
            })
            .collect();
        reopened.sort();
        for id in &reopened {
            self.set(id, FutureStatus::Pending { resume: None });
        }
        reopened
    }

    /// Mark pending transitive dependents of every failed future as failed,
    /// roots in declaration order. Returns the newly failed futures.
    pub(crate) fn cascade(&mut self, graph: &DeploymentGraph) -> Vec<(FutureId, ErrorDetail)> {
        let mut cascaded = Vec::new();
        for future in graph.futures() {
            let root = match self.status(&future.id) {
                FutureStatus::Failed(detail) => detail.root(&future.id).clone(),
                _ => continue,
            };
            for dependent in graph.transitive_dependents(&future.id) {
                if self.status(&dependent.id).is_pending() {
                    let detail = ErrorDetail::cascaded(&root);
                    self.set(&dependent.id, FutureStatus::Failed(detail.clone()));
                    cascaded.push((dependent.id.clone(), detail));
                }
            }
        }
        cascaded
    }
}

fn latest_entries(entries: &[JournalEntry]) -> HashMap<&FutureId, &JournalEntry> {
    let mut latest = HashMap::new();
    for entry in entries {
        latest.insert(&entry.future_id, entry);
    }
    latest
}

fn failure_detail(entry: &JournalEntry) -> ErrorDetail {
    entry.error().cloned().unwrap_or_else(|| {
        ErrorDetail::new(
            if entry.state == ExecutionState::TimedOut {
                ErrorKind::Timeout
            } else {
                ErrorKind::Reconciliation
            },
            format!("recorded {} without error detail", entry.state),
        )
    })
}

fn offline_status(entry: &JournalEntry) -> FutureStatus {
    match entry.state {
        ExecutionState::Pending => FutureStatus::Pending { resume: None },
        ExecutionState::InProgress => FutureStatus::Pending {
            resume: entry.in_flight().cloned(),
        },
        ExecutionState::Success => {
            FutureStatus::Success(entry.result().cloned().unwrap_or_default())
        }
        ExecutionState::Failed | ExecutionState::TimedOut => {
            FutureStatus::Failed(failure_detail(entry))
        }
        ExecutionState::Abandoned => FutureStatus::Abandoned,
    }
}

/// Outcome of reconciliation: the state to plan from, plus entries the
/// engine must append before executing anything.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub state: ReconciledState,
    pub synthesized: Vec<JournalEntry>,
}

pub struct Reconciler<'a> {
    chain: &'a dyn ChainClient,
    policy: &'a dyn ReconciliationPolicy,
    run_key: &'a RunKey,
    attempt: u32,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        chain: &'a dyn ChainClient,
        policy: &'a dyn ReconciliationPolicy,
        run_key: &'a RunKey,
        attempt: u32,
    ) -> Self {
        Self {
            chain,
            policy,
            run_key,
            attempt,
        }
    }

    pub async fn reconcile(
        &self,
        graph: &DeploymentGraph,
        entries: &[JournalEntry],
    ) -> Result<Reconciliation, ReconciliationError> {
        let latest = latest_entries(entries);
        for entry in entries {
            if !graph.contains(&entry.future_id) {
                warn!(future = %entry.future_id, run = %self.run_key, "reconcile.unknown_future");
            }
        }
        check_fingerprints(graph, entries, &latest)?;

        let mut state = ReconciledState::new();
        let mut synthesized = Vec::new();

        for future in graph.futures() {
            let Some(entry) = latest.get(&future.id) else {
                continue;
            };
            // A timed-out transaction may still land, or already has.
            let in_flight = match entry.state {
                ExecutionState::InProgress | ExecutionState::TimedOut => entry.in_flight(),
                _ => None,
            };
            let status = match in_flight {
                Some(in_flight) => {
                    self.reconcile_in_flight(graph, future, in_flight, &mut synthesized)
                        .await?
                }
                None => offline_status(entry),
            };
            debug!(future = %future.id, status = status.label(), "reconcile.status");
            state.set(&future.id, status);
        }

        for id in state.reopen_recovered() {
            info!(future = %id, "reconcile.reopened");
            synthesized.push(
                JournalEntry::new(self.run_key, &id, ExecutionState::Pending, EntryPayload::Empty)
                    .with_attempt(self.attempt),
            );
        }

        for (id, detail) in state.cascade(graph) {
            info!(future = %id, root = ?detail.cascaded_from, "reconcile.cascaded");
            synthesized.push(
                JournalEntry::new(self.run_key, &id, ExecutionState::Failed, EntryPayload::Error(detail))
                    .with_attempt(self.attempt),
            );
        }

        Ok(Reconciliation { state, synthesized })
    }

    async fn reconcile_in_flight(
        &self,
        graph: &DeploymentGraph,
        future: &DeploymentFuture,
        in_flight: &InFlight,
        synthesized: &mut Vec<JournalEntry>,
    ) -> Result<FutureStatus, ReconciliationError> {
        let query_error = |source| ReconciliationError::ChainQuery {
            future: future.id.to_string(),
            source,
        };
        let transaction = match &in_flight.tx_hash {
            Some(hash) => Some(
                self.chain
                    .transaction_status(hash)
                    .await
                    .map_err(query_error)?,
            ),
            None => None,
        };
        let nonces = self
            .chain
            .nonces(&in_flight.sender)
            .await
            .map_err(query_error)?;

        let verdict = self.policy.classify(&InFlightObservation {
            future,
            in_flight,
            transaction,
            nonces,
        });
        info!(future = %future.id, nonce = in_flight.nonce, verdict = verdict_label(&verdict), "reconcile.in_flight");

        Ok(match verdict {
            InFlightVerdict::Confirmed(receipt) => {
                let result = FutureResult::from_receipt(future.kind(), &receipt);
                synthesized.push(self.success_entry(graph, future, &result));
                FutureStatus::Success(result)
            }
            InFlightVerdict::Failed(detail) => {
                synthesized.push(
                    JournalEntry::new(
                        self.run_key,
                        &future.id,
                        ExecutionState::Failed,
                        EntryPayload::Error(detail.clone()),
                    )
                    .with_attempt(self.attempt),
                );
                FutureStatus::Failed(detail)
            }
            InFlightVerdict::Resume => FutureStatus::Pending {
                resume: Some(in_flight.clone()),
            },
            InFlightVerdict::Retry => FutureStatus::Pending { resume: None },
        })
    }

    fn success_entry(&self, graph: &DeploymentGraph, future: &DeploymentFuture, result: &FutureResult) -> JournalEntry {
        let entry = JournalEntry::new(
            self.run_key,
            &future.id,
            ExecutionState::Success,
            EntryPayload::Result(result.clone()),
        )
        .with_attempt(self.attempt);
        match graph.fingerprint(&future.id) {
            Some(fingerprint) => entry.with_fingerprint(fingerprint),
            None => entry,
        }
    }
}

fn verdict_label(verdict: &InFlightVerdict) -> &'static str {
    match verdict {
        InFlightVerdict::Confirmed(_) => "confirmed",
        InFlightVerdict::Failed(_) => "failed",
        InFlightVerdict::Resume => "resume",
        InFlightVerdict::Retry => "retry",
    }
}

/// A future whose progress is journaled must still have the definition it
/// was journaled with.
fn check_fingerprints(
    graph: &DeploymentGraph,
    entries: &[JournalEntry],
    latest: &HashMap<&FutureId, &JournalEntry>,
) -> Result<(), ReconciliationError> {
    let mut recorded: HashMap<&FutureId, &str> = HashMap::new();
    for entry in entries {
        if let Some(fingerprint) = &entry.fingerprint {
            recorded.insert(&entry.future_id, fingerprint);
        }
    }

    for future in graph.futures() {
        let guarded = latest.get(&future.id).is_some_and(|entry| {
            matches!(
                entry.state,
                ExecutionState::Success | ExecutionState::InProgress | ExecutionState::TimedOut
            )
        });
        let (Some(recorded), Some(declared)) = (recorded.get(&future.id), graph.fingerprint(&future.id)) else {
            continue;
        };
        if guarded && *recorded != declared {
            return Err(ReconciliationError::DefinitionChanged {
                future: future.id.to_string(),
                recorded: (*recorded).to_string(),
                declared: declared.to_string(),
            });
        }
    }
    Ok(())
}
