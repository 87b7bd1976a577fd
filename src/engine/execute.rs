use super::resolve::ResolvedAction;
use crate::chain::{ChainClient, TransactionIntent, TransactionStatus};
use crate::error::{ChainError, JournalError};
use crate::journal::{
    EntryPayload, ErrorDetail, ErrorKind, ExecutionState, FutureResult, InFlight, Journal,
    JournalEntry, RunKey,
};
use crate::module::{DeploymentFuture, FutureId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

/// Shared by every future task of a run.
pub(crate) struct TaskContext {
    pub journal: Arc<dyn Journal>,
    pub chain: Arc<dyn ChainClient>,
    pub run_key: RunKey,
    pub attempt: u32,
    pub future_timeout: Duration,
    pub confirmations: u64,
    /// Definition fingerprints, journaled with IN_PROGRESS and SUCCESS.
    pub fingerprints: HashMap<FutureId, String>,
    /// Broadcast-but-unfinished transactions, for entries written on behalf
    /// of tasks cut off by the batch timeout.
    pub in_flight: Mutex<HashMap<FutureId, InFlight>>,
}

impl TaskContext {
    fn track(&self, id: &FutureId, in_flight: &InFlight) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), in_flight.clone());
    }

    fn untrack(&self, id: &FutureId) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub(crate) fn tracked(&self, id: &FutureId) -> Option<InFlight> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub(crate) async fn record(
        &self,
        future: &DeploymentFuture,
        state: ExecutionState,
        payload: EntryPayload,
    ) -> Result<(), JournalError> {
        let mut entry =
            JournalEntry::new(&self.run_key, &future.id, state, payload).with_attempt(self.attempt);
        if matches!(state, ExecutionState::InProgress | ExecutionState::Success) {
            if let Some(fingerprint) = self.fingerprints.get(&future.id) {
                entry = entry.with_fingerprint(fingerprint.clone());
            }
        }
        self.journal.append(&entry).await
    }
}

pub(crate) struct FutureTask {
    pub future: DeploymentFuture,
    pub action: ResolvedAction,
    /// Transaction broadcast by an earlier run that is still pending.
    pub resume: Option<InFlight>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TaskOutcome {
    Success(FutureResult),
    Failed(ErrorDetail),
    TimedOut(ErrorDetail),
}

impl TaskOutcome {
    pub(crate) fn state(&self) -> ExecutionState {
        match self {
            Self::Success(_) => ExecutionState::Success,
            Self::Failed(_) => ExecutionState::Failed,
            Self::TimedOut(_) => ExecutionState::TimedOut,
        }
    }
}

/// Run one future to a journaled outcome. Only journal failures escape.
pub(crate) async fn run_future(
    context: Arc<TaskContext>,
    task: FutureTask,
) -> Result<(FutureId, TaskOutcome), JournalError> {
    let FutureTask {
        future,
        action,
        resume,
    } = task;

    let outcome = match action {
        ResolvedAction::Transaction {
            sender,
            value,
            intent,
        } => send_and_confirm(&context, &future, &sender, value, &intent, resume).await?,
        ResolvedAction::StaticCall(request) => {
            let call = context.chain.static_call(&request);
            read_outcome(&context, tokio::time::timeout(context.future_timeout, call).await)
        }
        ResolvedAction::ReadEvent(query) => {
            let read = context.chain.event_argument(&query);
            read_outcome(&context, tokio::time::timeout(context.future_timeout, read).await)
        }
        ResolvedAction::Bind { address } => TaskOutcome::Success(FutureResult::contract(address, None)),
    };

    let payload = match &outcome {
        TaskOutcome::Success(result) => EntryPayload::Result(result.clone()),
        TaskOutcome::Failed(detail) | TaskOutcome::TimedOut(detail) => EntryPayload::Error(detail.clone()),
    };
    context.record(&future, outcome.state(), payload).await?;
    context.untrack(&future.id);

    match &outcome {
        TaskOutcome::Success(_) => info!(future = %future.id, "future.succeeded"),
        TaskOutcome::Failed(detail) => {
            warn!(future = %future.id, kind = %detail.kind, error = %detail.message, "future.failed");
        }
        TaskOutcome::TimedOut(detail) => {
            warn!(future = %future.id, error = %detail.message, "future.timed_out");
        }
    }
    Ok((future.id, outcome))
}

fn read_outcome<E>(
    context: &TaskContext,
    result: Result<Result<serde_json::Value, ChainError>, E>,
) -> TaskOutcome {
    match result {
        Ok(Ok(value)) => TaskOutcome::Success(FutureResult::value(value)),
        Ok(Err(error)) => TaskOutcome::Failed(ErrorDetail::from(&error)),
        Err(_) => TaskOutcome::TimedOut(ErrorDetail::timeout(
            format!("no answer within {:?}", context.future_timeout),
            None,
        )),
    }
}

/// The transaction is signed first and IN_PROGRESS is journaled with its
/// hash before the broadcast, so a crash at any point leaves a hash the next
/// run can look up.
async fn send_and_confirm(
    context: &TaskContext,
    future: &DeploymentFuture,
    sender: &str,
    value: u128,
    intent: &TransactionIntent,
    resume: Option<InFlight>,
) -> Result<TaskOutcome, JournalError> {
    let (in_flight, tx_hash) = match resume {
        Some(in_flight) => match in_flight.tx_hash.clone() {
            Some(tx_hash) => {
                info!(future = %future.id, tx = %tx_hash, "future.resumed");
                context.track(&future.id, &in_flight);
                (in_flight, tx_hash)
            }
            None => match recover_hash(context, future, value, intent, in_flight).await {
                Ok(in_flight) => {
                    let tx_hash = in_flight.tx_hash.clone().unwrap_or_default();
                    context.track(&future.id, &in_flight);
                    context
                        .record(future, ExecutionState::InProgress, EntryPayload::InFlight(in_flight.clone()))
                        .await?;
                    (in_flight, tx_hash)
                }
                Err(outcome) => return Ok(outcome),
            },
        },
        None => {
            let nonce = match context.chain.nonces(sender).await {
                Ok(nonces) => nonces.pending,
                Err(error) => return Ok(TaskOutcome::Failed(ErrorDetail::from(&error))),
            };
            let request = ResolvedAction::request(sender, nonce, value, intent);
            let signed = match context.chain.sign_transaction(&request).await {
                Ok(signed) => signed,
                Err(error) => return Ok(TaskOutcome::Failed(ErrorDetail::from(&error))),
            };

            let in_flight = InFlight {
                sender: sender.to_string(),
                nonce,
                tx_hash: Some(signed.hash.clone()),
            };
            context.track(&future.id, &in_flight);
            context
                .record(future, ExecutionState::InProgress, EntryPayload::InFlight(in_flight.clone()))
                .await?;

            match context.chain.send_raw_transaction(&signed).await {
                Ok(()) => {}
                // The node may have taken it anyway: leave it to reconciliation.
                Err(error @ ChainError::Rpc(_)) => {
                    return Ok(TaskOutcome::TimedOut(ErrorDetail {
                        in_flight: Some(in_flight),
                        ..ErrorDetail::new(
                            ErrorKind::Rpc,
                            format!("broadcast of {} unacknowledged: {error}", signed.hash),
                        )
                    }));
                }
                Err(error) => return Ok(TaskOutcome::Failed(ErrorDetail::from(&error))),
            }
            info!(future = %future.id, tx = %signed.hash, nonce, "future.submitted");
            (in_flight, signed.hash)
        }
    };

    let waited = tokio::time::timeout(
        context.future_timeout,
        context.chain.wait_for_receipt(&tx_hash, context.confirmations),
    )
    .await;

    Ok(match waited {
        Ok(Ok(receipt)) if receipt.success => {
            TaskOutcome::Success(FutureResult::from_receipt(future.kind(), &receipt))
        }
        Ok(Ok(receipt)) => TaskOutcome::Failed(ErrorDetail {
            in_flight: Some(in_flight),
            ..ErrorDetail::new(
                ErrorKind::Reverted,
                receipt
                    .revert_reason
                    .unwrap_or_else(|| "transaction reverted".into()),
            )
        }),
        // Broadcast but unobservable: stop waiting and let the next
        // reconciliation look the hash up again.
        Ok(Err(error)) => TaskOutcome::TimedOut(ErrorDetail {
            in_flight: Some(in_flight),
            ..ErrorDetail::new(ErrorKind::Rpc, format!("lost track of {tx_hash}: {error}"))
        }),
        Err(_) => TaskOutcome::TimedOut(ErrorDetail::timeout(
            format!("{tx_hash} not confirmed within {:?}", context.future_timeout),
            Some(in_flight),
        )),
    })
}

/// A submission journaled without its hash whose nonce has since been used.
/// Signing is deterministic, so signing the same request again yields the
/// hash the lost broadcast had; if the chain knows it, the transaction was
/// this future's.
async fn recover_hash(
    context: &TaskContext,
    future: &DeploymentFuture,
    value: u128,
    intent: &TransactionIntent,
    mut in_flight: InFlight,
) -> Result<InFlight, TaskOutcome> {
    let request = ResolvedAction::request(&in_flight.sender, in_flight.nonce, value, intent);
    let signed = context
        .chain
        .sign_transaction(&request)
        .await
        .map_err(|error| TaskOutcome::Failed(ErrorDetail::from(&error)))?;

    match context.chain.transaction_status(&signed.hash).await {
        Ok(TransactionStatus::Pending | TransactionStatus::Mined(_)) => {
            info!(future = %future.id, tx = %signed.hash, nonce = in_flight.nonce, "future.recovered");
            in_flight.tx_hash = Some(signed.hash);
            Ok(in_flight)
        }
        Ok(TransactionStatus::Unknown) => Err(TaskOutcome::Failed(ErrorDetail {
            in_flight: Some(in_flight.clone()),
            ..ErrorDetail::new(
                ErrorKind::NonceConflict,
                format!(
                    "nonce {} of {} was consumed by a transaction this run cannot account for",
                    in_flight.nonce, in_flight.sender
                ),
            )
        })),
        Err(error) => Err(TaskOutcome::TimedOut(ErrorDetail {
            in_flight: Some(in_flight),
            ..ErrorDetail::new(ErrorKind::Rpc, format!("looking up the recorded nonce failed: {error}"))
        })),
    }
}
