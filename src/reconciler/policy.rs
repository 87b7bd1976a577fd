use crate::chain::{AccountNonces, Receipt, TransactionStatus};
use crate::journal::{ErrorDetail, ErrorKind, InFlight};
use crate::module::DeploymentFuture;

/// Everything known about an interrupted submission at reconciliation time.
#[derive(Debug)]
pub struct InFlightObservation<'a> {
    pub future: &'a DeploymentFuture,
    pub in_flight: &'a InFlight,
    /// `None` when no hash was journaled.
    pub transaction: Option<TransactionStatus>,
    pub nonces: AccountNonces,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InFlightVerdict {
    /// Mined successfully: record SUCCESS, do not resubmit.
    Confirmed(Receipt),
    /// Unsafe or pointless to retry.
    Failed(ErrorDetail),
    /// Still pending: wait on the recorded hash instead of resubmitting.
    /// Without a recorded hash, the executor signs the same request again to
    /// find out whether the transaction at that nonce is this one.
    Resume,
    /// Never landed and its nonce is free: submit again.
    Retry,
}

/// Decides what an interrupted submission means. Replacement and nonce
/// rules differ between chains, so this is swappable per deployer.
pub trait ReconciliationPolicy: Send + Sync {
    fn classify(&self, observation: &InFlightObservation<'_>) -> InFlightVerdict;
}

/// Account-nonce rules: a transaction that is gone is only retried while
/// its nonce is still unused.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonceReusePolicy;

impl ReconciliationPolicy for NonceReusePolicy {
    fn classify(&self, observation: &InFlightObservation<'_>) -> InFlightVerdict {
        let in_flight = observation.in_flight;
        match &observation.transaction {
            Some(TransactionStatus::Mined(receipt)) if receipt.success => {
                InFlightVerdict::Confirmed(receipt.clone())
            }
            Some(TransactionStatus::Mined(receipt)) => InFlightVerdict::Failed(ErrorDetail {
                in_flight: Some(in_flight.clone()),
                ..ErrorDetail::new(
                    ErrorKind::Reverted,
                    receipt
                        .revert_reason
                        .clone()
                        .unwrap_or_else(|| "transaction reverted".into()),
                )
            }),
            Some(TransactionStatus::Pending) => InFlightVerdict::Resume,
            None if observation.nonces.pending > in_flight.nonce => InFlightVerdict::Resume,
            Some(TransactionStatus::Unknown) | None => {
                if observation.nonces.pending > in_flight.nonce {
                    InFlightVerdict::Failed(ErrorDetail {
                        in_flight: Some(in_flight.clone()),
                        ..ErrorDetail::new(
                            ErrorKind::NonceConflict,
                            format!(
                                "nonce {} of {} was consumed by a transaction this run cannot account for",
                                in_flight.nonce, in_flight.sender
                            ),
                        )
                    })
                } else {
                    InFlightVerdict::Retry
                }
            }
        }
    }
}
