use std::sync::Arc;
use std::time::Duration;

use anchorage::chain::{
    AccountNonces, CallRequest, ChainClient, EventArgumentQuery, SignedTransaction, SimulatedChain,
    TransactionRequest, TransactionStatus,
};
use anchorage::config::ExecutionConfig;
use anchorage::error::ChainError;
use anchorage::journal::{ErrorKind, ExecutionState, Journal, MemoryJournal};
use anchorage::module::{DeploymentParameters, FutureId};
use anchorage::{Deployer, RunOutcome};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::deployment_harness::{Harness, states_of, token_module};

/// Cancels the run as soon as anything is broadcast.
struct CancelOnSend {
    inner: Arc<SimulatedChain>,
    cancel: CancellationToken,
}

#[async_trait]
impl ChainClient for CancelOnSend {
    async fn accounts(&self) -> Result<Vec<String>, ChainError> {
        self.inner.accounts().await
    }

    async fn nonces(&self, account: &str) -> Result<AccountNonces, ChainError> {
        self.inner.nonces(account).await
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.inner.block_number().await
    }

    async fn sign_transaction(&self, request: &TransactionRequest) -> Result<SignedTransaction, ChainError> {
        self.inner.sign_transaction(request).await
    }

    async fn send_raw_transaction(&self, signed: &SignedTransaction) -> Result<(), ChainError> {
        self.cancel.cancel();
        self.inner.send_raw_transaction(signed).await
    }

    async fn transaction_status(&self, tx_hash: &str) -> Result<TransactionStatus, ChainError> {
        self.inner.transaction_status(tx_hash).await
    }

    async fn static_call(&self, request: &CallRequest) -> Result<Value, ChainError> {
        self.inner.static_call(request).await
    }

    async fn event_argument(&self, query: &EventArgumentQuery) -> Result<Value, ChainError> {
        self.inner.event_argument(query).await
    }

    fn poll_interval(&self) -> Duration {
        self.inner.poll_interval()
    }
}

fn quick_timeouts() -> ExecutionConfig {
    ExecutionConfig {
        future_timeout_ms: 50,
        ..ExecutionConfig::default()
    }
}

#[tokio::test]
async fn timed_out_transaction_is_confirmed_by_the_next_run() {
    let harness = Harness::with_journal(1, Arc::new(MemoryJournal::new()), quick_timeouts());
    harness.chain.set_auto_mine(false);
    let module = token_module();

    let first = harness.deploy(&module).await;
    assert_eq!(first.outcome, RunOutcome::Failed);
    assert_eq!(first.failed[0].error.kind, ErrorKind::Timeout);
    let hash = first.failed[0]
        .error
        .in_flight
        .as_ref()
        .and_then(|in_flight| in_flight.tx_hash.clone());
    assert!(hash.is_some());
    assert_eq!(first.cascaded, vec![FutureId::from("Tokens#Token.mint")]);

    harness.chain.mine_pending();
    harness.chain.set_auto_mine(true);
    let second = harness.deploy(&module).await;

    assert!(second.is_success(), "{second:?}");
    assert_eq!(second.executed, vec![FutureId::from("Tokens#Token.mint")]);
    assert_eq!(second.results[&FutureId::from("Tokens#Token")].tx_hash, hash);
    assert_eq!(harness.chain.submission_count(), 2);

    let entries = harness.entries(&module).await;
    assert_eq!(
        states_of(&entries, "Token.mint"),
        vec![
            ExecutionState::Failed,
            ExecutionState::Pending,
            ExecutionState::InProgress,
            ExecutionState::Success
        ]
    );
}

#[tokio::test]
async fn cancelled_run_stops_between_batches_and_resumes() {
    let chain = Arc::new(SimulatedChain::with_accounts(1));
    let journal: Arc<dyn Journal> = Arc::new(MemoryJournal::new());
    let cancel = CancellationToken::new();
    let module = token_module();

    let interrupted = Deployer::new(
        Arc::clone(&journal),
        Arc::new(CancelOnSend {
            inner: Arc::clone(&chain),
            cancel: cancel.clone(),
        }),
        ExecutionConfig::default(),
    );
    let report = interrupted
        .deploy(&module, "local", &DeploymentParameters::new(), &cancel)
        .await
        .expect("aborted run still reports");

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(report.executed, vec![FutureId::from("Tokens#Token")]);
    assert_eq!(report.not_started, vec![FutureId::from("Tokens#Token.mint")]);
    assert_eq!(chain.submission_count(), 1);

    let resumed = Deployer::new(journal, Arc::clone(&chain) as Arc<dyn ChainClient>, ExecutionConfig::default());
    let report = resumed
        .deploy(&module, "local", &DeploymentParameters::new(), &CancellationToken::new())
        .await
        .expect("resumed run reports");

    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.attempt, 2);
    assert_eq!(report.executed, vec![FutureId::from("Tokens#Token.mint")]);
    assert_eq!(chain.submission_count(), 2);
}

#[tokio::test]
async fn unreachable_chain_fails_before_anything_is_journaled() {
    let harness = Harness::new(1);
    harness.chain.set_unavailable(true);
    let module = token_module();

    let err = harness
        .deployer
        .deploy(&module, "local", &DeploymentParameters::new(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, anchorage::AnchorageError::Chain(ChainError::Rpc(_))));
    assert!(harness.entries(&module).await.is_empty());
}

#[tokio::test]
async fn missing_account_is_reported_up_front() {
    let harness = Harness::new(1);
    let module = anchorage::build_module("Pair", |m| {
        let b = m.contract(
            "B",
            [],
            anchorage::module::ContractOptions {
                from: Some(anchorage::module::AccountRef(3)),
                ..Default::default()
            },
        );
        [("b", b)]
    })
    .expect("module declares");

    let err = harness
        .deployer
        .deploy(&module, "local", &DeploymentParameters::new(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("account 3"), "{err}");
    assert_eq!(harness.chain.submission_count(), 0);
}
