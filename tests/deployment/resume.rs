use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anchorage::AnchorageError;
use anchorage::chain::{ChainClient, SimulatedChain, TransactionIntent, TransactionRequest};
use anchorage::config::ExecutionConfig;
use anchorage::journal::{ErrorKind, ExecutionState, MemoryJournal};
use anchorage::module::FutureId;

use super::deployment_harness::{Harness, NETWORK, states_of, token_module};

fn quick_timeouts() -> ExecutionConfig {
    ExecutionConfig {
        future_timeout_ms: 50,
        ..ExecutionConfig::default()
    }
}

fn token_deploys(chain: &SimulatedChain) -> usize {
    chain
        .submissions()
        .into_iter()
        .filter(|request| matches!(&request.intent, TransactionIntent::Deploy { contract, .. } if contract == "Token"))
        .count()
}

async fn keep_mining(chain: &SimulatedChain) {
    loop {
        chain.mine_pending();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn confirmed_transaction_is_not_resubmitted() {
    let harness = Harness::new(1);
    let module = token_module();
    let in_flight = harness.crash_during(&module, "Token", true).await;

    let report = harness.deploy(&module).await;

    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.executed, vec![FutureId::from("Tokens#Token.mint")]);
    assert_eq!(harness.chain.submission_count(), 2);
    let token = &report.results[&FutureId::from("Tokens#Token")];
    assert_eq!(token.tx_hash, in_flight.tx_hash);
    assert_eq!(
        states_of(&harness.entries(&module).await, "Token"),
        vec![ExecutionState::InProgress, ExecutionState::Success]
    );
}

#[tokio::test]
async fn dropped_transaction_is_submitted_once_more() {
    let harness = Harness::new(1);
    harness.chain.set_auto_mine(false);
    let module = token_module();
    harness.crash_during(&module, "Token", true).await;
    harness.chain.drop_pending();
    harness.chain.set_auto_mine(true);

    let report = harness.deploy(&module).await;

    assert!(report.is_success(), "{report:?}");
    assert_eq!(token_deploys(&harness.chain), 2);
    assert_eq!(harness.chain.submission_count(), 3);
}

#[tokio::test]
async fn pending_transaction_is_awaited_not_replaced() {
    let harness = Harness::new(1);
    harness.chain.set_auto_mine(false);
    let module = token_module();
    let in_flight = harness.crash_during(&module, "Token", true).await;

    let report = tokio::select! {
        report = harness.deploy(&module) => report,
        () = keep_mining(&harness.chain) => unreachable!("mining never stops"),
    };

    assert!(report.is_success(), "{report:?}");
    assert_eq!(harness.chain.submission_count(), 2);
    assert_eq!(
        report.results[&FutureId::from("Tokens#Token")].tx_hash,
        in_flight.tx_hash
    );
}

#[tokio::test]
async fn consumed_nonce_fails_without_resubmitting() {
    let harness = Harness::new(1);
    let module = token_module();
    let in_flight = harness.crash_during(&module, "Token", false).await;

    // Something outside this deployment used the recorded nonce.
    harness
        .chain
        .send_transaction(&TransactionRequest {
            from: in_flight.sender.clone(),
            nonce: in_flight.nonce,
            value: 1,
            intent: TransactionIntent::Send {
                to: harness.account(0),
                data: None,
            },
        })
        .await
        .expect("foreign transaction accepted");

    let report = harness.deploy(&module).await;

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].error.kind, ErrorKind::NonceConflict);
    assert_eq!(report.failed[0].error.in_flight.as_ref(), Some(&in_flight));
    assert_eq!(report.cascaded, vec![FutureId::from("Tokens#Token.mint")]);
    assert_eq!(harness.chain.submission_count(), 1);
}

#[tokio::test]
async fn unrecorded_hash_is_recovered_from_the_nonce() {
    let harness = Harness::new(1);
    let module = token_module();
    let (_, request) = harness.crash_without_hash(&module, "Token").await;
    let hash = harness
        .chain
        .send_transaction(&request)
        .await
        .expect("lost broadcast accepted");

    let report = harness.deploy(&module).await;

    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.results[&FutureId::from("Tokens#Token")].tx_hash.as_deref(), Some(hash.as_str()));
    assert_eq!(harness.chain.submission_count(), 2);
    let entries = harness.entries(&module).await;
    assert_eq!(
        states_of(&entries, "Token"),
        vec![ExecutionState::InProgress, ExecutionState::InProgress, ExecutionState::Success]
    );
}

#[tokio::test]
async fn unrecorded_hash_with_foreign_transaction_conflicts() {
    let harness = Harness::new(1);
    let module = token_module();
    let (in_flight, _) = harness.crash_without_hash(&module, "Token").await;
    harness
        .chain
        .send_transaction(&TransactionRequest {
            from: in_flight.sender.clone(),
            nonce: in_flight.nonce,
            value: 1,
            intent: TransactionIntent::Send {
                to: harness.account(0),
                data: None,
            },
        })
        .await
        .expect("foreign transaction accepted");

    let report = harness.deploy(&module).await;

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].error.kind, ErrorKind::NonceConflict);
    assert_eq!(harness.chain.submission_count(), 1);
}

#[tokio::test]
async fn timed_out_transaction_cannot_be_wiped_while_pending() {
    let harness = Harness::with_journal(1, Arc::new(MemoryJournal::new()), quick_timeouts());
    harness.chain.set_auto_mine(false);
    let module = token_module();
    let token = FutureId::from("Tokens#Token");

    let first = harness.deploy(&module).await;
    assert_eq!(first.failed[0].error.kind, ErrorKind::Timeout);
    let second = harness.deploy(&module).await;
    assert_eq!(second.failed[0].error.kind, ErrorKind::Timeout);

    let err = harness.deployer.wipe(&module, NETWORK, &token).await.unwrap_err();
    assert!(matches!(err, AnchorageError::Rejected { operation: "wipe", .. }), "{err}");

    harness.chain.mine_pending();
    harness.chain.set_auto_mine(true);
    let third = harness.deploy(&module).await;

    assert!(third.is_success(), "{third:?}");
    assert_eq!(token_deploys(&harness.chain), 1);
    let first_hash = first.failed[0]
        .error
        .in_flight
        .as_ref()
        .and_then(|in_flight| in_flight.tx_hash.clone());
    assert_eq!(third.results[&token].tx_hash, first_hash);
}

#[tokio::test]
async fn timed_out_transaction_that_was_dropped_is_resubmitted() {
    let harness = Harness::with_journal(1, Arc::new(MemoryJournal::new()), quick_timeouts());
    harness.chain.set_auto_mine(false);
    let module = token_module();

    let first = harness.deploy(&module).await;
    assert_eq!(first.failed[0].error.kind, ErrorKind::Timeout);
    harness.chain.drop_pending();
    harness.chain.set_auto_mine(true);

    let second = harness.deploy(&module).await;

    assert!(second.is_success(), "{second:?}");
    assert_eq!(token_deploys(&harness.chain), 2);
    assert_eq!(harness.chain.nonces(&harness.account(0)).await.unwrap().latest, 2);
}

#[tokio::test]
async fn interruption_before_broadcast_retries_with_the_same_nonce() {
    let harness = Harness::new(1);
    let module = token_module();
    let in_flight = harness.crash_during(&module, "Token", false).await;

    let report = harness.deploy(&module).await;

    assert!(report.is_success(), "{report:?}");
    let submissions = harness.chain.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].nonce, in_flight.nonce);
    assert_eq!(
        submissions[0].intent,
        TransactionIntent::Deploy {
            contract: "Token".into(),
            args: Vec::new(),
            libraries: BTreeMap::new(),
        }
    );
}
