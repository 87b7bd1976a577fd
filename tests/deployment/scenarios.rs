use std::time::Duration;

use anchorage::RunOutcome;
use anchorage::journal::{ErrorKind, ExecutionState};
use anchorage::module::{AccountRef, ArgumentValue, ContractOptions, DeploymentParameters, FutureId, build_module};
use tokio_util::sync::CancellationToken;

use super::deployment_harness::{Harness, NETWORK, states_of, token_module};

#[tokio::test]
async fn reverted_deploy_never_submits_mint() {
    let harness = Harness::new(1);
    harness.chain.revert_on("Token");
    let module = token_module();

    let report = harness.deploy(&module).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, FutureId::from("Tokens#Token"));
    assert_eq!(report.failed[0].error.kind, ErrorKind::Reverted);
    assert_eq!(report.cascaded, vec![FutureId::from("Tokens#Token.mint")]);

    let submissions = harness.chain.submissions();
    assert_eq!(submissions.len(), 1);

    let entries = harness.entries(&module).await;
    assert_eq!(states_of(&entries, "Token.mint"), vec![ExecutionState::Failed]);
    assert!(entries.iter().any(|entry| entry.is_cascaded()));
}

#[tokio::test]
async fn successful_run_exposes_exports() {
    let harness = Harness::new(1);
    let module = token_module();

    let report = harness.deploy(&module).await;
    assert!(report.is_success(), "{report:?}");

    let status = harness.deployer.status(&module, NETWORK).await.unwrap();
    assert!(status.is_terminal());
    assert_eq!(status.exports["token"].label(), "success");
    assert_eq!(status.exports["mint"].label(), "success");
}

#[tokio::test]
async fn independent_deploys_from_different_accounts_run_together() {
    let harness = Harness::new(2);
    harness.chain.set_auto_mine(false);
    let module = build_module("Pair", |m| {
        let a = m.contract("A", [], ContractOptions::default());
        let b = m.contract(
            "B",
            [],
            ContractOptions {
                from: Some(AccountRef(1)),
                ..ContractOptions::default()
            },
        );
        [("a", a), ("b", b)]
    })
    .unwrap();

    let plan = harness.deployer.preview_plan(&module, NETWORK).await.unwrap();
    assert_eq!(plan.batches.len(), 1);

    let miner = async {
        for _ in 0..400 {
            if harness.chain.pending_count() == 2 {
                harness.chain.mine_pending();
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        harness.chain.mine_pending();
        false
    };
    let (report, both_pending) = tokio::join!(harness.deploy(&module), miner);

    assert!(both_pending);
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.executed.len(), 2);
}

#[tokio::test]
async fn second_run_over_finished_journal_is_a_no_op() {
    let harness = Harness::new(1);
    let module = token_module();

    let first = harness.deploy(&module).await;
    assert!(first.is_success());
    let submissions = harness.chain.submission_count();
    let entries = harness.entries(&module).await.len();

    let second = harness.deploy(&module).await;
    assert!(second.is_success());
    assert!(second.executed.is_empty());
    assert_eq!(second.results, first.results);
    assert_eq!(harness.chain.submission_count(), submissions);
    assert_eq!(harness.entries(&module).await.len(), entries);
}

#[tokio::test]
async fn failed_run_resumes_after_wipe() {
    let harness = Harness::new(1);
    harness.chain.revert_on("Token.mint");
    let module = token_module();

    let first = harness.deploy(&module).await;
    assert_eq!(first.failed.len(), 1);
    assert_eq!(first.failed[0].id, FutureId::from("Tokens#Token.mint"));

    // Nothing is retried until the failure is wiped.
    let again = harness.deploy(&module).await;
    assert_eq!(again.outcome, RunOutcome::Failed);
    assert_eq!(harness.chain.submission_count(), 2);

    harness.chain.clear_reverts();
    harness
        .deployer
        .wipe(&module, NETWORK, &FutureId::from("Tokens#Token.mint"))
        .await
        .unwrap();
    let last = harness.deploy(&module).await;

    assert!(last.is_success(), "{last:?}");
    assert_eq!(last.executed, vec![FutureId::from("Tokens#Token.mint")]);
    assert_eq!(harness.chain.submission_count(), 3);
}

#[tokio::test]
async fn changed_module_is_rejected_before_execution() {
    let harness = Harness::new(1);
    let original = token_module();
    assert!(harness.deploy(&original).await.is_success());

    let changed = build_module("Tokens", |m| {
        let token = m.contract("Token", [ArgumentValue::from(7_u64)], ContractOptions::default());
        [("token", token)]
    })
    .unwrap();
    let err = harness
        .deployer
        .deploy(
            &changed,
            NETWORK,
            &DeploymentParameters::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(err.to_string().contains("Tokens#Token"), "{err}");
    assert_eq!(harness.chain.submission_count(), 2);
}
