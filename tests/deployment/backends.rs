use std::path::Path;
use std::sync::Arc;

use anchorage::chain::{ChainClient, SimulatedChain};
use anchorage::config::{ExecutionConfig, JournalBackend, JournalConfig};
use anchorage::journal::open_journal;
use anchorage::module::{DeploymentParameters, FutureId};
use anchorage::{Deployer, RunOutcome};
use tokio_util::sync::CancellationToken;

use super::deployment_harness::{NETWORK, token_module};

async fn deployer(backend: JournalBackend, dir: &Path, chain: &Arc<SimulatedChain>) -> Deployer {
    let config = JournalConfig {
        backend,
        dir: dir.to_path_buf(),
    };
    let journal = open_journal(&config, Path::new("."))
        .await
        .expect("journal opens");
    Deployer::new(
        journal,
        Arc::clone(chain) as Arc<dyn ChainClient>,
        ExecutionConfig::default(),
    )
}

/// Fail, wipe and finish a deployment, reopening the journal between steps.
async fn fail_wipe_finish(backend: JournalBackend) {
    let dir = tempfile::tempdir().expect("temp dir");
    let chain = Arc::new(SimulatedChain::with_accounts(1));
    let module = token_module();
    let params = DeploymentParameters::new();
    let mint = FutureId::from("Tokens#Token.mint");

    chain.revert_on("Token.mint");
    let first = deployer(backend, dir.path(), &chain)
        .await
        .deploy(&module, NETWORK, &params, &CancellationToken::new())
        .await
        .expect("first run reports");
    assert_eq!(first.outcome, RunOutcome::Failed);

    let reopened = deployer(backend, dir.path(), &chain).await;
    let status = reopened.status(&module, NETWORK).await.expect("status");
    assert_eq!(status.exports["token"].label(), "success");
    assert_eq!(status.exports["mint"].label(), "failed");
    let reset = reopened.wipe(&module, NETWORK, &mint).await.expect("wipe");
    assert_eq!(reset, vec![mint.clone()]);

    chain.clear_reverts();
    let last = deployer(backend, dir.path(), &chain)
        .await
        .deploy(&module, NETWORK, &params, &CancellationToken::new())
        .await
        .expect("last run reports");
    assert!(last.is_success(), "{last:?}");
    assert_eq!(last.attempt, 2);
    assert_eq!(last.executed, vec![mint]);
    assert_eq!(chain.submission_count(), 3);
}

#[tokio::test]
async fn jsonl_journal_survives_reopening() {
    fail_wipe_finish(JournalBackend::Jsonl).await;
}

#[tokio::test]
async fn sqlite_journal_survives_reopening() {
    fail_wipe_finish(JournalBackend::Sqlite).await;
}

#[tokio::test]
async fn abandoned_future_stays_abandoned_after_reopening() {
    let dir = tempfile::tempdir().expect("temp dir");
    let chain = Arc::new(SimulatedChain::with_accounts(1));
    chain.revert_on("Token");
    let module = token_module();
    let token = FutureId::from("Tokens#Token");

    let first = deployer(JournalBackend::Sqlite, dir.path(), &chain).await;
    first
        .deploy(&module, NETWORK, &DeploymentParameters::new(), &CancellationToken::new())
        .await
        .expect("run reports");
    let abandoned = first.abandon(&module, NETWORK, &token).await.expect("abandon");
    assert_eq!(abandoned.len(), 2);

    let reopened = deployer(JournalBackend::Sqlite, dir.path(), &chain).await;
    let report = reopened
        .deploy(&module, NETWORK, &DeploymentParameters::new(), &CancellationToken::new())
        .await
        .expect("run reports");
    assert_eq!(report.outcome, RunOutcome::Abandoned);
    assert_eq!(report.abandoned.len(), 2);
    assert_eq!(chain.submission_count(), 1);

    let status = reopened.status(&module, NETWORK).await.expect("status");
    assert!(status.is_terminal());
    assert!(status.futures.iter().all(|(_, status)| status.label() == "abandoned"));
}
