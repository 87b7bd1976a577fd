use std::path::PathBuf;

use anchorage::chain::TransactionIntent;
use anchorage::graph::DeploymentGraph;
use anchorage::module::{DeploymentParameters, FutureId, manifest};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::deployment_harness::Harness;

fn demo(path: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos").join(path)
}

#[tokio::test]
async fn demo_sale_deploys_with_parameters() {
    let module = manifest::load_module(&demo("modules/Tokens.toml"), Some("Sale")).expect("manifest loads");
    let params = DeploymentParameters::from_json_file(&demo("parameters.json")).expect("parameters load");
    let graph = DeploymentGraph::build(&module).expect("graph builds");
    let harness = Harness::new(2);

    let report = harness.deploy_with(&module, &params, &CancellationToken::new()).await;

    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.results.len(), graph.len());

    let submissions = harness.chain.submissions();
    let token = submissions
        .iter()
        .find_map(|request| match &request.intent {
            TransactionIntent::Deploy {
                contract,
                args,
                libraries,
            } if contract == "Token" => Some((args.clone(), libraries.clone())),
            _ => None,
        })
        .expect("token deployed");
    assert_eq!(token.0, vec![json!(2_000_000)]);
    assert!(token.1.contains_key("SafeMath"));

    let sale = submissions
        .iter()
        .find(|request| matches!(&request.intent, TransactionIntent::Deploy { contract, .. } if contract == "Sale"))
        .expect("sale deployed");
    assert_eq!(sale.from, harness.account(1));

    let transferred = &report.results[&FutureId::from("Sale#Token.Transfer.value.0")];
    assert_eq!(transferred.value, Some(json!("Transfer.value#0")));
}

#[tokio::test]
async fn demo_without_parameters_uses_defaults() {
    let module = manifest::load_module(&demo("modules/Tokens.toml"), Some("Token")).expect("manifest loads");
    let harness = Harness::new(1);

    let report = harness.deploy(&module).await;

    assert!(report.is_success(), "{report:?}");
    let symbol = &report.results[&FutureId::from("Token#Token.symbol")];
    assert_eq!(symbol.value, Some(json!("Token.symbol()")));
    let deployed_supply = harness.chain.submissions().iter().find_map(|request| match &request.intent {
        TransactionIntent::Deploy { contract, args, .. } if contract == "Token" => args.first().cloned(),
        _ => None,
    });
    assert_eq!(deployed_supply, Some(json!(1_000_000)));
}
