#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anchorage::chain::{ChainClient, SimulatedChain, TransactionIntent, TransactionRequest};
use anchorage::config::ExecutionConfig;
use anchorage::graph::DeploymentGraph;
use anchorage::journal::{
    EntryPayload, ExecutionState, InFlight, Journal, JournalEntry, MemoryJournal, RunKey,
    read_entries,
};
use anchorage::module::{
    ArgumentValue, CallOptions, ContractOptions, DeploymentFuture, DeploymentParameters, Module,
    build_module,
};
use anchorage::{DeploymentReport, Deployer};
use tokio_util::sync::CancellationToken;

pub const NETWORK: &str = "local";

/// `Token` deployed, then `mint(owner, 1000)` on it.
pub fn token_module() -> Module {
    build_module("Tokens", |m| {
        let owner = m.get_account(0);
        let token = m.contract("Token", [], ContractOptions::default());
        let mint = m.call(
            &token,
            "mint",
            [ArgumentValue::from(owner), ArgumentValue::from(1000_u64)],
            CallOptions::default(),
        );
        [("token", token), ("mint", mint)]
    })
    .expect("token module declares cleanly")
}

pub fn run_key(module: &Module) -> RunKey {
    RunKey::new(NETWORK, &module.id).expect("valid run key")
}

pub struct Harness {
    pub chain: Arc<SimulatedChain>,
    pub journal: Arc<dyn Journal>,
    pub deployer: Deployer,
}

impl Harness {
    pub fn new(accounts: usize) -> Self {
        Self::with_journal(accounts, Arc::new(MemoryJournal::new()), ExecutionConfig::default())
    }

    pub fn with_journal(accounts: usize, journal: Arc<dyn Journal>, config: ExecutionConfig) -> Self {
        let chain = Arc::new(SimulatedChain::with_accounts(accounts));
        let deployer = Deployer::new(
            Arc::clone(&journal),
            Arc::clone(&chain) as Arc<dyn ChainClient>,
            config,
        );
        Self {
            chain,
            journal,
            deployer,
        }
    }

    pub async fn deploy(&self, module: &Module) -> DeploymentReport {
        self.deploy_with(module, &DeploymentParameters::new(), &CancellationToken::new())
            .await
    }

    pub async fn deploy_with(
        &self,
        module: &Module,
        parameters: &DeploymentParameters,
        cancel: &CancellationToken,
    ) -> DeploymentReport {
        self.deployer
            .deploy(module, NETWORK, parameters, cancel)
            .await
            .expect("deployment runs to a report")
    }

    pub async fn entries(&self, module: &Module) -> Vec<JournalEntry> {
        read_entries(self.journal.as_ref(), &run_key(module))
            .await
            .expect("journal readable")
    }

    pub fn account(&self, index: usize) -> String {
        self.chain.account(index).expect("configured account")
    }

    /// Journal what a run that died while submitting `future` would have
    /// left behind: IN_PROGRESS with the signed hash, and with `broadcast`
    /// the transaction itself.
    pub async fn crash_during(&self, module: &Module, local: &str, broadcast: bool) -> InFlight {
        let (future, request) = self.next_deploy(module, local).await;
        let signed = self
            .chain
            .sign_transaction(&request)
            .await
            .expect("request signs");
        let in_flight = InFlight {
            sender: request.from.clone(),
            nonce: request.nonce,
            tx_hash: Some(signed.hash.clone()),
        };
        self.record_in_flight(module, &future, &in_flight).await;

        if broadcast {
            self.chain
                .send_raw_transaction(&signed)
                .await
                .expect("broadcast accepted");
        }
        in_flight
    }

    /// IN_PROGRESS with a nonce but no hash, as journals written before
    /// hashes were recorded ahead of the broadcast can hold.
    pub async fn crash_without_hash(&self, module: &Module, local: &str) -> (InFlight, TransactionRequest) {
        let (future, request) = self.next_deploy(module, local).await;
        let in_flight = InFlight {
            sender: request.from.clone(),
            nonce: request.nonce,
            tx_hash: None,
        };
        self.record_in_flight(module, &future, &in_flight).await;
        (in_flight, request)
    }

    async fn next_deploy(&self, module: &Module, local: &str) -> (DeploymentFuture, TransactionRequest) {
        let graph = DeploymentGraph::build(module).expect("valid graph");
        let future = graph
            .futures()
            .iter()
            .find(|future| future.id.local() == local)
            .expect("future declared")
            .clone();
        let sender = self.account(0);
        let nonce = self.chain.nonces(&sender).await.expect("nonces").pending;
        let request = TransactionRequest {
            from: sender,
            nonce,
            value: 0,
            intent: TransactionIntent::Deploy {
                contract: local.to_string(),
                args: Vec::new(),
                libraries: BTreeMap::new(),
            },
        };
        (future, request)
    }

    async fn record_in_flight(&self, module: &Module, future: &DeploymentFuture, in_flight: &InFlight) {
        let graph = DeploymentGraph::build(module).expect("valid graph");
        let entry = JournalEntry::new(
            &run_key(module),
            &future.id,
            ExecutionState::InProgress,
            EntryPayload::InFlight(in_flight.clone()),
        )
        .with_fingerprint(graph.fingerprint(&future.id).expect("future fingerprinted"))
        .with_attempt(1);
        self.journal.append(&entry).await.expect("journal append");
    }
}

pub fn states_of(entries: &[JournalEntry], local: &str) -> Vec<ExecutionState> {
    entries
        .iter()
        .filter(|entry| entry.future_id.local() == local)
        .map(|entry| entry.state)
        .collect()
}
