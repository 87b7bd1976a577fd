use crate::app::render::{render_plan, render_report, render_status};
use crate::cli::commands::{Cli, Commands, ModuleArgs};
use anchorage::chain::{
    AccountNonces, CallRequest, ChainClient, EventArgumentQuery, SignedTransaction, SimulatedChain,
    TransactionRequest, TransactionStatus,
};
use anchorage::config::{Config, JournalBackend, JournalConfig};
use anchorage::engine::Deployer;
use anchorage::error::ChainError;
use anchorage::graph::DeploymentGraph;
use anchorage::journal::open_journal;
use anchorage::module::{DeploymentParameters, FutureId, Module, manifest};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Stand-in for networks whose RPC client is linked through the library.
/// Journal-only commands never reach it.
struct UnlinkedChain {
    network: String,
}

impl UnlinkedChain {
    fn error(&self) -> ChainError {
        ChainError::Rpc(format!(
            "no chain client is linked for network {}; deploy RPC networks through the library",
            self.network
        ))
    }
}

#[async_trait]
impl ChainClient for UnlinkedChain {
    async fn accounts(&self) -> Result<Vec<String>, ChainError> {
        Err(self.error())
    }

    async fn nonces(&self, _account: &str) -> Result<AccountNonces, ChainError> {
        Err(self.error())
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        Err(self.error())
    }

    async fn sign_transaction(&self, _request: &TransactionRequest) -> Result<SignedTransaction, ChainError> {
        Err(self.error())
    }

    async fn send_raw_transaction(&self, _signed: &SignedTransaction) -> Result<(), ChainError> {
        Err(self.error())
    }

    async fn transaction_status(&self, _tx_hash: &str) -> Result<TransactionStatus, ChainError> {
        Err(self.error())
    }

    async fn static_call(&self, _request: &CallRequest) -> Result<Value, ChainError> {
        Err(self.error())
    }

    async fn event_argument(&self, _query: &EventArgumentQuery) -> Result<Value, ChainError> {
        Err(self.error())
    }
}

/// Chain state of a simulated network, kept next to its journal so both
/// describe the same chain from one invocation to the next. Without a state
/// path it lives as long as the process, like a memory journal.
struct SimulatedNetwork {
    chain: Arc<SimulatedChain>,
    state_path: Option<PathBuf>,
}

impl SimulatedNetwork {
    fn ephemeral(credentials: &[String]) -> Self {
        Self {
            chain: Arc::new(SimulatedChain::from_credentials(credentials)),
            state_path: None,
        }
    }

    async fn open(journal_dir: &Path, network: &str, credentials: &[String]) -> Result<Self> {
        let state_path = journal_dir.join(format!("{network}.chain.json"));
        let fresh = SimulatedChain::from_credentials(credentials);
        let chain = match tokio::fs::read_to_string(&state_path).await {
            Ok(snapshot) => {
                let restored = SimulatedChain::restore(&snapshot)
                    .with_context(|| format!("Failed to restore simulated chain from {}", state_path.display()))?;
                if restored.accounts().await? != fresh.accounts().await? {
                    bail!(
                        "simulated chain at {} was created with other accounts; delete it to start over",
                        state_path.display()
                    );
                }
                debug!(path = %state_path.display(), "simulated.restored");
                restored
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => fresh,
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("Failed to read simulated chain state {}", state_path.display()));
            }
        };
        Ok(Self {
            chain: Arc::new(chain),
            state_path: Some(state_path),
        })
    }

    async fn save(&self) -> Result<()> {
        let Some(state_path) = &self.state_path else {
            return Ok(());
        };
        let snapshot = self.chain.snapshot().context("Failed to encode simulated chain state")?;
        if let Some(parent) = state_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(state_path, snapshot)
            .await
            .with_context(|| format!("Failed to write simulated chain state {}", state_path.display()))
    }
}

/// Engine for one network, plus the simulated chain to persist afterwards.
struct Target {
    deployer: Deployer,
    simulated: Option<SimulatedNetwork>,
}

impl Target {
    async fn open(config: &Config, network: &str) -> Result<Self> {
        let settings = config.network(network)?;
        let journal_dir = config.journal_dir();
        let journal = open_journal(
            &JournalConfig {
                backend: config.journal.backend,
                dir: journal_dir.clone(),
            },
            Path::new("."),
        )
        .await
        .context("Failed to open the deployment journal")?;

        let (chain, simulated): (Arc<dyn ChainClient>, _) = if settings.simulated {
            let simulated = if config.journal.backend == JournalBackend::Memory {
                SimulatedNetwork::ephemeral(&settings.accounts)
            } else {
                SimulatedNetwork::open(&journal_dir, network, &settings.accounts).await?
            };
            (Arc::clone(&simulated.chain) as Arc<dyn ChainClient>, Some(simulated))
        } else {
            let chain = Arc::new(UnlinkedChain {
                network: network.to_string(),
            });
            (chain as Arc<dyn ChainClient>, None)
        };
        info!(network, simulated = settings.simulated, "network.selected");
        Ok(Self {
            deployer: Deployer::new(journal, chain, config.execution.clone()),
            simulated,
        })
    }

    async fn save(&self) -> Result<()> {
        match &self.simulated {
            Some(simulated) => simulated.save().await,
            None => Ok(()),
        }
    }
}

fn load_module(args: &ModuleArgs) -> Result<Module> {
    manifest::load_module(&args.manifest, args.module.as_deref())
        .with_context(|| format!("Failed to load module from {}", args.manifest.display()))
}

pub async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let config_path = cli.config;
    let load_config = || Config::load(&config_path);

    match cli.command {
        Commands::Validate { module } => {
            let module = load_module(&module)?;
            let graph = DeploymentGraph::build(&module)?;
            println!(
                "{}: {} futures, {} exports",
                graph.module_id(),
                graph.len(),
                graph.exports().len()
            );
            Ok(())
        }

        Commands::Plan { module, network } => {
            let module = load_module(&module)?;
            let target = Target::open(&load_config()?, &network).await?;
            let plan = target.deployer.preview_plan(&module, &network).await?;
            println!("{}", render_plan(&plan));
            Ok(())
        }

        Commands::Deploy {
            module,
            network,
            parameters,
        } => {
            let module = load_module(&module)?;
            let parameters = match parameters {
                Some(path) => DeploymentParameters::from_json_file(&path)?,
                None => DeploymentParameters::new(),
            };
            let target = Target::open(&load_config()?, &network).await?;
            let deployed = target
                .deployer
                .deploy(&module, &network, &parameters, &cancel)
                .await;
            target.save().await?;
            let report = deployed?;

            let graph = DeploymentGraph::build(&module)?;
            println!("{}", render_report(&graph, &report));
            if !report.is_success() {
                bail!("deployment {} finished as {}", report.run_key, report.outcome);
            }
            Ok(())
        }

        Commands::Status { module, network } => {
            let module = load_module(&module)?;
            let target = Target::open(&load_config()?, &network).await?;
            let status = target.deployer.status(&module, &network).await?;
            println!("{}", render_status(&status));
            Ok(())
        }

        Commands::Wipe {
            module,
            network,
            future,
        } => {
            let module = load_module(&module)?;
            let target = Target::open(&load_config()?, &network).await?;
            let reset = target
                .deployer
                .wipe(&module, &network, &FutureId::from(future.as_str()))
                .await?;
            for id in reset {
                println!("reset {id}");
            }
            Ok(())
        }

        Commands::Abandon {
            module,
            network,
            future,
        } => {
            let module = load_module(&module)?;
            let target = Target::open(&load_config()?, &network).await?;
            let abandoned = target
                .deployer
                .abandon(&module, &network, &FutureId::from(future.as_str()))
                .await?;
            for id in abandoned {
                println!("abandoned {id}");
            }
            Ok(())
        }
    }
}
