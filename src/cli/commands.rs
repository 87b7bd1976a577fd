use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// `anchorage` - declarative, resumable contract deployments.
#[derive(Parser, Debug)]
#[command(name = "anchorage")]
#[command(version)]
#[command(about = "Deploy contract modules and resume interrupted deployments.", long_about = None)]
pub struct Cli {
    /// Network and journal configuration
    #[arg(short, long, global = true, default_value = "anchorage.toml")]
    pub config: PathBuf,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Selects a module out of a manifest file.
#[derive(Args, Debug, Clone)]
pub struct ModuleArgs {
    /// Module manifest (TOML)
    pub manifest: PathBuf,

    /// Module to use when the manifest declares several (default: the last)
    #[arg(short, long)]
    pub module: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check a module manifest without touching any network
    Validate {
        #[command(flatten)]
        module: ModuleArgs,
    },

    /// Show the batches the next deployment would run
    Plan {
        #[command(flatten)]
        module: ModuleArgs,

        #[arg(short, long)]
        network: String,
    },

    /// Deploy a module, resuming from the journal
    Deploy {
        #[command(flatten)]
        module: ModuleArgs,

        #[arg(short, long)]
        network: String,

        /// JSON file with module parameters: {"Module": {"name": value}}
        #[arg(short, long)]
        parameters: Option<PathBuf>,
    },

    /// Show the journaled state of a deployment
    Status {
        #[command(flatten)]
        module: ModuleArgs,

        #[arg(short, long)]
        network: String,
    },

    /// Reset a failed future so the next deployment retries it
    Wipe {
        #[command(flatten)]
        module: ModuleArgs,

        #[arg(short, long)]
        network: String,

        /// Future id, e.g. `MyNFTCollection#MyNFTCollection`
        future: String,
    },

    /// Give up on a future and its dependents
    Abandon {
        #[command(flatten)]
        module: ModuleArgs,

        #[arg(short, long)]
        network: String,

        /// Future id, e.g. `MyNFTCollection#MyNFTCollection`
        future: String,
    },
}
