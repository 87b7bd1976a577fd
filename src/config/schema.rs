use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

// ── Top-level config ─────────────────────────────────────────────

/// Contents of `anchorage.toml`, passed explicitly to the engine and the
/// chain client. Nothing here is read from global state after loading.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Path the config was loaded from. Relative paths resolve against its
    /// directory.
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub journal: JournalConfig,

    #[serde(default)]
    pub toolchain: ToolchainConfig,
}

// ── Networks ─────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// RPC endpoint for the chain client.
    pub url: String,
    /// Signing credentials, in account-index order.
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub chain_id: Option<u64>,
    /// Run against the in-process simulated chain instead of `url`.
    #[serde(default)]
    pub simulated: bool,
}

impl fmt::Debug for NetworkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkConfig")
            .field("url", &self.url)
            .field("accounts", &format_args!("[{} redacted]", self.accounts.len()))
            .field("chain_id", &self.chain_id)
            .field("simulated", &self.simulated)
            .finish()
    }
}

// ── Execution ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Futures of one batch running at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// How long one future waits for its receipt.
    #[serde(default = "default_future_timeout_ms")]
    pub future_timeout_ms: u64,
    /// Upper bound for a whole batch.
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u64,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_future_timeout_ms() -> u64 {
    300_000
}

fn default_batch_timeout_ms() -> u64 {
    900_000
}

fn default_required_confirmations() -> u64 {
    1
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            future_timeout_ms: default_future_timeout_ms(),
            batch_timeout_ms: default_batch_timeout_ms(),
            required_confirmations: default_required_confirmations(),
        }
    }
}

impl ExecutionConfig {
    pub fn future_timeout(&self) -> Duration {
        Duration::from_millis(self.future_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

// ── Journal ──────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JournalBackend {
    #[default]
    Sqlite,
    Jsonl,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default)]
    pub backend: JournalBackend,
    #[serde(default = "default_journal_dir")]
    pub dir: PathBuf,
}

fn default_journal_dir() -> PathBuf {
    PathBuf::from("deployments")
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            backend: JournalBackend::default(),
            dir: default_journal_dir(),
        }
    }
}

// ── Toolchain ────────────────────────────────────────────────────

/// Compiler settings, carried for the compiler collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolchainConfig {
    #[serde(default)]
    pub solidity: Option<String>,
}
