//! Durable, append-only execution journal.
//!
//! Every state change of every future is one [`JournalEntry`]. Entries are
//! never updated or deleted: a later entry for the same future supersedes the
//! earlier ones, and a run's full state is rebuilt by a sequential scan.

mod jsonl;
mod memory;
mod sqlite;

pub use jsonl::JsonlJournal;
pub use memory::MemoryJournal;
pub use sqlite::SqliteJournal;

use crate::chain::Receipt;
use crate::config::{JournalBackend, JournalConfig};
use crate::error::{ChainError, JournalError};
use crate::module::{FutureId, FutureKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Identifies one deployment run: a module deployed to one network.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RunKey {
    network: String,
    module: String,
}

impl RunKey {
    pub fn new(network: &str, module: &str) -> Result<Self, JournalError> {
        for part in [network, module] {
            if part.is_empty() || part.contains('/') || part.contains('\\') || part.starts_with('.') {
                return Err(JournalError::Storage(format!(
                    "invalid run key component {part:?}"
                )));
            }
        }
        Ok(Self {
            network: network.to_string(),
            module: module.to_string(),
        })
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn module(&self) -> &str {
        &self.module
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.module)
    }
}

impl FromStr for RunKey {
    type Err = JournalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (network, module) = value
            .split_once('/')
            .ok_or_else(|| JournalError::Storage(format!("invalid run key {value:?}")))?;
        Self::new(network, module)
    }
}

impl From<RunKey> for String {
    fn from(key: RunKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for RunKey {
    type Error = JournalError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Pending,
    InProgress,
    Success,
    Failed,
    TimedOut,
    Abandoned,
}

impl ExecutionState {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }
}

/// Identifying data of a broadcast (or about to be broadcast) transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlight {
    pub sender: String,
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

/// Concrete on-chain outcome of a successful future.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FutureResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl FutureResult {
    pub fn contract(address: impl Into<String>, tx_hash: Option<String>) -> Self {
        Self {
            address: Some(address.into()),
            tx_hash,
            value: None,
        }
    }

    pub fn transaction(tx_hash: impl Into<String>) -> Self {
        Self {
            tx_hash: Some(tx_hash.into()),
            ..Self::default()
        }
    }

    pub fn value(value: serde_json::Value) -> Self {
        Self {
            value: Some(value),
            ..Self::default()
        }
    }

    /// Result of a successfully mined transaction sent by a future of `kind`.
    pub fn from_receipt(kind: FutureKind, receipt: &Receipt) -> Self {
        match (&receipt.contract_address, kind.yields_address()) {
            (Some(address), true) => Self::contract(address.clone(), Some(receipt.tx_hash.clone())),
            _ => Self::transaction(receipt.tx_hash.clone()),
        }
    }

    /// The value another future receives when it references this one.
    pub fn as_argument(&self) -> Option<serde_json::Value> {
        self.address
            .clone()
            .map(serde_json::Value::String)
            .or_else(|| self.value.clone())
            .or_else(|| self.tx_hash.clone().map(serde_json::Value::String))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Reverted,
    InsufficientFunds,
    Rpc,
    Timeout,
    Cascaded,
    NonceConflict,
    Reconciliation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    /// Root failure this entry was cascaded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascaded_from: Option<FutureId>,
    /// Transaction still unaccounted for when the failure was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<InFlight>,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cascaded_from: None,
            in_flight: None,
        }
    }

    pub fn cascaded(root: &FutureId) -> Self {
        Self {
            cascaded_from: Some(root.clone()),
            ..Self::new(ErrorKind::Cascaded, format!("dependency {root} failed"))
        }
    }

    pub fn timeout(message: impl Into<String>, in_flight: Option<InFlight>) -> Self {
        Self {
            in_flight,
            ..Self::new(ErrorKind::Timeout, message)
        }
    }

    /// Root of a cascade, or the failing future itself.
    pub fn root<'a>(&'a self, own: &'a FutureId) -> &'a FutureId {
        self.cascaded_from.as_ref().unwrap_or(own)
    }
}

impl From<&ChainError> for ErrorDetail {
    fn from(error: &ChainError) -> Self {
        let kind = match error {
            ChainError::Reverted(_) => ErrorKind::Reverted,
            ChainError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            ChainError::NonceMismatch { .. } => ErrorKind::NonceConflict,
            ChainError::NotFound(_) | ChainError::Rpc(_) => ErrorKind::Rpc,
        };
        Self::new(kind, error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPayload {
    Empty,
    InFlight(InFlight),
    Result(FutureResult),
    Error(ErrorDetail),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub run_key: RunKey,
    pub future_id: FutureId,
    pub recorded_at: DateTime<Utc>,
    pub state: ExecutionState,
    pub payload: EntryPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Run attempt (1-based) that wrote the entry.
    #[serde(default)]
    pub attempt: u32,
}

impl JournalEntry {
    pub fn new(
        run_key: &RunKey,
        future_id: &FutureId,
        state: ExecutionState,
        payload: EntryPayload,
    ) -> Self {
        Self {
            run_key: run_key.clone(),
            future_id: future_id.clone(),
            recorded_at: Utc::now(),
            state,
            payload,
            fingerprint: None,
            attempt: 0,
        }
    }

    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn in_flight(&self) -> Option<&InFlight> {
        match &self.payload {
            EntryPayload::InFlight(in_flight) => Some(in_flight),
            EntryPayload::Error(detail) => detail.in_flight.as_ref(),
            EntryPayload::Empty | EntryPayload::Result(_) => None,
        }
    }

    pub fn result(&self) -> Option<&FutureResult> {
        match &self.payload {
            EntryPayload::Result(result) => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorDetail> {
        match &self.payload {
            EntryPayload::Error(detail) => Some(detail),
            _ => None,
        }
    }

    pub fn is_cascaded(&self) -> bool {
        self.error().is_some_and(|detail| detail.cascaded_from.is_some())
    }
}

pub type EntryStream<'a> = BoxStream<'a, Result<JournalEntry, JournalError>>;

/// Append-only store of journal entries.
///
/// `append` must be durable before it resolves, and a read issued after it
/// resolves must observe the entry.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn append(&self, entry: &JournalEntry) -> Result<(), JournalError>;

    /// Lazy scan of every entry of a run, in append order. Each call starts a
    /// fresh scan.
    fn entries_for<'a>(&'a self, run_key: &'a RunKey) -> EntryStream<'a>;
}

/// Drain `entries_for` into memory.
pub async fn read_entries(
    journal: &dyn Journal,
    run_key: &RunKey,
) -> Result<Vec<JournalEntry>, JournalError> {
    journal.entries_for(run_key).try_collect().await
}

/// Open the configured backend under `base_dir`.
pub async fn open_journal(
    config: &JournalConfig,
    base_dir: &Path,
) -> Result<Arc<dyn Journal>, JournalError> {
    let dir = if config.dir.is_absolute() {
        config.dir.clone()
    } else {
        base_dir.join(&config.dir)
    };

    let journal: Arc<dyn Journal> = match config.backend {
        JournalBackend::Sqlite => Arc::new(SqliteJournal::open(&dir.join("journal.db")).await?),
        JournalBackend::Jsonl => Arc::new(JsonlJournal::new(dir)),
        JournalBackend::Memory => Arc::new(MemoryJournal::new()),
    };
    tracing::debug!(backend = %config.backend, "journal.opened");
    Ok(journal)
}
