use super::{EntryPayload, EntryStream, ExecutionState, Journal, JournalEntry, RunKey};
use crate::error::JournalError;
use async_trait::async_trait;
use crate::module::FutureId;
use chrono::{DateTime, Utc};
use futures_util::{Stream, TryStreamExt};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use std::path::Path;

const JOURNAL_SCHEMA_META_TABLE: &str = "
CREATE TABLE IF NOT EXISTS journal_schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";
const JOURNAL_SCHEMA_VERSION_KEY: &str = "journal_schema_version";
const JOURNAL_SCHEMA_VERSION: u32 = 1;

/// SQLite-backed journal. Append-only is enforced by triggers, not just by
/// the absence of an update API.
pub struct SqliteJournal {
    pool: SqlitePool,
}

async fn ensure_journal_schema_version(pool: &SqlitePool) -> Result<(), JournalError> {
    sqlx::query(JOURNAL_SCHEMA_META_TABLE).execute(pool).await?;

    let stored_version: Option<(String,)> =
        sqlx::query_as("SELECT value FROM journal_schema_meta WHERE key = $1")
            .bind(JOURNAL_SCHEMA_VERSION_KEY)
            .fetch_optional(pool)
            .await?;

    if let Some((value,)) = stored_version {
        let parsed = value.parse::<u32>().map_err(|_| JournalError::Corrupt {
            position: "journal_schema_meta".into(),
            reason: format!("invalid schema version value: {value}"),
        })?;
        if parsed != JOURNAL_SCHEMA_VERSION {
            return Err(JournalError::Storage(format!(
                "incompatible journal schema version: stored={parsed}, expected={JOURNAL_SCHEMA_VERSION}"
            )));
        }
        return Ok(());
    }

    sqlx::query("INSERT INTO journal_schema_meta (key, value) VALUES ($1, $2)")
        .bind(JOURNAL_SCHEMA_VERSION_KEY)
        .bind(JOURNAL_SCHEMA_VERSION.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

impl SqliteJournal {
    /// Open (creating if needed) a journal database file.
    pub async fn open(path: &Path) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await?;
        Self::new(pool).await
    }

    /// Wrap an existing pool and run migrations.
    pub async fn new(pool: SqlitePool) -> Result<Self, JournalError> {
        ensure_journal_schema_version(&pool).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS journal_entries (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_key TEXT NOT NULL,
                 future_id TEXT NOT NULL,
                 recorded_at TEXT NOT NULL,
                 state TEXT NOT NULL,
                 payload TEXT NOT NULL,
                 fingerprint TEXT,
                 attempt INTEGER NOT NULL DEFAULT 0
             )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_journal_entries_run
                 ON journal_entries(run_key, seq)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TRIGGER IF NOT EXISTS journal_entries_no_update
                 BEFORE UPDATE ON journal_entries
             BEGIN
                 SELECT RAISE(ABORT, 'journal entries are append-only');
             END",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TRIGGER IF NOT EXISTS journal_entries_no_delete
                 BEFORE DELETE ON journal_entries
             BEGIN
                 SELECT RAISE(ABORT, 'journal entries are append-only');
             END",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn map_entry_row(row: &SqliteRow) -> Result<JournalEntry, JournalError> {
    let seq: i64 = row.try_get("seq")?;
    let corrupt = |reason: String| JournalError::Corrupt {
        position: format!("journal_entries seq {seq}"),
        reason,
    };

    let run_key_raw: String = row.try_get("run_key")?;
    let future_id: String = row.try_get("future_id")?;
    let recorded_raw: String = row.try_get("recorded_at")?;
    let state_raw: String = row.try_get("state")?;
    let payload_raw: String = row.try_get("payload")?;
    let attempt: i64 = row.try_get("attempt")?;

    let run_key = run_key_raw
        .parse::<RunKey>()
        .map_err(|error| corrupt(error.to_string()))?;
    let recorded_at = DateTime::parse_from_rfc3339(&recorded_raw)
        .map_err(|error| corrupt(format!("recorded_at: {error}")))?
        .with_timezone(&Utc);
    let state = state_raw
        .parse::<ExecutionState>()
        .map_err(|_| corrupt(format!("unknown state {state_raw}")))?;
    let payload = serde_json::from_str::<EntryPayload>(&payload_raw)
        .map_err(|error| corrupt(format!("payload: {error}")))?;

    Ok(JournalEntry {
        run_key,
        future_id: FutureId::from(future_id.as_str()),
        recorded_at,
        state,
        payload,
        fingerprint: row.try_get("fingerprint")?,
        attempt: u32::try_from(attempt).map_err(|error| corrupt(format!("attempt: {error}")))?,
    })
}

fn stream_entries<'a>(
    pool: &'a SqlitePool,
    run_key: &'a RunKey,
) -> impl Stream<Item = Result<JournalEntry, JournalError>> + Send + 'a {
    async_stream::try_stream! {
        let key = run_key.to_string();
        let mut rows = sqlx::query(
            "SELECT seq, run_key, future_id, recorded_at, state, payload, fingerprint, attempt
             FROM journal_entries
             WHERE run_key = $1
             ORDER BY seq",
        )
        .bind(key)
        .fetch(pool);

        while let Some(row) = rows.try_next().await? {
            yield map_entry_row(&row)?;
        }
    }
}

#[async_trait]
impl Journal for SqliteJournal {
    async fn append(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        let payload = serde_json::to_string(&entry.payload)
            .map_err(|error| JournalError::Storage(format!("encode payload: {error}")))?;

        sqlx::query(
            "INSERT INTO journal_entries
                 (run_key, future_id, recorded_at, state, payload, fingerprint, attempt)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.run_key.to_string())
        .bind(entry.future_id.as_str())
        .bind(entry.recorded_at.to_rfc3339())
        .bind(entry.state.to_string())
        .bind(payload)
        .bind(entry.fingerprint.as_deref())
        .bind(i64::from(entry.attempt))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn entries_for<'a>(&'a self, run_key: &'a RunKey) -> EntryStream<'a> {
        Box::pin(stream_entries(&self.pool, run_key))
    }
}
