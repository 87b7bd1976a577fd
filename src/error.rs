use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `Anchorage`.
///
/// Each subsystem defines its own error enum. Callers match on the variant
/// to decide whether fixing the module and re-running is enough
/// (`Declaration`), whether the run stopped before touching the chain
/// (`Journal`, `Reconciliation`, `Planning`), or whether an engine invariant
/// broke (`UnresolvedResult`).
#[derive(Debug, Error)]
pub enum AnchorageError {
    // ── Module declaration ───────────────────────────────────────────────
    #[error("declaration: {0}")]
    Declaration(#[from] DeclarationError),

    // ── Planning ────────────────────────────────────────────────────────
    #[error("planning: {0}")]
    Planning(#[from] PlanningError),

    // ── Journal ─────────────────────────────────────────────────────────
    #[error("journal unavailable: {0}")]
    Journal(#[from] JournalError),

    // ── Reconciliation ──────────────────────────────────────────────────
    #[error("reconciliation: {0}")]
    Reconciliation(#[from] ReconciliationError),

    // ── Chain collaborator ──────────────────────────────────────────────
    #[error("chain: {0}")]
    Chain(#[from] ChainError),

    // ── Engine invariant ────────────────────────────────────────────────
    #[error("future {future} references {reference}, which has no recorded result")]
    UnresolvedResult { future: String, reference: String },

    // ── Journal maintenance ─────────────────────────────────────────────
    #[error("cannot {operation} {future}: {reason}")]
    Rejected {
        operation: &'static str,
        future: String,
        reason: String,
    },

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Declaration errors ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeclarationError {
    #[error("cycle detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("{from} references unknown future {missing}")]
    UnresolvedReference { from: String, missing: String },

    #[error("duplicate identifier: {0}")]
    DuplicateIdentifier(String),

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("{future}: {reason}")]
    InvalidFuture { future: String, reason: String },

    #[error("missing parameter {module}.{name} and no default was declared")]
    MissingParameter { module: String, name: String },

    #[error("{future} sends from account {index}, but only {available} accounts are configured")]
    UnknownAccount {
        future: String,
        index: usize,
        available: usize,
    },

    #[error("invalid module manifest: {0}")]
    Manifest(String),
}

// ─── Planning errors ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanningError {
    #[error("{future} depends on {dependency}, which is {state}")]
    BlockedDependency {
        future: String,
        dependency: String,
        state: String,
    },

    #[error("no schedulable future among {0} remaining")]
    Stalled(usize),
}

// ─── Journal errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("storage: {0}")]
    Storage(String),

    #[error("corrupt record at {position}: {reason}")]
    Corrupt { position: String, reason: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for JournalError {
    fn from(error: sqlx::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

// ─── Chain collaborator errors ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("execution reverted: {0}")]
    Reverted(String),

    #[error("insufficient funds for {account}")]
    InsufficientFunds { account: String },

    #[error("nonce mismatch for {account}: expected {expected}, got {actual}")]
    NonceMismatch {
        account: String,
        expected: u64,
        actual: u64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rpc: {0}")]
    Rpc(String),
}

// ─── Reconciliation errors ──────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("{future} changed since it was journaled (recorded {recorded}, declared {declared})")]
    DefinitionChanged {
        future: String,
        recorded: String,
        declared: String,
    },

    #[error("checking {future} against the chain failed: {source}")]
    ChainQuery {
        future: String,
        #[source]
        source: ChainError,
    },
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, AnchorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cyclic_dependency_names_the_cycle() {
        let err = DeclarationError::CyclicDependency(vec![
            "M#A".into(),
            "M#B".into(),
            "M#A".into(),
        ]);
        assert_eq!(err.to_string(), "cycle detected: M#A -> M#B -> M#A");
    }

    #[test]
    fn journal_errors_surface_as_unavailable() {
        let err = AnchorageError::Journal(JournalError::Storage("disk I/O error".into()));
        assert!(err.to_string().starts_with("journal unavailable"));
        assert!(err.to_string().contains("disk I/O error"));
    }

    #[test]
    fn anyhow_interop() {
        let anyhow_err = anyhow::anyhow!("something went wrong");
        let err: AnchorageError = anyhow_err.into();
        assert!(err.to_string().contains("something went wrong"));
    }

    #[test]
    fn unresolved_result_names_both_futures() {
        let err = AnchorageError::UnresolvedResult {
            future: "M#Token.mint".into(),
            reference: "M#Token".into(),
        };
        assert!(err.to_string().contains("M#Token.mint"));
        assert!(err.to_string().contains("no recorded result"));
    }

    #[test]
    fn reconciliation_chain_query_keeps_source() {
        let err = ReconciliationError::ChainQuery {
            future: "M#Token".into(),
            source: ChainError::Rpc("connection refused".into()),
        };
        assert!(err.to_string().contains("connection refused"));
    }
}
