//! Error types for the Armada ledger.

use thiserror::Error;

/// Result type alias for ledger operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during ledger operations.
///
/// The first group wraps failures of the embedded database. The second group
/// is the domain vocabulary every higher layer reasons about.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("version conflict on {kind} {id}: expected {expected}, stored {actual}")]
    VersionConflict {
        kind: &'static str,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("insufficient resources: {0}")]
    InsufficientResources(String),
}

impl StateError {
    pub(crate) fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        StateError::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub(crate) fn already_exists(kind: &'static str, key: impl Into<String>) -> Self {
        StateError::AlreadyExists {
            kind,
            key: key.into(),
        }
    }

    /// Whether re-reading and retrying the failed step may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StateError::VersionConflict { .. }
                | StateError::InsufficientResources(_)
                | StateError::Transaction(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StateError::AlreadyExists { .. })
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StateError::VersionConflict { .. })
    }
}
