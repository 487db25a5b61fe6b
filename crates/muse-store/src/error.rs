//! Error types for Muse storage.

use muse_core::{MuseError, TaskStatus};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Requested key.
        id: String,
    },

    /// Record with the same key already stored.
    #[error("{entity} already exists: {id}")]
    AlreadyExists {
        /// Kind of record.
        entity: &'static str,
        /// Conflicting key.
        id: String,
    },

    /// Balance too low for a deduction. Nothing was written.
    #[error("insufficient tokens: balance={balance}, required={required}")]
    InsufficientTokens {
        /// Current balance.
        balance: i64,
        /// Required amount.
        required: i64,
    },

    /// Task status change rejected by the state machine.
    #[error("invalid task transition from {from} to {to}")]
    InvalidTransition {
        /// Stored status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },

    /// Domain rule violated by the stored data or the caller's input.
    #[error("invalid data: {0}")]
    Invalid(String),
}

impl StoreError {
    pub(crate) fn task_not_found(task_id: impl ToString) -> Self {
        Self::NotFound {
            entity: "task",
            id: task_id.to_string(),
        }
    }
}

impl From<MuseError> for StoreError {
    fn from(err: MuseError) -> Self {
        match err {
            MuseError::InsufficientTokens { balance, required } => {
                Self::InsufficientTokens { balance, required }
            }
            MuseError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            other => Self::Invalid(other.to_string()),
        }
    }
}
