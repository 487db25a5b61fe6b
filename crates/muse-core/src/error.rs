//! Error types for Muse core.

use crate::ids::IdError;
use crate::task::TaskStatus;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, MuseError>;

/// Errors raised by domain rules.
#[derive(Debug, thiserror::Error)]
pub enum MuseError {
    /// Balance too low for the requested deduction.
    #[error("insufficient tokens: balance={balance}, required={required}")]
    InsufficientTokens {
        /// Current balance.
        balance: i64,
        /// Tokens requested.
        required: i64,
    },

    /// Applying an entry would push the balance or a lifetime counter out
    /// of range.
    #[error("balance overflow: balance={balance}, amount={amount}")]
    BalanceOverflow {
        /// Current balance.
        balance: i64,
        /// Tokens in the rejected entry.
        amount: i64,
    },

    /// Task status change not allowed by the state machine.
    #[error("invalid task transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },

    /// Generation request failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Ledger amount was zero or negative.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}
