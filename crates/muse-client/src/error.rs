//! Client error types.

use muse_core::{DenialReason, TaskId};

/// Errors that can occur when using the muse client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an error response.
    #[error("API error: {code} - {message}")]
    Api {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
        /// HTTP status code.
        status: u16,
    },

    /// The bearer token was missing, expired or rejected.
    #[error("unauthorized")]
    Unauthorized,

    /// The balance does not cover the request.
    #[error("insufficient tokens: balance={current_balance}, required={required_tokens}")]
    InsufficientTokens {
        /// Current balance.
        current_balance: i64,
        /// Tokens the request costs.
        required_tokens: i64,
    },

    /// The request is not allowed on the caller's plan.
    #[error("generation not allowed: {reason:?}")]
    EligibilityDenied {
        /// Why it was refused.
        reason: DenialReason,
        /// Whether upgrading would lift the refusal.
        upgrade_required: bool,
        /// Text to show the user.
        message: String,
    },

    /// The provider refused the submission; any charge was refunded.
    #[error("generation could not be started ({tokens_refunded} tokens refunded)")]
    ProviderSubmissionFailure {
        /// Tokens returned to the balance.
        tokens_refunded: i64,
    },

    /// The provider could not be reached; the task is unchanged.
    #[error("status temporarily unavailable: {0}")]
    TransientResolution(String),

    /// The task did not finish within the polling window. It may still
    /// finish later.
    #[error("timed out waiting for task {task_id}")]
    Timeout {
        /// The task being waited on.
        task_id: TaskId,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ClientError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientResolution(_) | Self::Timeout { .. })
    }
}
