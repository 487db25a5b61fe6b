//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use muse_core::{DenialReason, MuseError};
use muse_store::StoreError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Forbidden - valid credentials but insufficient permissions.
    #[error("forbidden")]
    Forbidden,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Conflict - invalid state transition for the current task status.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Refused by the eligibility gate. Nothing was charged or submitted.
    #[error("{}", .reason.message())]
    EligibilityDenied {
        /// Which rule refused the request.
        reason: DenialReason,
        /// Whether a plan upgrade would lift the refusal.
        upgrade_required: bool,
    },

    /// Balance too low. Nothing was submitted.
    #[error("insufficient tokens: balance={balance}, required={required}")]
    InsufficientTokens {
        /// Current balance.
        balance: i64,
        /// Cost of the request.
        required: i64,
    },

    /// The provider rejected or never received the submission. Any charge
    /// was refunded before this error was returned.
    #[error("provider submission failed: {message}")]
    ProviderSubmissionFailure {
        /// Provider or transport error.
        message: String,
        /// Tokens returned to the caller.
        tokens_refunded: i64,
    },

    /// Status check failed; the task was not transitioned and the caller
    /// should retry.
    #[error("status check failed: {0}")]
    TransientResolution(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// External service error.
    #[error("external service error: {0}")]
    ExternalService(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden", self.to_string(), None),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::EligibilityDenied {
                reason,
                upgrade_required,
            } => (
                StatusCode::FORBIDDEN,
                "eligibility_denied",
                reason.message().to_string(),
                Some(serde_json::json!({
                    "reason": reason,
                    "upgrade_required": upgrade_required
                })),
            ),
            Self::InsufficientTokens { balance, required } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_tokens",
                format!("This generation costs {required} tokens; your balance is {balance}."),
                Some(serde_json::json!({
                    "currentBalance": balance,
                    "requiredTokens": required
                })),
            ),
            Self::ProviderSubmissionFailure {
                tokens_refunded, ..
            } => {
                let text = if *tokens_refunded > 0 {
                    format!(
                        "Image generation could not be started. {tokens_refunded} tokens were refunded."
                    )
                } else {
                    "Image generation could not be started.".to_string()
                };
                (
                    StatusCode::BAD_GATEWAY,
                    "provider_submission_failure",
                    text,
                    Some(serde_json::json!({ "tokens_refunded": tokens_refunded })),
                )
            }
            Self::TransientResolution(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "transient_resolution_error",
                msg.clone(),
                Some(serde_json::json!({ "retryable": true })),
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
            Self::ExternalService(msg) => (
                StatusCode::BAD_GATEWAY,
                "external_service_error",
                msg.clone(),
                None,
            ),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound(format!("{entity} not found: {id}")),
            StoreError::AlreadyExists { entity, id } => {
                Self::Conflict(format!("{entity} already exists: {id}"))
            }
            StoreError::InsufficientTokens { balance, required } => {
                Self::InsufficientTokens { balance, required }
            }
            StoreError::InvalidTransition { from, to } => {
                Self::Conflict(format!("task cannot move from {from} to {to}"))
            }
            StoreError::Invalid(msg) => Self::BadRequest(msg),
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Internal(msg),
        }
    }
}

impl From<MuseError> for ApiError {
    fn from(err: MuseError) -> Self {
        match err {
            MuseError::InsufficientTokens { balance, required } => {
                Self::InsufficientTokens { balance, required }
            }
            MuseError::InvalidTransition { from, to } => {
                Self::Conflict(format!("task cannot move from {from} to {to}"))
            }
            MuseError::InvalidRequest(msg) => Self::BadRequest(msg),
            MuseError::InvalidAmount(amount) => Self::BadRequest(format!("invalid amount: {amount}")),
            MuseError::BalanceOverflow { .. } => Self::BadRequest(err.to_string()),
            MuseError::InvalidId(e) => Self::BadRequest(e.to_string()),
        }
    }
}
