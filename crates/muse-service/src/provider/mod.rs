//! External image-generation provider.
//!
//! The provider is asynchronous: a submission returns the provider's task id,
//! and the outcome is learned later either by polling [`ImageProvider::fetch_status`]
//! or from a callback the provider pushes to us. Both paths produce the same
//! [`ProviderTaskStatus`].

mod novita;

pub use novita::NovitaProvider;

use async_trait::async_trait;

use muse_core::{GeneratedAsset, GenerationRequest};

/// Error type for provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider API returned an error.
    #[error("provider API error: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// Response or callback body did not have the expected shape.
    #[error("malformed provider payload: {0}")]
    Malformed(String),
}

/// A submission to the provider.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// The validated generation parameters.
    pub generation: GenerationRequest,
    /// Callback URL, when the service is reachable from the provider.
    pub webhook_url: Option<String>,
}

/// Provider-side state of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderTaskStatus {
    /// Accepted, not started.
    Queued,
    /// Running.
    Processing {
        /// Percent complete, 0-100.
        progress: u8,
    },
    /// Finished with images.
    Succeeded {
        /// Generated images.
        assets: Vec<GeneratedAsset>,
    },
    /// Finished without images.
    Failed {
        /// Provider failure message.
        reason: String,
    },
}

impl ProviderTaskStatus {
    /// Whether this status ends the task.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }

    /// Progress percentage to report to callers.
    #[must_use]
    pub const fn progress(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Processing { progress } => *progress,
            Self::Succeeded { .. } | Self::Failed { .. } => 100,
        }
    }
}

/// A status report for one provider task, from a poll or a callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderTaskReport {
    /// The provider's task id.
    pub provider_task_id: String,
    /// Reported status.
    pub status: ProviderTaskStatus,
}

/// Trait for asynchronous image-generation providers.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Submit a generation and return the provider's task id.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, a non-2xx response, or a
    /// response without a task id.
    async fn submit(&self, request: &ProviderRequest) -> Result<String, ProviderError>;

    /// Fetch the current status of a submitted task.
    ///
    /// # Errors
    ///
    /// Returns an error if the status endpoint fails or answers with an
    /// unexpected shape.
    async fn fetch_status(&self, provider_task_id: &str) -> Result<ProviderTaskReport, ProviderError>;

    /// Parse a callback body pushed by the provider.
    ///
    /// Returns `Ok(None)` for well-formed events that carry no task result.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Malformed` if the body cannot be parsed.
    fn parse_callback(&self, body: &[u8]) -> Result<Option<ProviderTaskReport>, ProviderError>;
}
