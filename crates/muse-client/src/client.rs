//! Muse HTTP client implementation.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use muse_core::{DenialReason, GenerationRequest, TaskId};

use crate::error::ClientError;
use crate::types::{
    ApiErrorResponse, BalanceResponse, EstimateResponse, GenerationList, GenerationStatus,
    LedgerEntries, ListGenerationsQuery, SubmitResponse,
};

/// Muse API client acting for one user.
#[derive(Debug, Clone)]
pub struct MuseClient {
    client: Client,
    base_url: String,
    bearer_token: String,
}

impl MuseClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the muse service (e.g., `"http://muse:8080"`)
    /// * `bearer_token` - The user's JWT
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        bearer_token: impl Into<String>,
    ) -> Result<Self, ClientError> {
        Self::with_options(base_url, bearer_token, ClientOptions::default())
    }

    /// Create a new client with custom options.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` if the HTTP client cannot be built.
    pub fn with_options(
        base_url: impl Into<String>,
        bearer_token: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .build()
            .map_err(|e| ClientError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: bearer_token.into(),
        })
    }

    // =========================================================================
    // Generations
    // =========================================================================

    /// Submit a generation. Tokens are charged before the provider is called
    /// and refunded if it refuses.
    ///
    /// # Errors
    ///
    /// - `ClientError::EligibilityDenied` if the plan does not allow the request.
    /// - `ClientError::InsufficientTokens` if the balance is too low.
    /// - `ClientError::ProviderSubmissionFailure` if the provider refused it.
    pub async fn submit_generation(
        &self,
        request: &GenerationRequest,
    ) -> Result<SubmitResponse, ClientError> {
        let url = format!("{}/v1/generations", self.base_url);
        self.send(self.client.post(&url).json(request)).await
    }

    /// Preview the cost and eligibility of a request without submitting it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn estimate(
        &self,
        request: &GenerationRequest,
    ) -> Result<EstimateResponse, ClientError> {
        let url = format!("{}/v1/generations/estimate", self.base_url);
        self.send(self.client.post(&url).json(request)).await
    }

    /// Check a task once. The service asks the provider if the task is still
    /// running.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::TransientResolution` if the provider could not be
    /// reached; the call can be repeated.
    pub async fn generation_status(
        &self,
        task_id: &TaskId,
    ) -> Result<GenerationStatus, ClientError> {
        let url = format!("{}/v1/generations/{task_id}", self.base_url);
        self.send(self.client.get(&url)).await
    }

    /// List the user's tasks as stored, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn list_generations(
        &self,
        query: &ListGenerationsQuery,
    ) -> Result<GenerationList, ClientError> {
        let url = format!("{}/v1/generations", self.base_url);

        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(character_id) = query.character_id {
            params.push(("character_id", character_id.to_string()));
        }
        if let Some(status) = query.status {
            params.push(("status", status.as_str().to_string()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(offset) = query.offset {
            params.push(("offset", offset.to_string()));
        }

        self.send(self.client.get(&url).query(&params)).await
    }

    /// Poll a task until it succeeds or fails.
    ///
    /// Transient status errors are retried on the next tick. Hitting the
    /// timeout only stops the polling; the task keeps running on the server.
    ///
    /// # Errors
    ///
    /// - `ClientError::Timeout` if the task is still running at the deadline.
    /// - Any non-transient error from [`Self::generation_status`].
    pub async fn wait_for_completion(
        &self,
        task_id: &TaskId,
        options: PollOptions,
    ) -> Result<GenerationStatus, ClientError> {
        let deadline = Instant::now() + options.timeout;

        loop {
            match self.generation_status(task_id).await {
                Ok(status) if status.is_terminal() => return Ok(status),
                Ok(status) => {
                    tracing::debug!(task_id = %task_id, progress = status.progress, "Generation in progress");
                }
                Err(ClientError::TransientResolution(message)) => {
                    tracing::warn!(task_id = %task_id, error = %message, "Status check failed, retrying");
                }
                Err(e) => return Err(e),
            }

            if Instant::now() + options.interval > deadline {
                return Err(ClientError::Timeout { task_id: *task_id });
            }
            tokio::time::sleep(options.interval).await;
        }
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    /// Get the user's token balance.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn balance(&self) -> Result<BalanceResponse, ClientError> {
        let url = format!("{}/v1/tokens/balance", self.base_url);
        self.send(self.client.get(&url)).await
    }

    /// List the user's ledger entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn ledger_entries(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<LedgerEntries, ClientError> {
        let url = format!("{}/v1/tokens/entries", self.base_url);
        self.send(
            self.client
                .get(&url)
                .query(&[("limit", limit), ("offset", offset)]),
        )
        .await
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.bearer_auth(&self.bearer_token).send().await?;
        Self::handle_response(response).await
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        let Ok(api_error) = response.json::<ApiErrorResponse>().await else {
            return Err(ClientError::Api {
                code: "unknown".to_string(),
                message: format!("HTTP {status}"),
                status: status.as_u16(),
            });
        };

        let body = api_error.error;
        let detail = |key: &str| body.details.as_ref().and_then(|d| d.get(key));
        let detail_i64 = |key: &str| detail(key).and_then(serde_json::Value::as_i64).unwrap_or(0);

        // Map specific error codes to typed errors
        match body.code.as_str() {
            "unauthorized" => Err(ClientError::Unauthorized),
            "insufficient_tokens" => Err(ClientError::InsufficientTokens {
                current_balance: detail_i64("currentBalance"),
                required_tokens: detail_i64("requiredTokens"),
            }),
            "eligibility_denied" => {
                let reason = detail("reason")
                    .cloned()
                    .map(serde_json::from_value::<DenialReason>)
                    .transpose()?;
                match reason {
                    Some(reason) => Err(ClientError::EligibilityDenied {
                        reason,
                        upgrade_required: detail("upgrade_required")
                            .and_then(serde_json::Value::as_bool)
                            .unwrap_or(false),
                        message: body.message,
                    }),
                    None => Err(ClientError::Api {
                        code: body.code,
                        message: body.message,
                        status: status.as_u16(),
                    }),
                }
            }
            "provider_submission_failure" => Err(ClientError::ProviderSubmissionFailure {
                tokens_refunded: detail_i64("tokens_refunded"),
            }),
            "transient_resolution_error" => Err(ClientError::TransientResolution(body.message)),
            _ => Err(ClientError::Api {
                code: body.code,
                message: body.message,
                status: status.as_u16(),
            }),
        }
    }
}

/// Client options for customization.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request timeout in seconds (default: 30).
    pub timeout_seconds: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
        }
    }
}

/// How [`MuseClient::wait_for_completion`] polls.
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    /// Delay between status checks.
    pub interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

impl PollOptions {
    /// Poll every `interval` for up to five minutes.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            timeout: Duration::from_secs(300),
        }
    }

    /// Set the overall timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}
