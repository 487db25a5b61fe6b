//! Application state.

use std::sync::Arc;
use std::time::Duration;

use muse_core::TaskId;
use muse_store::Store;

use crate::config::ServiceConfig;
use crate::crypto::callback_token;
use crate::error::ApiError;
use crate::ledger::TokenLedger;
use crate::provider::{ImageProvider, NovitaProvider};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// Image provider (optional).
    pub provider: Option<Arc<dyn ImageProvider>>,

    /// Token ledger over `store`.
    pub ledger: TokenLedger,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        let provider = config.provider_api_key.as_ref().and_then(|key| {
            match NovitaProvider::new(
                &config.provider_base_url,
                key,
                Duration::from_secs(config.provider_timeout_seconds),
            ) {
                Ok(client) => {
                    tracing::info!(provider_url = %config.provider_base_url, "Image provider enabled");
                    Some(Arc::new(client) as Arc<dyn ImageProvider>)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create image provider client");
                    None
                }
            }
        });

        if provider.is_none() {
            tracing::warn!("Image provider not configured - generation requests will be refused");
        }

        if !config.webhooks_enabled() {
            tracing::warn!("Provider callbacks disabled - tasks resolve by polling only");
        }

        Self::with_provider(store, config, provider)
    }

    /// Create a state with an explicit provider.
    #[must_use]
    pub fn with_provider(
        store: Arc<dyn Store>,
        config: ServiceConfig,
        provider: Option<Arc<dyn ImageProvider>>,
    ) -> Self {
        Self {
            ledger: TokenLedger::new(Arc::clone(&store)),
            store,
            config,
            provider,
        }
    }

    /// Check if a provider is configured.
    #[must_use]
    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    /// The configured provider.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::ExternalService` if none is configured.
    pub fn provider(&self) -> Result<&Arc<dyn ImageProvider>, ApiError> {
        self.provider
            .as_ref()
            .ok_or_else(|| ApiError::ExternalService("image provider is not configured".into()))
    }

    /// Callback URL to register with the provider for `task_id`, if callbacks
    /// are enabled.
    #[must_use]
    pub fn webhook_url(&self, task_id: &TaskId) -> Option<String> {
        let base = self.config.public_base_url.as_deref()?;
        let secret = self.config.webhook_secret.as_deref()?;

        match callback_token(secret, task_id) {
            Ok(token) => Some(format!(
                "{}/webhooks/provider?task={task_id}&token={token}",
                base.trim_end_matches('/')
            )),
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to sign callback URL");
                None
            }
        }
    }
}
