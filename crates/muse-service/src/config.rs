//! Service configuration.

use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use muse_core::{ContentClassifier, EligibilityPolicy, PricingConfig};

/// Default provider API base URL.
pub const DEFAULT_PROVIDER_BASE_URL: &str = "https://api.novita.ai";

/// Which storage backend the service opens at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local, lost on restart.
    Memory,
    /// `RocksDB` under `data_dir`.
    RocksDb,
    /// PostgreSQL at `database_url`.
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "rocksdb" | "rocks" => Ok(Self::RocksDb),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Storage backend (default: rocksdb).
    pub store_backend: StoreBackend,

    /// Path to `RocksDB` data directory (default: "/data/muse").
    pub data_dir: String,

    /// PostgreSQL connection string, required for the postgres backend.
    pub database_url: Option<String>,

    /// HS256 secret for bearer JWTs. Without it every user request is
    /// rejected as unauthorized.
    pub auth_jwt_secret: Option<String>,

    /// Expected JWT audience; not checked when unset.
    pub auth_audience: Option<String>,

    /// Key for admin endpoints (`x-admin-key`).
    pub admin_api_key: Option<String>,

    /// Image provider base URL.
    pub provider_base_url: String,

    /// Image provider API key. Generation is unavailable without it.
    pub provider_api_key: Option<String>,

    /// Provider HTTP timeout in seconds.
    pub provider_timeout_seconds: u64,

    /// Externally reachable base URL used to build callback URLs. Without it
    /// (or without `webhook_secret`) no callback is registered and tasks are
    /// resolved by polling only.
    pub public_base_url: Option<String>,

    /// Secret for callback URL tokens.
    pub webhook_secret: Option<String>,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Token pricing.
    pub pricing: PricingConfig,

    /// Free-tier limits and content policy.
    pub eligibility: EligibilityPolicy,

    /// Seconds between reconciler sweeps; 0 disables the reconciler.
    pub reconcile_interval_seconds: u64,

    /// Age after which a task still `pending` is treated as orphaned.
    pub pending_orphan_after_seconds: u64,

    /// Age after which a `processing` task is re-polled by the reconciler.
    pub processing_repoll_after_seconds: u64,
}

/// Provider secrets file structure.
#[derive(Debug, Deserialize)]
struct ProviderSecrets {
    api_key: String,
    #[serde(default)]
    webhook_secret: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let (provider_api_key, webhook_secret) = load_provider_secrets();

        let store_backend = match std::env::var("STORE_BACKEND") {
            Ok(value) => value.parse().unwrap_or_else(|e: String| {
                tracing::warn!(error = %e, "Falling back to the rocksdb backend");
                StoreBackend::RocksDb
            }),
            Err(_) => defaults.store_backend,
        };

        let eligibility = EligibilityPolicy {
            free_weekly_image_limit: env_parse(
                "FREE_WEEKLY_IMAGE_LIMIT",
                defaults.eligibility.free_weekly_image_limit,
            ),
            classifier: std::env::var("NSFW_KEYWORDS").map_or_else(
                |_| ContentClassifier::default(),
                |list| ContentClassifier::new(list.split(',')),
            ),
        };

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            store_backend,
            data_dir: std::env::var("DATA_DIR").unwrap_or(defaults.data_dir),
            database_url: std::env::var("DATABASE_URL").ok(),
            auth_jwt_secret: std::env::var("AUTH_JWT_SECRET").ok(),
            auth_audience: std::env::var("AUTH_AUDIENCE").ok(),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            provider_base_url: std::env::var("PROVIDER_BASE_URL")
                .unwrap_or(defaults.provider_base_url),
            provider_api_key,
            provider_timeout_seconds: env_parse(
                "PROVIDER_TIMEOUT_SECONDS",
                defaults.provider_timeout_seconds,
            ),
            public_base_url: std::env::var("PUBLIC_BASE_URL").ok(),
            webhook_secret,
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES", defaults.max_body_bytes),
            request_timeout_seconds: env_parse(
                "REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout_seconds,
            ),
            pricing: defaults.pricing,
            eligibility,
            reconcile_interval_seconds: env_parse(
                "RECONCILE_INTERVAL_SECONDS",
                defaults.reconcile_interval_seconds,
            ),
            pending_orphan_after_seconds: env_parse(
                "PENDING_ORPHAN_AFTER_SECONDS",
                defaults.pending_orphan_after_seconds,
            ),
            processing_repoll_after_seconds: env_parse(
                "PROCESSING_REPOLL_AFTER_SECONDS",
                defaults.processing_repoll_after_seconds,
            ),
        }
    }

    /// Whether a provider call can outlast the request timeout. Submissions
    /// still settle their charge then, but the caller only sees a 408.
    #[must_use]
    pub const fn provider_outlives_request(&self) -> bool {
        self.provider_timeout_seconds >= self.request_timeout_seconds
    }

    /// Whether callback URLs can be issued.
    #[must_use]
    pub const fn webhooks_enabled(&self) -> bool {
        self.public_base_url.is_some() && self.webhook_secret.is_some()
    }
}

/// Parse an environment variable, keeping `default` when unset or invalid.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Load provider secrets from file or environment.
fn load_provider_secrets() -> (Option<String>, Option<String>) {
    let secret_paths = [
        ".secrets/novita.json",
        "muse/.secrets/novita.json",
        "../.secrets/novita.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<ProviderSecrets>(path) {
            tracing::info!(path = %path, "Loaded provider secrets from file");
            return (
                Some(secrets.api_key),
                secrets
                    .webhook_secret
                    .or_else(|| std::env::var("WEBHOOK_SECRET").ok()),
            );
        }
    }

    tracing::debug!("Provider secrets file not found, using environment variables");
    (
        std::env::var("PROVIDER_API_KEY").ok(),
        std::env::var("WEBHOOK_SECRET").ok(),
    )
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            store_backend: StoreBackend::RocksDb,
            data_dir: "/data/muse".into(),
            database_url: None,
            auth_jwt_secret: None,
            auth_audience: None,
            admin_api_key: None,
            provider_base_url: DEFAULT_PROVIDER_BASE_URL.into(),
            provider_api_key: None,
            provider_timeout_seconds: 20,
            public_base_url: None,
            webhook_secret: None,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            pricing: PricingConfig::default(),
            eligibility: EligibilityPolicy::default(),
            reconcile_interval_seconds: 60,
            pending_orphan_after_seconds: 300,
            processing_repoll_after_seconds: 120,
        }
    }
}
