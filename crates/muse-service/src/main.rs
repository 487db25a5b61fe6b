//! Muse Service - HTTP API for token-metered image generation
//!
//! This is the main entry point for the muse service.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use muse_service::{create_router, spawn_reconciler, AppState, ServiceConfig, StoreBackend};
use muse_store::{MemoryStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,muse=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Muse Service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        store_backend = ?config.store_backend,
        provider_configured = %config.provider_api_key.is_some(),
        webhooks_enabled = %config.webhooks_enabled(),
        auth_configured = %config.auth_jwt_secret.is_some(),
        "Service configuration loaded"
    );

    if config.provider_outlives_request() {
        tracing::warn!(
            provider_timeout_seconds = config.provider_timeout_seconds,
            request_timeout_seconds = config.request_timeout_seconds,
            "Provider timeout is not shorter than the request timeout - slow submissions will answer 408"
        );
    }

    let store = open_store(&config).await?;

    // Build app state
    let state = AppState::new(store, config.clone());

    // Stale task sweep runs for the life of the process
    let _reconciler = spawn_reconciler(Arc::new(state.clone()));

    // Create the router
    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Open the configured storage backend.
async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store - all data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::RocksDb => open_rocks(config),
        StoreBackend::Postgres => open_postgres(config).await,
    }
}

#[cfg(feature = "rocksdb-backend")]
fn open_rocks(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    Ok(Arc::new(muse_store::RocksStore::open(&config.data_dir)?))
}

#[cfg(not(feature = "rocksdb-backend"))]
fn open_rocks(_config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    Err("this build does not include the rocksdb backend (feature `rocksdb-backend`)".into())
}

#[cfg(feature = "postgres-backend")]
async fn open_postgres(
    config: &ServiceConfig,
) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    let url = config
        .database_url
        .as_deref()
        .ok_or("DATABASE_URL is required for the postgres backend")?;
    tracing::info!("Connecting to PostgreSQL store");
    Ok(Arc::new(muse_store::PgStore::connect(url).await?))
}

#[cfg(not(feature = "postgres-backend"))]
#[allow(clippy::unused_async)]
async fn open_postgres(
    _config: &ServiceConfig,
) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    Err("this build does not include the postgres backend (feature `postgres-backend`)".into())
}
