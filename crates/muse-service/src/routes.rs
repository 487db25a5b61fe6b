//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{generations, health, tokens, webhooks};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Generation endpoints each hold a provider round trip open.
const GENERATION_MAX_CONCURRENT_REQUESTS: usize = 32;

/// All other user-facing API routes.
const API_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Generations (bearer JWT)
/// - `POST /v1/generations` - Submit a generation
/// - `GET /v1/generations` - List the caller's tasks
/// - `POST /v1/generations/estimate` - Cost and eligibility preview
/// - `GET /v1/generations/status?taskId=` - Check a task's status
/// - `GET /v1/generations/:task_id` - Check a task's status
///
/// ## Tokens
/// - `GET /v1/tokens/balance` - Current balance (bearer JWT)
/// - `GET /v1/tokens/entries` - Ledger history (bearer JWT)
/// - `POST /v1/tokens/grant` - Add tokens (`x-admin-key`)
///
/// ## Webhooks (callback token)
/// - `POST /webhooks/provider` - Provider task callbacks
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let generation_routes = Router::new()
        .route(
            "/",
            post(generations::submit).get(generations::list_generations),
        )
        .route("/estimate", post(generations::estimate))
        .route("/status", get(generations::check_generation_status))
        .route("/:task_id", get(generations::get_generation))
        .layer(ConcurrencyLimitLayer::new(GENERATION_MAX_CONCURRENT_REQUESTS));

    let api_routes = Router::new()
        .nest("/generations", generation_routes)
        .route("/tokens/balance", get(tokens::get_balance))
        .route("/tokens/entries", get(tokens::list_entries))
        .route("/tokens/grant", post(tokens::admin_grant))
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes (rate limited)
        .nest("/v1", api_routes)
        // Webhooks (no rate limit - controlled by the provider)
        .route("/webhooks/provider", post(webhooks::provider_webhook))
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
