//! Muse HTTP API service.
//!
//! This crate provides the HTTP API for token-metered image generation:
//!
//! - Generation submission with an eligibility gate and token charging
//! - Task status resolution by polling and by provider callback
//! - Token balance and ledger history
//! - A background sweep for tasks left behind by crashes or lost callbacks
//!
//! # Authentication
//!
//! The service supports two authentication methods:
//!
//! 1. **Bearer JWTs** (HS256) - For end-user requests; plan flags come from
//!    the token's `app_metadata`
//! 2. **Admin API key** - For operator requests such as token grants
//!
//! Provider callbacks are authenticated by the signed token embedded in the
//! callback URL at submission.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod generation;
pub mod handlers;
pub mod ledger;
pub mod provider;
pub mod routes;
pub mod state;

pub use config::{ServiceConfig, StoreBackend};
pub use error::ApiError;
pub use generation::{reconcile_once, spawn_reconciler, ReconcileReport};
pub use ledger::TokenLedger;
pub use provider::{
    ImageProvider, NovitaProvider, ProviderError, ProviderRequest, ProviderTaskReport,
    ProviderTaskStatus,
};
pub use routes::create_router;
pub use state::AppState;
