//! API handlers.

pub mod generations;
pub mod health;
pub mod tokens;
pub mod webhooks;

/// Largest page a listing endpoint returns.
pub(crate) const MAX_PAGE_SIZE: usize = 100;

pub(crate) const fn default_limit() -> usize {
    muse_store::DEFAULT_PAGE_SIZE
}
