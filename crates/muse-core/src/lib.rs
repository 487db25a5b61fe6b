//! Core types and rules for Muse image generation.
//!
//! This crate provides the foundational types used by the generation service:
//!
//! - **Identifiers**: `UserId`, `TaskId`, `CharacterId`, `EntryId`
//! - **Accounts**: `TokenAccount`, `Caller`, `PlanTier`
//! - **Ledger**: `LedgerEntry`, `EntryKind`
//! - **Tasks**: `GenerationRequest`, `GenerationTask`, `TaskStatus`
//! - **Rules**: `PricingConfig`, `EligibilityPolicy`, `check_eligibility`
//!
//! # Tokens
//!
//! Balances are whole tokens stored as `i64`. Single-image generations are
//! free; multi-image generations cost a per-model rate times the image count.
//! Admins are never charged.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod eligibility;
pub mod error;
pub mod ids;
pub mod ledger;
pub mod pricing;
pub mod request;
pub mod task;
pub mod usage;

pub use account::{Caller, PlanTier, TokenAccount};
pub use eligibility::{
    check_eligibility, ContentClassifier, DenialReason, EligibilityDecision, EligibilityPolicy,
    DEFAULT_FREE_WEEKLY_IMAGE_LIMIT,
};
pub use error::{MuseError, Result};
pub use ids::{CharacterId, EntryId, IdError, TaskId, UserId};
pub use ledger::{replay_balance, EntryKind, LedgerEntry};
pub use pricing::{quote_cost, PricingConfig, DEFAULT_MODEL_RATE};
pub use request::{GenerationRequest, DEFAULT_MODEL, MAX_IMAGE_COUNT, MAX_PROMPT_CHARS};
pub use task::{GeneratedAsset, GenerationTask, TaskStatus};
pub use usage::{week_start, UsageCounter};
