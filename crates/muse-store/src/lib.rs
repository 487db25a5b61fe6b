//! Storage layer for Muse.
//!
//! This crate persists token accounts, ledger entries, generation tasks and
//! weekly usage counters behind the async [`Store`] trait.
//!
//! # Backends
//!
//! - [`MemoryStore`]: everything behind one mutex; tests and local runs
//! - [`RocksStore`]: `RocksDB` with column families (feature `rocksdb-backend`)
//! - [`PgStore`]: PostgreSQL via `sqlx` (feature `postgres-backend`)
//!
//! # Atomicity
//!
//! Every backend provides the same guarantees:
//!
//! - `deduct` checks and decrements the balance in one step and never leaves
//!   a negative balance behind;
//! - `complete_task` and `fail_task` write their side effect (assets and usage
//!   counter, or refund) together with the terminal status, so a reader never
//!   sees the status without the side effect;
//! - a terminal task is never rewritten. A second resolution returns
//!   [`Transition::AlreadyTerminal`] and writes nothing.
//!
//! # Example
//!
//! ```no_run
//! use muse_core::{LedgerEntry, UserId};
//! use muse_store::{MemoryStore, Store};
//!
//! # async fn run() -> muse_store::Result<()> {
//! let store = MemoryStore::new();
//! let user_id = UserId::generate();
//!
//! let grant = LedgerEntry::grant(user_id, 50, "welcome bonus", serde_json::Value::Null)?;
//! store.credit(&grant).await?;
//!
//! let account = store.get_account(&user_id).await?;
//! assert_eq!(account.map(|a| a.balance), Some(50));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;

#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

#[cfg(feature = "postgres-backend")]
pub mod postgres;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;

#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

#[cfg(feature = "postgres-backend")]
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use muse_core::{
    CharacterId, GeneratedAsset, GenerationTask, LedgerEntry, TaskId, TaskStatus, TokenAccount,
    UserId,
};

/// Default page size for listings.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Outcome of a terminal task transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The transition and its side effect were written.
    Applied(GenerationTask),
    /// The task was already terminal; nothing was written.
    AlreadyTerminal(GenerationTask),
}

impl Transition {
    /// The task as stored after the call.
    #[must_use]
    pub const fn task(&self) -> &GenerationTask {
        match self {
            Self::Applied(task) | Self::AlreadyTerminal(task) => task,
        }
    }

    /// Consume into the stored task.
    #[must_use]
    pub fn into_task(self) -> GenerationTask {
        match self {
            Self::Applied(task) | Self::AlreadyTerminal(task) => task,
        }
    }

    /// Whether this call performed the transition.
    #[must_use]
    pub const fn was_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Filter for listing a user's tasks, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFilter {
    /// Only tasks linked to this character.
    pub character_id: Option<CharacterId>,
    /// Only tasks in this status.
    pub status: Option<TaskStatus>,
    /// Page size.
    pub limit: usize,
    /// Tasks to skip.
    pub offset: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            character_id: None,
            status: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl TaskFilter {
    /// Whether `task` passes the character and status filters.
    #[must_use]
    pub fn matches(&self, task: &GenerationTask) -> bool {
        self.character_id
            .map_or(true, |id| task.character_id == Some(id))
            && self.status.map_or(true, |status| task.status == status)
    }
}

/// The storage trait defining all database operations.
///
/// Implementations are shared across request handlers as `Arc<dyn Store>`.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Insert or replace an account record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn put_account(&self, account: &TokenAccount) -> Result<()>;

    /// Get an account by user ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_account(&self, user_id: &UserId) -> Result<Option<TokenAccount>>;

    /// Get an account, creating an empty one if the user has none.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn ensure_account(&self, user_id: &UserId) -> Result<TokenAccount>;

    // =========================================================================
    // Ledger Operations
    // =========================================================================

    /// Apply a deduction entry if the balance covers it.
    ///
    /// The balance check, the decrement and the entry append are one atomic
    /// step. A user without an account has a balance of zero. Returns the
    /// entry with `balance_after` filled in.
    ///
    /// # Errors
    ///
    /// - `StoreError::InsufficientTokens` if the balance is too low; nothing
    ///   is written.
    /// - `StoreError::Invalid` if `entry` is not a deduction.
    async fn deduct(&self, entry: &LedgerEntry) -> Result<LedgerEntry>;

    /// Apply a refund or grant entry unconditionally.
    ///
    /// Creates the account if needed. Returns the entry with `balance_after`
    /// filled in.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Invalid` if `entry` is a deduction.
    async fn credit(&self, entry: &LedgerEntry) -> Result<LedgerEntry>;

    /// List a user's ledger entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_entries(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>>;

    /// All ledger entries correlated with a task, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn entries_for_task(&self, task_id: &TaskId) -> Result<Vec<LedgerEntry>>;

    // =========================================================================
    // Task Operations
    // =========================================================================

    /// Insert a new task.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the id is taken.
    async fn insert_task(&self, task: &GenerationTask) -> Result<()>;

    /// Get a task by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_task(&self, task_id: &TaskId) -> Result<Option<GenerationTask>>;

    /// Find a task by the id the provider assigned to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_task_by_provider_id(
        &self,
        provider_task_id: &str,
    ) -> Result<Option<GenerationTask>>;

    /// List a user's tasks, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_tasks_by_user(
        &self,
        user_id: &UserId,
        filter: &TaskFilter,
    ) -> Result<Vec<GenerationTask>>;

    /// Tasks in `status` whose last update is older than `updated_before`,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_stale_tasks(
        &self,
        status: TaskStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationTask>>;

    /// Record the provider's task id and move `pending -> processing`.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the task doesn't exist.
    /// - `StoreError::InvalidTransition` if the task is not pending.
    async fn mark_processing(
        &self,
        task_id: &TaskId,
        provider_task_id: &str,
    ) -> Result<GenerationTask>;

    /// Store the result assets, bump the owner's weekly usage counter by the
    /// number of assets, then mark the task `succeeded`.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the task doesn't exist.
    /// - `StoreError::InvalidTransition` if the task is still pending.
    async fn complete_task(
        &self,
        task_id: &TaskId,
        assets: Vec<GeneratedAsset>,
    ) -> Result<Transition>;

    /// Apply `refund` (if given and none was recorded yet), then mark the task
    /// `failed` with `reason`.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the task doesn't exist.
    /// - `StoreError::Invalid` if `refund` is not a refund for the task owner.
    async fn fail_task(
        &self,
        task_id: &TaskId,
        reason: &str,
        refund: Option<LedgerEntry>,
    ) -> Result<Transition>;

    // =========================================================================
    // Usage Operations
    // =========================================================================

    /// Images a user generated in the week starting `week_start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn weekly_usage(&self, user_id: &UserId, week_start: NaiveDate) -> Result<u32>;
}

/// Check that `entry` is a deduction.
pub(crate) fn expect_deduction(entry: &LedgerEntry) -> Result<()> {
    if entry.kind == muse_core::EntryKind::Deduction {
        Ok(())
    } else {
        Err(StoreError::Invalid(format!(
            "expected a deduction, got {}",
            entry.kind.as_str()
        )))
    }
}

/// Check that `entry` adds tokens.
pub(crate) fn expect_credit(entry: &LedgerEntry) -> Result<()> {
    if entry.kind == muse_core::EntryKind::Deduction {
        Err(StoreError::Invalid("expected a refund or grant".into()))
    } else {
        Ok(())
    }
}

/// Check that `refund` belongs to `task`.
pub(crate) fn expect_task_refund(task: &GenerationTask, refund: &LedgerEntry) -> Result<()> {
    if refund.kind != muse_core::EntryKind::Refund || refund.user_id != task.user_id {
        return Err(StoreError::Invalid(format!(
            "entry {} is not a refund for task {}",
            refund.id, task.id
        )));
    }
    Ok(())
}

/// Number of assets as a usage increment.
pub(crate) fn asset_count(assets: &[GeneratedAsset]) -> u32 {
    u32::try_from(assets.len()).unwrap_or(u32::MAX)
}
