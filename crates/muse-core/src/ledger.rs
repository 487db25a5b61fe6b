//! Ledger entries.
//!
//! Every balance change appends exactly one immutable `LedgerEntry`. Entries
//! are never updated or removed; the account balance must always equal the
//! sum of its entries' deltas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntryId, MuseError, Result, TaskId, UserId};

/// An append-only record of one balance change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Time-ordered entry id.
    pub id: EntryId,

    /// Account owner.
    pub user_id: UserId,

    /// Signed change in tokens. Negative for deductions.
    pub delta: i64,

    /// What caused the change.
    pub kind: EntryKind,

    /// Human-readable audit description.
    pub reason: String,

    /// Generation task this entry belongs to, if any.
    pub task_id: Option<TaskId>,

    /// Additional correlation data (provider message, admin id, ...).
    pub metadata: serde_json::Value,

    /// Balance after applying this entry. Filled in by the store.
    pub balance_after: i64,

    /// When the entry was created.
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    fn build(
        user_id: UserId,
        delta: i64,
        kind: EntryKind,
        reason: String,
        task_id: Option<TaskId>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: EntryId::generate(),
            user_id,
            delta,
            kind,
            reason,
            task_id,
            metadata,
            balance_after: 0,
            created_at: Utc::now(),
        }
    }

    /// A deduction of `amount` tokens.
    ///
    /// # Errors
    ///
    /// Returns `MuseError::InvalidAmount` unless `amount > 0`.
    pub fn deduction(
        user_id: UserId,
        amount: i64,
        reason: impl Into<String>,
        task_id: Option<TaskId>,
    ) -> Result<Self> {
        ensure_positive(amount)?;
        Ok(Self::build(
            user_id,
            -amount,
            EntryKind::Deduction,
            reason.into(),
            task_id,
            serde_json::Value::Null,
        ))
    }

    /// A refund of `amount` tokens.
    ///
    /// # Errors
    ///
    /// Returns `MuseError::InvalidAmount` unless `amount > 0`.
    pub fn refund(
        user_id: UserId,
        amount: i64,
        reason: impl Into<String>,
        task_id: Option<TaskId>,
        metadata: serde_json::Value,
    ) -> Result<Self> {
        ensure_positive(amount)?;
        Ok(Self::build(
            user_id,
            amount,
            EntryKind::Refund,
            reason.into(),
            task_id,
            metadata,
        ))
    }

    /// A grant of `amount` tokens (purchase, promotion, admin top-up).
    ///
    /// # Errors
    ///
    /// Returns `MuseError::InvalidAmount` unless `amount > 0`.
    pub fn grant(
        user_id: UserId,
        amount: i64,
        reason: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Result<Self> {
        ensure_positive(amount)?;
        Ok(Self::build(
            user_id,
            amount,
            EntryKind::Grant,
            reason.into(),
            None,
            metadata,
        ))
    }

    /// Absolute number of tokens moved.
    #[must_use]
    pub const fn amount(&self) -> i64 {
        self.delta.abs()
    }
}

fn ensure_positive(amount: i64) -> Result<()> {
    if amount > 0 {
        Ok(())
    } else {
        Err(MuseError::InvalidAmount(amount))
    }
}

/// Kind of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Tokens charged for a generation.
    Deduction,
    /// Tokens returned after a failed generation.
    Refund,
    /// Tokens added from outside the generation workflow.
    Grant,
}

impl EntryKind {
    /// Stable lowercase name, used as a database value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deduction => "deduction",
            Self::Refund => "refund",
            Self::Grant => "grant",
        }
    }

    /// Parse the value produced by [`EntryKind::as_str`].
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deduction" => Some(Self::Deduction),
            "refund" => Some(Self::Refund),
            "grant" => Some(Self::Grant),
            _ => None,
        }
    }
}

/// Reconstruct a balance from its entry log.
#[must_use]
pub fn replay_balance(entries: &[LedgerEntry]) -> i64 {
    entries.iter().map(|entry| entry.delta).sum()
}
