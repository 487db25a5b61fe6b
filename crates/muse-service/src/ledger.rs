//! Token ledger.
//!
//! Every balance change goes through here as an immutable [`LedgerEntry`];
//! the store applies the entry and the balance update together.

use std::sync::Arc;

use muse_core::{LedgerEntry, TaskId, TokenAccount, UserId};
use muse_store::{Result, Store};

/// Ledger facade over the store.
#[derive(Clone)]
pub struct TokenLedger {
    store: Arc<dyn Store>,
}

impl TokenLedger {
    /// Create a ledger backed by `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Atomically deduct `amount` tokens if the balance covers it.
    ///
    /// # Errors
    ///
    /// - `StoreError::InsufficientTokens` if the balance is too low; nothing
    ///   is written.
    /// - `StoreError::Invalid` if `amount` is not positive.
    pub async fn deduct(
        &self,
        user_id: UserId,
        amount: i64,
        reason: &str,
        task_id: Option<TaskId>,
    ) -> Result<LedgerEntry> {
        let entry = LedgerEntry::deduction(user_id, amount, reason, task_id)?;
        let entry = self.store.deduct(&entry).await?;

        tracing::info!(
            user_id = %user_id,
            task_id = ?task_id,
            amount,
            balance_after = entry.balance_after,
            "Tokens deducted"
        );

        Ok(entry)
    }

    /// Unconditionally return `amount` tokens.
    ///
    /// Used directly only when no task record exists to carry the refund;
    /// task refunds go through `Store::fail_task` so they are issued once.
    ///
    /// # Errors
    ///
    /// Returns an error if `amount` is not positive or the write fails.
    pub async fn refund(
        &self,
        user_id: UserId,
        amount: i64,
        reason: &str,
        task_id: Option<TaskId>,
    ) -> Result<LedgerEntry> {
        let entry = LedgerEntry::refund(user_id, amount, reason, task_id, serde_json::Value::Null)?;
        let entry = self.store.credit(&entry).await?;

        tracing::info!(
            user_id = %user_id,
            task_id = ?task_id,
            amount,
            balance_after = entry.balance_after,
            "Tokens refunded"
        );

        Ok(entry)
    }

    /// Add `amount` tokens to a user's balance.
    ///
    /// # Errors
    ///
    /// Returns an error if `amount` is not positive or the write fails.
    pub async fn grant(
        &self,
        user_id: UserId,
        amount: i64,
        reason: &str,
        metadata: serde_json::Value,
    ) -> Result<LedgerEntry> {
        let entry = LedgerEntry::grant(user_id, amount, reason, metadata)?;
        let entry = self.store.credit(&entry).await?;

        tracing::info!(
            user_id = %user_id,
            amount,
            balance_after = entry.balance_after,
            reason,
            "Tokens granted"
        );

        Ok(entry)
    }

    /// Current balance; a user without an account has zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn balance(&self, user_id: &UserId) -> Result<i64> {
        Ok(self
            .store
            .get_account(user_id)
            .await?
            .map_or(0, |account| account.balance))
    }

    /// The account record, or an empty one if the user has none yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn account(&self, user_id: &UserId) -> Result<TokenAccount> {
        Ok(self
            .store
            .get_account(user_id)
            .await?
            .unwrap_or_else(|| TokenAccount::new(*user_id)))
    }

    /// A user's entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn entries(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        self.store.list_entries(user_id, limit, offset).await
    }
}
