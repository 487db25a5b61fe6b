//! In-memory storage implementation.
//!
//! All state sits behind one async mutex, so every trait method is trivially
//! atomic. Used by tests and by `STORE_BACKEND=memory` local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;

use muse_core::{
    week_start, GeneratedAsset, GenerationTask, LedgerEntry, TaskId, TaskStatus, TokenAccount,
    UsageCounter, UserId,
};

use crate::error::{Result, StoreError};
use crate::{
    asset_count, expect_credit, expect_deduction, expect_task_refund, Store, TaskFilter,
    Transition,
};

#[derive(Default)]
struct Inner {
    accounts: HashMap<UserId, TokenAccount>,
    /// Append-only, in insertion order.
    entries: Vec<LedgerEntry>,
    tasks: HashMap<TaskId, GenerationTask>,
    usage: HashMap<(UserId, NaiveDate), UsageCounter>,
}

impl Inner {
    fn account_mut(&mut self, user_id: UserId) -> &mut TokenAccount {
        self.accounts
            .entry(user_id)
            .or_insert_with(|| TokenAccount::new(user_id))
    }

    fn apply(&mut self, entry: &LedgerEntry) -> Result<LedgerEntry> {
        let mut applied = entry.clone();
        self.account_mut(entry.user_id).apply(&mut applied)?;
        self.entries.push(applied.clone());
        Ok(applied)
    }
}

/// Mutex-guarded in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_account(&self, account: &TokenAccount) -> Result<()> {
        self.inner
            .lock()
            .await
            .accounts
            .insert(account.user_id, account.clone());
        Ok(())
    }

    async fn get_account(&self, user_id: &UserId) -> Result<Option<TokenAccount>> {
        Ok(self.inner.lock().await.accounts.get(user_id).cloned())
    }

    async fn ensure_account(&self, user_id: &UserId) -> Result<TokenAccount> {
        Ok(self.inner.lock().await.account_mut(*user_id).clone())
    }

    async fn deduct(&self, entry: &LedgerEntry) -> Result<LedgerEntry> {
        expect_deduction(entry)?;
        let mut inner = self.inner.lock().await;

        let balance = inner.accounts.get(&entry.user_id).map_or(0, |a| a.balance);
        if balance < entry.amount() {
            return Err(StoreError::InsufficientTokens {
                balance,
                required: entry.amount(),
            });
        }

        inner.apply(entry)
    }

    async fn credit(&self, entry: &LedgerEntry) -> Result<LedgerEntry> {
        expect_credit(entry)?;
        self.inner.lock().await.apply(entry)
    }

    async fn list_entries(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .iter()
            .rev()
            .filter(|e| e.user_id == *user_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn entries_for_task(&self, task_id: &TaskId) -> Result<Vec<LedgerEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.task_id == Some(*task_id))
            .cloned()
            .collect())
    }

    async fn insert_task(&self, task: &GenerationTask) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists {
                entity: "task",
                id: task.id.to_string(),
            });
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<GenerationTask>> {
        Ok(self.inner.lock().await.tasks.get(task_id).cloned())
    }

    async fn find_task_by_provider_id(
        &self,
        provider_task_id: &str,
    ) -> Result<Option<GenerationTask>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .find(|t| t.provider_task_id.as_deref() == Some(provider_task_id))
            .cloned())
    }

    async fn list_tasks_by_user(
        &self,
        user_id: &UserId,
        filter: &TaskFilter,
    ) -> Result<Vec<GenerationTask>> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<_> = inner
            .tasks
            .values()
            .filter(|t| t.user_id == *user_id && filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(tasks
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn list_stale_tasks(
        &self,
        status: TaskStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationTask>> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<_> = inner
            .tasks
            .values()
            .filter(|t| t.status == status && t.updated_at < updated_before)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn mark_processing(
        &self,
        task_id: &TaskId,
        provider_task_id: &str,
    ) -> Result<GenerationTask> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::task_not_found(task_id))?;

        task.mark_processing(provider_task_id)?;
        Ok(task.clone())
    }

    async fn complete_task(
        &self,
        task_id: &TaskId,
        assets: Vec<GeneratedAsset>,
    ) -> Result<Transition> {
        let mut inner = self.inner.lock().await;
        let mut task = inner
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| StoreError::task_not_found(task_id))?;

        if task.status.is_terminal() {
            return Ok(Transition::AlreadyTerminal(task));
        }

        let images = asset_count(&assets);
        task.succeed(assets)?;

        let week = week_start(task.updated_at);
        inner
            .usage
            .entry((task.user_id, week))
            .or_insert_with(|| UsageCounter::new(task.user_id, week))
            .record(images);
        inner.tasks.insert(task.id, task.clone());

        Ok(Transition::Applied(task))
    }

    async fn fail_task(
        &self,
        task_id: &TaskId,
        reason: &str,
        refund: Option<LedgerEntry>,
    ) -> Result<Transition> {
        let mut inner = self.inner.lock().await;
        let mut task = inner
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| StoreError::task_not_found(task_id))?;

        if task.status.is_terminal() {
            return Ok(Transition::AlreadyTerminal(task));
        }

        let refund = refund.filter(|_| task.refund_entry_id.is_none());
        if let Some(entry) = &refund {
            expect_task_refund(&task, entry)?;
        }
        task.fail(reason, refund.as_ref().map(|e| e.id))?;

        if let Some(entry) = &refund {
            inner.apply(entry)?;
        }
        inner.tasks.insert(task.id, task.clone());

        Ok(Transition::Applied(task))
    }

    async fn weekly_usage(&self, user_id: &UserId, week_start: NaiveDate) -> Result<u32> {
        Ok(self
            .inner
            .lock()
            .await
            .usage
            .get(&(*user_id, week_start))
            .map_or(0, |c| c.images_generated))
    }
}
