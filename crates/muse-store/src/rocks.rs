//! `RocksDB` storage implementation.
//!
//! Values are CBOR. Read-modify-write operations run under a single write
//! lock and commit through one `WriteBatch`, which gives the conditional
//! deduct and the terminal transitions their atomicity.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use tokio::sync::Mutex;

use muse_core::{
    week_start, GeneratedAsset, GenerationTask, LedgerEntry, TaskId, TaskStatus, TokenAccount,
    UsageCounter, UserId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{
    asset_count, expect_credit, expect_deduction, expect_task_refund, Store, TaskFilter,
    Transition,
};

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn read<T>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Keys of `cf_name` starting with `prefix`, in key order.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    fn load_account(&self, user_id: &UserId) -> Result<TokenAccount> {
        Ok(self
            .read(cf::ACCOUNTS, &keys::account_key(user_id))?
            .unwrap_or_else(|| TokenAccount::new(*user_id)))
    }

    fn load_task(&self, task_id: &TaskId) -> Result<GenerationTask> {
        self.read(cf::TASKS, &keys::task_key(task_id))?
            .ok_or_else(|| StoreError::task_not_found(task_id))
    }

    fn load_entries<I>(&self, index_keys: I) -> Result<Vec<LedgerEntry>>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut entries = Vec::new();
        for key in index_keys {
            let entry_id = keys::trailing_entry_id(&key)?;
            if let Some(entry) = self.read(cf::LEDGER_ENTRIES, &keys::entry_key(&entry_id))? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Apply `entry` to `account` and stage the account, the entry and its
    /// indexes.
    fn stage_entry(
        &self,
        batch: &mut WriteBatch,
        account: &mut TokenAccount,
        entry: &LedgerEntry,
    ) -> Result<LedgerEntry> {
        let mut applied = entry.clone();
        account.apply(&mut applied)?;

        let cf_accounts = self.cf(cf::ACCOUNTS)?;
        let cf_entries = self.cf(cf::LEDGER_ENTRIES)?;
        let cf_by_user = self.cf(cf::ENTRIES_BY_USER)?;

        batch.put_cf(
            &cf_accounts,
            keys::account_key(&account.user_id),
            Self::serialize(&*account)?,
        );
        batch.put_cf(&cf_entries, keys::entry_key(&applied.id), Self::serialize(&applied)?);
        batch.put_cf(&cf_by_user, keys::user_entry_key(&applied.user_id, &applied.id), []);

        if let Some(task_id) = &applied.task_id {
            let cf_by_task = self.cf(cf::ENTRIES_BY_TASK)?;
            batch.put_cf(&cf_by_task, keys::task_entry_key(task_id, &applied.id), []);
        }

        Ok(applied)
    }

    /// Stage a task record and move its status index from `previous`.
    fn stage_task(
        &self,
        batch: &mut WriteBatch,
        task: &GenerationTask,
        previous: Option<TaskStatus>,
    ) -> Result<()> {
        let cf_tasks = self.cf(cf::TASKS)?;
        let cf_by_status = self.cf(cf::TASKS_BY_STATUS)?;

        if let Some(previous) = previous {
            batch.delete_cf(&cf_by_status, keys::status_task_key(previous, &task.id));
        }
        batch.put_cf(&cf_by_status, keys::status_task_key(task.status, &task.id), []);

        if let Some(provider_task_id) = &task.provider_task_id {
            let cf_by_provider = self.cf(cf::TASKS_BY_PROVIDER_ID)?;
            batch.put_cf(
                &cf_by_provider,
                keys::provider_task_key(provider_task_id),
                keys::task_key(&task.id),
            );
        }

        // Status record last.
        batch.put_cf(&cf_tasks, keys::task_key(&task.id), Self::serialize(task)?);
        Ok(())
    }
}

#[async_trait]
impl Store for RocksStore {
    // =========================================================================
    // Account Operations
    // =========================================================================

    async fn put_account(&self, account: &TokenAccount) -> Result<()> {
        let cf = self.cf(cf::ACCOUNTS)?;
        self.db
            .put_cf(
                &cf,
                keys::account_key(&account.user_id),
                Self::serialize(account)?,
            )
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn get_account(&self, user_id: &UserId) -> Result<Option<TokenAccount>> {
        self.read(cf::ACCOUNTS, &keys::account_key(user_id))
    }

    async fn ensure_account(&self, user_id: &UserId) -> Result<TokenAccount> {
        let _guard = self.write_lock.lock().await;
        if let Some(account) = self.read(cf::ACCOUNTS, &keys::account_key(user_id))? {
            return Ok(account);
        }

        let account = TokenAccount::new(*user_id);
        let cf = self.cf(cf::ACCOUNTS)?;
        self.db
            .put_cf(&cf, keys::account_key(user_id), Self::serialize(&account)?)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(account)
    }

    // =========================================================================
    // Ledger Operations
    // =========================================================================

    async fn deduct(&self, entry: &LedgerEntry) -> Result<LedgerEntry> {
        expect_deduction(entry)?;
        let _guard = self.write_lock.lock().await;

        let mut account = self.load_account(&entry.user_id)?;
        let mut batch = WriteBatch::default();
        let applied = self.stage_entry(&mut batch, &mut account, entry)?;
        self.write(batch)?;

        Ok(applied)
    }

    async fn credit(&self, entry: &LedgerEntry) -> Result<LedgerEntry> {
        expect_credit(entry)?;
        let _guard = self.write_lock.lock().await;

        let mut account = self.load_account(&entry.user_id)?;
        let mut batch = WriteBatch::default();
        let applied = self.stage_entry(&mut batch, &mut account, entry)?;
        self.write(batch)?;

        Ok(applied)
    }

    async fn list_entries(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let mut index_keys = self.scan_prefix(cf::ENTRIES_BY_USER, user_id.as_bytes())?;
        index_keys.reverse();
        self.load_entries(index_keys.into_iter().skip(offset).take(limit))
    }

    async fn entries_for_task(&self, task_id: &TaskId) -> Result<Vec<LedgerEntry>> {
        let index_keys = self.scan_prefix(cf::ENTRIES_BY_TASK, task_id.as_bytes())?;
        self.load_entries(index_keys)
    }

    // =========================================================================
    // Task Operations
    // =========================================================================

    async fn insert_task(&self, task: &GenerationTask) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self
            .read::<GenerationTask>(cf::TASKS, &keys::task_key(&task.id))?
            .is_some()
        {
            return Err(StoreError::AlreadyExists {
                entity: "task",
                id: task.id.to_string(),
            });
        }

        let cf_by_user = self.cf(cf::TASKS_BY_USER)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_by_user,
            keys::user_task_key(&task.user_id, task.created_at, &task.id),
            [],
        );
        self.stage_task(&mut batch, task, None)?;
        self.write(batch)
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<GenerationTask>> {
        self.read(cf::TASKS, &keys::task_key(task_id))
    }

    async fn find_task_by_provider_id(
        &self,
        provider_task_id: &str,
    ) -> Result<Option<GenerationTask>> {
        let cf = self.cf(cf::TASKS_BY_PROVIDER_ID)?;
        let Some(task_key) = self
            .db
            .get_cf(&cf, keys::provider_task_key(provider_task_id))
            .map_err(|e| StoreError::Database(e.to_string()))?
        else {
            return Ok(None);
        };

        self.read(cf::TASKS, &task_key)
    }

    async fn list_tasks_by_user(
        &self,
        user_id: &UserId,
        filter: &TaskFilter,
    ) -> Result<Vec<GenerationTask>> {
        let mut index_keys = self.scan_prefix(cf::TASKS_BY_USER, user_id.as_bytes())?;
        index_keys.reverse();

        let mut tasks = Vec::new();
        let mut skipped = 0;
        for key in index_keys {
            if tasks.len() >= filter.limit {
                break;
            }
            let task_id = keys::trailing_task_id(&key)?;
            let Some(task) = self.read::<GenerationTask>(cf::TASKS, &keys::task_key(&task_id))?
            else {
                continue;
            };
            if !filter.matches(&task) {
                continue;
            }
            if skipped < filter.offset {
                skipped += 1;
                continue;
            }
            tasks.push(task);
        }

        Ok(tasks)
    }

    async fn list_stale_tasks(
        &self,
        status: TaskStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationTask>> {
        let index_keys = self.scan_prefix(cf::TASKS_BY_STATUS, &[keys::status_tag(status)])?;

        let mut tasks = Vec::new();
        for key in index_keys {
            let task_id = keys::trailing_task_id(&key)?;
            if let Some(task) = self.read::<GenerationTask>(cf::TASKS, &keys::task_key(&task_id))? {
                if task.status == status && task.updated_at < updated_before {
                    tasks.push(task);
                }
            }
        }
        tasks.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        tasks.truncate(limit);

        Ok(tasks)
    }

    async fn mark_processing(
        &self,
        task_id: &TaskId,
        provider_task_id: &str,
    ) -> Result<GenerationTask> {
        let _guard = self.write_lock.lock().await;
        let mut task = self.load_task(task_id)?;
        let previous = task.status;
        task.mark_processing(provider_task_id)?;

        let mut batch = WriteBatch::default();
        self.stage_task(&mut batch, &task, Some(previous))?;
        self.write(batch)?;

        Ok(task)
    }

    async fn complete_task(
        &self,
        task_id: &TaskId,
        assets: Vec<GeneratedAsset>,
    ) -> Result<Transition> {
        let _guard = self.write_lock.lock().await;
        let mut task = self.load_task(task_id)?;
        if task.status.is_terminal() {
            return Ok(Transition::AlreadyTerminal(task));
        }

        let previous = task.status;
        let images = asset_count(&assets);
        task.succeed(assets)?;

        let week = week_start(task.updated_at);
        let usage_key = keys::usage_key(&task.user_id, week);
        let mut counter = self
            .read(cf::WEEKLY_USAGE, &usage_key)?
            .unwrap_or_else(|| UsageCounter::new(task.user_id, week));
        counter.record(images);

        let cf_usage = self.cf(cf::WEEKLY_USAGE)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_usage, &usage_key, Self::serialize(&counter)?);
        self.stage_task(&mut batch, &task, Some(previous))?;
        self.write(batch)?;

        Ok(Transition::Applied(task))
    }

    async fn fail_task(
        &self,
        task_id: &TaskId,
        reason: &str,
        refund: Option<LedgerEntry>,
    ) -> Result<Transition> {
        let _guard = self.write_lock.lock().await;
        let mut task = self.load_task(task_id)?;
        if task.status.is_terminal() {
            return Ok(Transition::AlreadyTerminal(task));
        }

        let previous = task.status;
        let refund = refund.filter(|_| task.refund_entry_id.is_none());
        let mut batch = WriteBatch::default();

        if let Some(entry) = &refund {
            expect_task_refund(&task, entry)?;
            let mut account = self.load_account(&entry.user_id)?;
            self.stage_entry(&mut batch, &mut account, entry)?;
        }

        task.fail(reason, refund.as_ref().map(|e| e.id))?;
        self.stage_task(&mut batch, &task, Some(previous))?;
        self.write(batch)?;

        Ok(Transition::Applied(task))
    }

    // =========================================================================
    // Usage Operations
    // =========================================================================

    async fn weekly_usage(&self, user_id: &UserId, week_start: NaiveDate) -> Result<u32> {
        Ok(self
            .read::<UsageCounter>(cf::WEEKLY_USAGE, &keys::usage_key(user_id, week_start))?
            .map_or(0, |c| c.images_generated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muse_core::{EntryId, GenerationRequest};
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn new_task(user_id: UserId, tokens: i64) -> GenerationTask {
        GenerationTask::new(
            TaskId::generate(),
            user_id,
            &GenerationRequest::new("koi pond, ink wash").with_image_count(4),
        )
        .with_charge(tokens, EntryId::generate())
    }

    #[tokio::test]
    async fn ledger_round_trip() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();

        let grant = LedgerEntry::grant(user_id, 50, "welcome", serde_json::Value::Null).unwrap();
        store.credit(&grant).await.unwrap();

        std::thread::sleep(std::time::Duration::from_millis(2));

        let charge = LedgerEntry::deduction(user_id, 20, "batch of 4", None).unwrap();
        let applied = store.deduct(&charge).await.unwrap();
        assert_eq!(applied.balance_after, 30);

        let account = store.get_account(&user_id).await.unwrap().unwrap();
        assert_eq!(account.balance, 30);
        assert_eq!(account.lifetime_charged, 20);

        // Newest first
        let entries = store.list_entries(&user_id, 10, 0).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].delta, -20);
        assert_eq!(entries[1].delta, 50);

        let page2 = store.list_entries(&user_id, 1, 1).await.unwrap();
        assert_eq!(page2[0].id, grant.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deducts_never_overdraw() {
        let (store, _dir) = create_test_store();
        let store = std::sync::Arc::new(store);
        let user_id = UserId::generate();
        let grant = LedgerEntry::grant(user_id, 50, "welcome", serde_json::Value::Null).unwrap();
        store.credit(&grant).await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move {
                    let entry = LedgerEntry::deduction(user_id, 20, "batch", None).unwrap();
                    store.deduct(&entry).await
                })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(e) => assert!(matches!(e, StoreError::InsufficientTokens { .. })),
            }
        }

        assert_eq!(succeeded, 2);
        let account = store.get_account(&user_id).await.unwrap().unwrap();
        assert_eq!(account.balance, 10);
        assert_eq!(account.lifetime_charged, 40);

        let entries = store.list_entries(&user_id, 100, 0).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(muse_core::replay_balance(&entries), 10);
        assert!(entries.iter().all(|e| e.balance_after >= 0));
    }

    #[tokio::test]
    async fn insufficient_tokens_writes_nothing() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        let grant = LedgerEntry::grant(user_id, 10, "welcome", serde_json::Value::Null).unwrap();
        store.credit(&grant).await.unwrap();

        let charge = LedgerEntry::deduction(user_id, 20, "batch of 4", None).unwrap();
        let result = store.deduct(&charge).await;
        assert!(matches!(
            result,
            Err(StoreError::InsufficientTokens {
                balance: 10,
                required: 20
            })
        ));
        assert_eq!(store.list_entries(&user_id, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn task_lifecycle_with_refund() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        store
            .credit(&LedgerEntry::grant(user_id, 50, "welcome", serde_json::Value::Null).unwrap())
            .await
            .unwrap();

        let task = new_task(user_id, 20);
        store.insert_task(&task).await.unwrap();
        assert!(matches!(
            store.insert_task(&task).await,
            Err(StoreError::AlreadyExists { .. })
        ));

        store
            .deduct(&LedgerEntry::deduction(user_id, 20, "batch", Some(task.id)).unwrap())
            .await
            .unwrap();
        store.mark_processing(&task.id, "nv-123").await.unwrap();

        let by_provider = store.find_task_by_provider_id("nv-123").await.unwrap();
        assert_eq!(by_provider.map(|t| t.id), Some(task.id));

        let refund =
            LedgerEntry::refund(user_id, 20, "refund", Some(task.id), serde_json::Value::Null)
                .unwrap();
        let first = store
            .fail_task(&task.id, "queue timeout", Some(refund.clone()))
            .await
            .unwrap();
        assert!(first.was_applied());
        let second = store
            .fail_task(&task.id, "queue timeout", Some(refund))
            .await
            .unwrap();
        assert!(!second.was_applied());

        let entries = store.entries_for_task(&task.id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.iter().map(|e| e.delta).sum::<i64>(), 0);
        assert_eq!(
            store.get_account(&user_id).await.unwrap().unwrap().balance,
            50
        );

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("queue timeout"));
    }

    #[tokio::test]
    async fn status_index_follows_transitions() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        let task = new_task(user_id, 0);
        store.insert_task(&task).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        let pending = store
            .list_stale_tasks(TaskStatus::Pending, later, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        store.mark_processing(&task.id, "nv-9").await.unwrap();
        assert!(store
            .list_stale_tasks(TaskStatus::Pending, later, 10)
            .await
            .unwrap()
            .is_empty());

        let asset = GeneratedAsset {
            url: "https://cdn.example/koi.jpeg".into(),
            image_type: Some("jpeg".into()),
            url_ttl_seconds: None,
        };
        let done = store.complete_task(&task.id, vec![asset]).await.unwrap();
        assert!(done.was_applied());

        let week = week_start(done.task().updated_at);
        assert_eq!(store.weekly_usage(&user_id, week).await.unwrap(), 1);
        assert!(store
            .list_stale_tasks(TaskStatus::Processing, later, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn list_tasks_newest_first_with_filter() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        let character = muse_core::CharacterId::generate();

        let first = new_task(user_id, 0);
        store.insert_task(&first).await.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));

        let mut second = new_task(user_id, 0);
        second.character_id = Some(character);
        store.insert_task(&second).await.unwrap();

        let all = store
            .list_tasks_by_user(&user_id, &TaskFilter::default())
            .await
            .unwrap();
        assert_eq!(
            all.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![second.id, first.id]
        );

        let filter = TaskFilter {
            character_id: Some(character),
            ..TaskFilter::default()
        };
        let linked = store.list_tasks_by_user(&user_id, &filter).await.unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].id, second.id);
    }
}
