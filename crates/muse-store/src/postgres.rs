//! PostgreSQL storage implementation.
//!
//! The conditional deduct is a single `UPDATE ... WHERE balance >= $n`;
//! terminal transitions lock the task row with `SELECT ... FOR UPDATE` and
//! commit the side effect and the status in one transaction.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::QueryAs;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use muse_core::{
    week_start, CharacterId, EntryId, EntryKind, GeneratedAsset, GenerationTask, LedgerEntry,
    TaskId, TaskStatus, TokenAccount, UserId,
};

use crate::error::{Result, StoreError};
use crate::{
    asset_count, expect_credit, expect_deduction, expect_task_refund, Store, TaskFilter,
    Transition,
};

/// Maximum pooled connections.
const MAX_CONNECTIONS: u32 = 10;

/// SQLSTATE raised when `bigint` arithmetic overflows.
const NUMERIC_OUT_OF_RANGE: &str = "22003";

const TASK_COLUMNS: &str = "id, user_id, prompt, negative_prompt, model, image_count, width, \
     height, status, provider_task_id, tokens_charged, charge_entry_id, refund_entry_id, \
     failure_reason, assets, character_id, created_at, updated_at";

const ENTRY_COLUMNS: &str =
    "id, user_id, delta, kind, reason, task_id, metadata, balance_after, created_at";

const ACCOUNT_COLUMNS: &str = "user_id, balance, lifetime_charged, lifetime_refunded, \
     lifetime_granted, created_at, updated_at";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(err.to_string())
    }
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    user_id: Uuid,
    balance: i64,
    lifetime_charged: i64,
    lifetime_refunded: i64,
    lifetime_granted: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for TokenAccount {
    fn from(row: AccountRow) -> Self {
        Self {
            user_id: UserId::from_uuid(row.user_id),
            balance: row.balance,
            lifetime_charged: row.lifetime_charged,
            lifetime_refunded: row.lifetime_refunded,
            lifetime_granted: row.lifetime_granted,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EntryRow {
    id: String,
    user_id: Uuid,
    delta: i64,
    kind: String,
    reason: String,
    task_id: Option<Uuid>,
    metadata: Value,
    balance_after: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<EntryRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self> {
        Ok(Self {
            id: parse_entry_id(&row.id)?,
            user_id: UserId::from_uuid(row.user_id),
            delta: row.delta,
            kind: EntryKind::parse(&row.kind).ok_or_else(|| {
                StoreError::Serialization(format!("unknown entry kind: {}", row.kind))
            })?,
            reason: row.reason,
            task_id: row.task_id.map(TaskId::from_uuid),
            metadata: row.metadata,
            balance_after: row.balance_after,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    user_id: Uuid,
    prompt: String,
    negative_prompt: String,
    model: String,
    image_count: i32,
    width: i32,
    height: i32,
    status: String,
    provider_task_id: Option<String>,
    tokens_charged: i64,
    charge_entry_id: Option<String>,
    refund_entry_id: Option<String>,
    failure_reason: Option<String>,
    assets: Value,
    character_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for GenerationTask {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Self {
            id: TaskId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            prompt: row.prompt,
            negative_prompt: row.negative_prompt,
            model: row.model,
            image_count: to_u32(row.image_count)?,
            width: to_u32(row.width)?,
            height: to_u32(row.height)?,
            status: TaskStatus::parse(&row.status).ok_or_else(|| {
                StoreError::Serialization(format!("unknown task status: {}", row.status))
            })?,
            provider_task_id: row.provider_task_id,
            tokens_charged: row.tokens_charged,
            charge_entry_id: row.charge_entry_id.as_deref().map(parse_entry_id).transpose()?,
            refund_entry_id: row.refund_entry_id.as_deref().map(parse_entry_id).transpose()?,
            failure_reason: row.failure_reason,
            assets: serde_json::from_value(row.assets)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            character_id: row.character_id.map(CharacterId::from_uuid),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn parse_entry_id(value: &str) -> Result<EntryId> {
    EntryId::from_str(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn to_u32(value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|_| StoreError::Serialization(format!("negative count: {value}")))
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| StoreError::Invalid(format!("value out of range: {value}")))
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// ============================================================================
// Store
// ============================================================================

/// PostgreSQL-backed storage implementation.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to `database_url` and run pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or a migration fails.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(database_url)
            .await?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool without running migrations.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("PostgreSQL migrations applied");
        Ok(())
    }

    async fn insert_account_if_missing(
        tx: &mut Transaction<'_, Postgres>,
        user_id: &UserId,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO token_accounts (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id.as_uuid())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_entry(tx: &mut Transaction<'_, Postgres>, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO ledger_entries \
             (id, user_id, delta, kind, reason, task_id, metadata, balance_after, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.id.to_string())
        .bind(entry.user_id.as_uuid())
        .bind(entry.delta)
        .bind(entry.kind.as_str())
        .bind(&entry.reason)
        .bind(entry.task_id.map(|id| *id.as_uuid()))
        .bind(&entry.metadata)
        .bind(entry.balance_after)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Add a refund or grant to the balance and append it.
    async fn apply_credit(
        tx: &mut Transaction<'_, Postgres>,
        entry: &LedgerEntry,
    ) -> Result<LedgerEntry> {
        let sql = match entry.kind {
            EntryKind::Refund => {
                "UPDATE token_accounts SET balance = balance + $2, \
                 lifetime_refunded = lifetime_refunded + $2, updated_at = now() \
                 WHERE user_id = $1 RETURNING balance"
            }
            EntryKind::Grant => {
                "UPDATE token_accounts SET balance = balance + $2, \
                 lifetime_granted = lifetime_granted + $2, updated_at = now() \
                 WHERE user_id = $1 RETURNING balance"
            }
            EntryKind::Deduction => {
                return Err(StoreError::Invalid("expected a refund or grant".into()))
            }
        };

        Self::insert_account_if_missing(tx, &entry.user_id).await?;
        let (balance,): (i64,) = sqlx::query_as(sql)
            .bind(entry.user_id.as_uuid())
            .bind(entry.amount())
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.code().as_deref() == Some(NUMERIC_OUT_OF_RANGE) => {
                    StoreError::Invalid(format!("balance overflow: amount={}", entry.amount()))
                }
                _ => e.into(),
            })?;

        let mut applied = entry.clone();
        applied.balance_after = balance;
        Self::insert_entry(tx, &applied).await?;
        Ok(applied)
    }

    async fn lock_task(
        tx: &mut Transaction<'_, Postgres>,
        task_id: &TaskId,
    ) -> Result<GenerationTask> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM generation_tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(task_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?;

        row.ok_or_else(|| StoreError::task_not_found(task_id))?
            .try_into()
    }

    async fn fetch_tasks(
        &self,
        query: QueryAs<'_, Postgres, TaskRow, PgArguments>,
    ) -> Result<Vec<GenerationTask>> {
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(GenerationTask::try_from)
            .collect()
    }
}

#[async_trait]
impl Store for PgStore {
    // =========================================================================
    // Account Operations
    // =========================================================================

    async fn put_account(&self, account: &TokenAccount) -> Result<()> {
        sqlx::query(
            "INSERT INTO token_accounts \
             (user_id, balance, lifetime_charged, lifetime_refunded, lifetime_granted, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (user_id) DO UPDATE SET \
             balance = EXCLUDED.balance, lifetime_charged = EXCLUDED.lifetime_charged, \
             lifetime_refunded = EXCLUDED.lifetime_refunded, lifetime_granted = EXCLUDED.lifetime_granted, \
             updated_at = EXCLUDED.updated_at",
        )
        .bind(account.user_id.as_uuid())
        .bind(account.balance)
        .bind(account.lifetime_charged)
        .bind(account.lifetime_refunded)
        .bind(account.lifetime_granted)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_account(&self, user_id: &UserId) -> Result<Option<TokenAccount>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM token_accounts WHERE user_id = $1"
        ))
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(TokenAccount::from))
    }

    async fn ensure_account(&self, user_id: &UserId) -> Result<TokenAccount> {
        let row: AccountRow = sqlx::query_as(&format!(
            "WITH inserted AS ( \
                 INSERT INTO token_accounts (user_id) VALUES ($1) \
                 ON CONFLICT (user_id) DO NOTHING RETURNING {ACCOUNT_COLUMNS} \
             ) \
             SELECT {ACCOUNT_COLUMNS} FROM inserted \
             UNION ALL \
             SELECT {ACCOUNT_COLUMNS} FROM token_accounts WHERE user_id = $1 \
             LIMIT 1"
        ))
        .bind(user_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    // =========================================================================
    // Ledger Operations
    // =========================================================================

    async fn deduct(&self, entry: &LedgerEntry) -> Result<LedgerEntry> {
        expect_deduction(entry)?;
        let amount = entry.amount();
        let mut tx = self.pool.begin().await?;

        Self::insert_account_if_missing(&mut tx, &entry.user_id).await?;

        let updated: Option<(i64,)> = sqlx::query_as(
            "UPDATE token_accounts SET balance = balance - $2, \
             lifetime_charged = lifetime_charged + $2, updated_at = now() \
             WHERE user_id = $1 AND balance >= $2 RETURNING balance",
        )
        .bind(entry.user_id.as_uuid())
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((balance,)) = updated else {
            let (balance,): (i64,) =
                sqlx::query_as("SELECT balance FROM token_accounts WHERE user_id = $1")
                    .bind(entry.user_id.as_uuid())
                    .fetch_one(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Err(StoreError::InsufficientTokens {
                balance,
                required: amount,
            });
        };

        let mut applied = entry.clone();
        applied.balance_after = balance;
        Self::insert_entry(&mut tx, &applied).await?;
        tx.commit().await?;

        Ok(applied)
    }

    async fn credit(&self, entry: &LedgerEntry) -> Result<LedgerEntry> {
        expect_credit(entry)?;
        let mut tx = self.pool.begin().await?;
        let applied = Self::apply_credit(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(applied)
    }

    async fn list_entries(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE user_id = $1 \
             ORDER BY id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id.as_uuid())
        .bind(to_i64(limit))
        .bind(to_i64(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn entries_for_task(&self, task_id: &TaskId) -> Result<Vec<LedgerEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE task_id = $1 ORDER BY id"
        ))
        .bind(task_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    // =========================================================================
    // Task Operations
    // =========================================================================

    async fn insert_task(&self, task: &GenerationTask) -> Result<()> {
        let assets =
            serde_json::to_value(&task.assets).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(&format!(
            "INSERT INTO generation_tasks ({TASK_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
        ))
        .bind(task.id.as_uuid())
        .bind(task.user_id.as_uuid())
        .bind(&task.prompt)
        .bind(&task.negative_prompt)
        .bind(&task.model)
        .bind(to_i32(task.image_count)?)
        .bind(to_i32(task.width)?)
        .bind(to_i32(task.height)?)
        .bind(task.status.as_str())
        .bind(&task.provider_task_id)
        .bind(task.tokens_charged)
        .bind(task.charge_entry_id.map(|id| id.to_string()))
        .bind(task.refund_entry_id.map(|id| id.to_string()))
        .bind(&task.failure_reason)
        .bind(assets)
        .bind(task.character_id.map(|id| *id.as_uuid()))
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists {
                    entity: "task",
                    id: task.id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<GenerationTask>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM generation_tasks WHERE id = $1"
        ))
        .bind(task_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(GenerationTask::try_from).transpose()
    }

    async fn find_task_by_provider_id(
        &self,
        provider_task_id: &str,
    ) -> Result<Option<GenerationTask>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM generation_tasks WHERE provider_task_id = $1"
        ))
        .bind(provider_task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(GenerationTask::try_from).transpose()
    }

    async fn list_tasks_by_user(
        &self,
        user_id: &UserId,
        filter: &TaskFilter,
    ) -> Result<Vec<GenerationTask>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM generation_tasks \
             WHERE user_id = $1 \
               AND ($2::uuid IS NULL OR character_id = $2) \
               AND ($3::text IS NULL OR status = $3) \
             ORDER BY created_at DESC LIMIT $4 OFFSET $5"
        );
        let query = sqlx::query_as(&sql)
            .bind(user_id.as_uuid())
            .bind(filter.character_id.map(|id| *id.as_uuid()))
            .bind(filter.status.map(TaskStatus::as_str))
            .bind(to_i64(filter.limit))
            .bind(to_i64(filter.offset));

        self.fetch_tasks(query).await
    }

    async fn list_stale_tasks(
        &self,
        status: TaskStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationTask>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM generation_tasks \
             WHERE status = $1 AND updated_at < $2 ORDER BY updated_at LIMIT $3"
        );
        let query = sqlx::query_as(&sql)
            .bind(status.as_str())
            .bind(updated_before)
            .bind(to_i64(limit));

        self.fetch_tasks(query).await
    }

    async fn mark_processing(
        &self,
        task_id: &TaskId,
        provider_task_id: &str,
    ) -> Result<GenerationTask> {
        let mut tx = self.pool.begin().await?;
        let mut task = Self::lock_task(&mut tx, task_id).await?;
        task.mark_processing(provider_task_id)?;

        sqlx::query(
            "UPDATE generation_tasks SET status = $2, provider_task_id = $3, updated_at = $4 \
             WHERE id = $1",
        )
        .bind(task.id.as_uuid())
        .bind(task.status.as_str())
        .bind(provider_task_id)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(task)
    }

    async fn complete_task(
        &self,
        task_id: &TaskId,
        assets: Vec<GeneratedAsset>,
    ) -> Result<Transition> {
        let mut tx = self.pool.begin().await?;
        let mut task = Self::lock_task(&mut tx, task_id).await?;
        if task.status.is_terminal() {
            tx.rollback().await?;
            return Ok(Transition::AlreadyTerminal(task));
        }

        let images = asset_count(&assets);
        task.succeed(assets)?;
        let assets_json =
            serde_json::to_value(&task.assets).map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            "INSERT INTO weekly_usage (user_id, week_start, images_generated) VALUES ($1, $2, $3) \
             ON CONFLICT (user_id, week_start) \
             DO UPDATE SET images_generated = weekly_usage.images_generated + EXCLUDED.images_generated",
        )
        .bind(task.user_id.as_uuid())
        .bind(week_start(task.updated_at))
        .bind(i32::try_from(images).unwrap_or(i32::MAX))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE generation_tasks SET assets = $2, status = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(task.id.as_uuid())
        .bind(assets_json)
        .bind(task.status.as_str())
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Transition::Applied(task))
    }

    async fn fail_task(
        &self,
        task_id: &TaskId,
        reason: &str,
        refund: Option<LedgerEntry>,
    ) -> Result<Transition> {
        let mut tx = self.pool.begin().await?;
        let mut task = Self::lock_task(&mut tx, task_id).await?;
        if task.status.is_terminal() {
            tx.rollback().await?;
            return Ok(Transition::AlreadyTerminal(task));
        }

        let refund = refund.filter(|_| task.refund_entry_id.is_none());
        if let Some(entry) = &refund {
            expect_task_refund(&task, entry)?;
            Self::apply_credit(&mut tx, entry).await?;
        }
        task.fail(reason, refund.as_ref().map(|e| e.id))?;

        sqlx::query(
            "UPDATE generation_tasks SET status = $2, failure_reason = $3, refund_entry_id = $4, \
             updated_at = $5 WHERE id = $1",
        )
        .bind(task.id.as_uuid())
        .bind(task.status.as_str())
        .bind(&task.failure_reason)
        .bind(task.refund_entry_id.map(|id| id.to_string()))
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Transition::Applied(task))
    }

    // =========================================================================
    // Usage Operations
    // =========================================================================

    async fn weekly_usage(&self, user_id: &UserId, week_start: NaiveDate) -> Result<u32> {
        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT images_generated FROM weekly_usage WHERE user_id = $1 AND week_start = $2",
        )
        .bind(user_id.as_uuid())
        .bind(week_start)
        .fetch_optional(&self.pool)
        .await?;

        row.map_or(Ok(0), |(images,)| to_u32(images))
    }
}
