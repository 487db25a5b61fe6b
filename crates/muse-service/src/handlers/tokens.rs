//! Token balance and ledger handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use muse_core::{EntryId, LedgerEntry, TaskId, UserId};

use crate::auth::{AdminAuth, AuthUser};
use crate::error::ApiError;
use crate::state::AppState;

use super::{default_limit, MAX_PAGE_SIZE};

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// Account owner.
    pub user_id: UserId,
    /// Spendable tokens.
    pub balance: i64,
    /// Tokens ever deducted.
    pub lifetime_charged: i64,
    /// Tokens ever refunded.
    pub lifetime_refunded: i64,
    /// Tokens ever granted.
    pub lifetime_granted: i64,
}

/// Get current token balance. A user without an account has zero.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account = state.ledger.account(&auth.user_id).await?;

    Ok(Json(BalanceResponse {
        user_id: account.user_id,
        balance: account.balance,
        lifetime_charged: account.lifetime_charged,
        lifetime_refunded: account.lifetime_refunded,
        lifetime_granted: account.lifetime_granted,
    }))
}

/// Entry list query parameters.
#[derive(Debug, Deserialize)]
pub struct ListEntriesQuery {
    /// Maximum number of entries to return (default: 50).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

/// Ledger entry response.
#[derive(Debug, Serialize)]
pub struct EntryResponse {
    /// Entry ID.
    pub id: EntryId,
    /// Signed change (negative = deduction).
    pub delta: i64,
    /// `deduction`, `refund` or `grant`.
    pub kind: String,
    /// Why the balance changed.
    pub reason: String,
    /// Related task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Balance after this entry.
    pub balance_after: i64,
    /// Timestamp.
    pub created_at: String,
}

impl From<&LedgerEntry> for EntryResponse {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            id: entry.id,
            delta: entry.delta,
            kind: entry.kind.as_str().to_string(),
            reason: entry.reason.clone(),
            task_id: entry.task_id,
            balance_after: entry.balance_after,
            created_at: entry.created_at.to_rfc3339(),
        }
    }
}

/// List entries response.
#[derive(Debug, Serialize)]
pub struct ListEntriesResponse {
    /// Entries (newest first).
    pub entries: Vec<EntryResponse>,
    /// Whether there are more entries.
    pub has_more: bool,
}

/// List the caller's ledger entries.
pub async fn list_entries(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<ListEntriesQuery>,
) -> Result<Json<ListEntriesResponse>, ApiError> {
    // Fetch one more than requested to determine has_more
    let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
    let entries = state
        .ledger
        .entries(&auth.user_id, limit + 1, query.offset)
        .await?;

    let has_more = entries.len() > limit;
    let entries = entries.iter().take(limit).map(EntryResponse::from).collect();

    Ok(Json(ListEntriesResponse { entries, has_more }))
}

/// Admin grant request.
#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    /// Recipient.
    pub user_id: UserId,
    /// Tokens to add.
    pub amount: i64,
    /// Ledger reason.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Admin grant response.
#[derive(Debug, Serialize)]
pub struct GrantResponse {
    /// The new ledger entry.
    pub entry_id: EntryId,
    /// Recipient's balance after the grant.
    pub balance: i64,
}

/// Add tokens to a user's balance (admin only).
pub async fn admin_grant(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
    Json(request): Json<GrantRequest>,
) -> Result<Json<GrantResponse>, ApiError> {
    if request.amount <= 0 {
        return Err(ApiError::BadRequest("amount must be positive".into()));
    }

    let reason = request.reason.as_deref().unwrap_or("Admin grant");
    let entry = state
        .ledger
        .grant(
            request.user_id,
            request.amount,
            reason,
            serde_json::json!({ "source": "admin" }),
        )
        .await?;

    Ok(Json(GrantResponse {
        entry_id: entry.id,
        balance: entry.balance_after,
    }))
}
