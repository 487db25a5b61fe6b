//! Request and response types for the muse client.

use serde::Deserialize;

use muse_core::{CharacterId, DenialReason, EntryId, GeneratedAsset, TaskId, TaskStatus, UserId};

/// Response to a submission.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Task to poll.
    pub task_id: TaskId,
    /// Status at submission, `processing` once the provider accepted it.
    pub status: TaskStatus,
    /// Tokens deducted.
    pub tokens_charged: i64,
}

/// Status of one generation task.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationStatus {
    /// Task ID.
    pub task_id: TaskId,
    /// Current status.
    pub status: TaskStatus,
    /// Percent complete, 0-100.
    pub progress: u8,
    /// Result images (succeeded only).
    #[serde(default)]
    pub assets: Vec<GeneratedAsset>,
    /// Why the task failed.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Tokens charged at submission.
    pub tokens_charged: i64,
    /// Tokens returned after a failure.
    #[serde(default)]
    pub tokens_refunded: i64,
    /// Text to show the user.
    #[serde(default)]
    pub message: Option<String>,
    /// Linked character.
    #[serde(default)]
    pub character_id: Option<CharacterId>,
    /// Prompt the task was submitted with.
    pub prompt: String,
    /// Requested images.
    pub image_count: u32,
    /// Submission time (RFC 3339).
    pub created_at: String,
    /// Last status change (RFC 3339).
    pub updated_at: String,
}

impl GenerationStatus {
    /// Whether the task has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A page of tasks.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationList {
    /// Tasks, newest first.
    pub tasks: Vec<GenerationStatus>,
    /// Whether there are more tasks.
    pub has_more: bool,
}

/// Filter for [`crate::MuseClient::list_generations`].
#[derive(Debug, Clone, Default)]
pub struct ListGenerationsQuery {
    /// Only tasks linked to this character.
    pub character_id: Option<CharacterId>,
    /// Only tasks in this status.
    pub status: Option<TaskStatus>,
    /// Page size.
    pub limit: Option<usize>,
    /// Tasks to skip.
    pub offset: Option<usize>,
}

/// Cost and eligibility preview.
#[derive(Debug, Clone, Deserialize)]
pub struct EstimateResponse {
    /// Whether a submission would be allowed.
    pub allowed: bool,
    /// Why it would not.
    #[serde(default)]
    pub reason: Option<DenialReason>,
    /// Text for the refusal.
    #[serde(default)]
    pub message: Option<String>,
    /// Whether upgrading would lift the refusal.
    pub upgrade_required: bool,
    /// Tokens a submission would be charged.
    pub token_cost: i64,
    /// Caller's balance.
    pub current_balance: i64,
    /// Whether the balance covers the cost.
    pub sufficient_balance: bool,
}

/// Token balance response.
#[derive(Debug, Clone, Deserialize)]
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

/// One ledger entry.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerEntryResponse {
    /// Entry ID.
    pub id: EntryId,
    /// Signed change (negative = deduction).
    pub delta: i64,
    /// `deduction`, `refund` or `grant`.
    pub kind: String,
    /// Why the balance changed.
    pub reason: String,
    /// Related task.
    #[serde(default)]
    pub task_id: Option<TaskId>,
    /// Balance after this entry.
    pub balance_after: i64,
    /// Timestamp (RFC 3339).
    pub created_at: String,
}

/// A page of ledger entries.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerEntries {
    /// Entries, newest first.
    pub entries: Vec<LedgerEntryResponse>,
    /// Whether there are more entries.
    pub has_more: bool,
}

/// API error response structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    /// Error details.
    pub error: ApiErrorBody,
}

/// API error body.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
    /// Additional details.
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}
