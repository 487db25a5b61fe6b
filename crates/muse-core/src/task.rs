//! Generation tasks and their status state machine.
//!
//! ```text
//! pending ──► processing ──► succeeded
//!    │             │
//!    └─────────────┴───────► failed
//! ```
//!
//! `succeeded` and `failed` are terminal. A refund for a failed task is
//! recorded on the task itself (`refund_entry_id`), so a second failure
//! signal can never produce a second refund.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CharacterId, EntryId, GenerationRequest, MuseError, Result, TaskId, UserId};

/// Status of a generation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Recorded locally, not yet accepted by the provider.
    Pending,
    /// Accepted by the provider, result outstanding.
    Processing,
    /// Finished with assets.
    Succeeded,
    /// Finished without assets.
    Failed,
}

impl TaskStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether the state machine allows `self -> next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing | Self::Failed)
                | (Self::Processing, Self::Succeeded | Self::Failed)
        )
    }

    /// Stable lowercase name, used as a database value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Parse the value produced by [`TaskStatus::as_str`].
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A generated image reference returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedAsset {
    /// Where the image can be fetched.
    pub url: String,
    /// Image format reported by the provider (`png`, `jpeg`, ...).
    #[serde(default)]
    pub image_type: Option<String>,
    /// Seconds the URL stays valid, when the provider says.
    #[serde(default)]
    pub url_ttl_seconds: Option<i64>,
}

/// One request to the image provider, from submission to terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTask {
    /// Local task id.
    pub id: TaskId,
    /// Owning user.
    pub user_id: UserId,
    /// Positive prompt.
    pub prompt: String,
    /// Negative prompt.
    pub negative_prompt: String,
    /// Provider model identifier.
    pub model: String,
    /// Requested number of images.
    pub image_count: u32,
    /// Output width.
    pub width: u32,
    /// Output height.
    pub height: u32,
    /// Current status.
    pub status: TaskStatus,
    /// Provider task id, set once the provider accepts the submission.
    pub provider_task_id: Option<String>,
    /// Tokens charged at submission (0 for free and admin requests).
    pub tokens_charged: i64,
    /// Ledger entry of the charge.
    pub charge_entry_id: Option<EntryId>,
    /// Ledger entry of the refund, once issued.
    pub refund_entry_id: Option<EntryId>,
    /// Provider or submission failure message.
    pub failure_reason: Option<String>,
    /// Result images, filled on success.
    pub assets: Vec<GeneratedAsset>,
    /// Linked character.
    pub character_id: Option<CharacterId>,
    /// When the task was recorded.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl GenerationTask {
    /// A new `pending` task for `request`.
    #[must_use]
    pub fn new(id: TaskId, user_id: UserId, request: &GenerationRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            model: request.model.clone(),
            image_count: request.image_count,
            width: request.width,
            height: request.height,
            status: TaskStatus::Pending,
            provider_task_id: None,
            tokens_charged: 0,
            charge_entry_id: None,
            refund_entry_id: None,
            failure_reason: None,
            assets: Vec::new(),
            character_id: request.character_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record the charge taken for this task.
    #[must_use]
    pub fn with_charge(mut self, tokens: i64, entry_id: EntryId) -> Self {
        self.tokens_charged = tokens;
        self.charge_entry_id = Some(entry_id);
        self
    }

    /// Whether a refund is still owed if the task fails.
    #[must_use]
    pub const fn refund_owed(&self) -> bool {
        self.tokens_charged > 0 && self.refund_entry_id.is_none()
    }

    fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(MuseError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `pending -> processing` once the provider assigned its id.
    ///
    /// # Errors
    ///
    /// Returns `MuseError::InvalidTransition` unless the task is pending.
    pub fn mark_processing(&mut self, provider_task_id: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Processing)?;
        self.provider_task_id = Some(provider_task_id.into());
        Ok(())
    }

    /// `processing -> succeeded` with the result assets.
    ///
    /// # Errors
    ///
    /// Returns `MuseError::InvalidTransition` unless the task is processing.
    pub fn succeed(&mut self, assets: Vec<GeneratedAsset>) -> Result<()> {
        self.transition(TaskStatus::Succeeded)?;
        self.assets = assets;
        Ok(())
    }

    /// `pending | processing -> failed`, optionally recording the refund.
    ///
    /// # Errors
    ///
    /// Returns `MuseError::InvalidTransition` if the task is already terminal.
    pub fn fail(&mut self, reason: impl Into<String>, refund: Option<EntryId>) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        if refund.is_some() {
            self.refund_entry_id = refund;
        }
        Ok(())
    }
}
