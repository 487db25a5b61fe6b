//! Generation submission, status and listing handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use muse_core::{
    check_eligibility, week_start, CharacterId, DenialReason, GeneratedAsset, GenerationRequest,
    GenerationTask, TaskId, TaskStatus,
};
use muse_store::TaskFilter;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::generation::{check_status, submit_generation};
use crate::state::AppState;

use super::{default_limit, MAX_PAGE_SIZE};

// =============================================================================
// Responses
// =============================================================================

/// Submission response.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    /// Local task id to poll.
    pub task_id: TaskId,
    /// Task status, `processing` once accepted.
    pub status: TaskStatus,
    /// Tokens deducted for this request.
    pub tokens_charged: i64,
}

/// Status of one generation task.
#[derive(Debug, Serialize)]
pub struct GenerationStatusResponse {
    /// Task ID.
    pub task_id: TaskId,
    /// Current status.
    pub status: TaskStatus,
    /// Percent complete, 0-100.
    pub progress: u8,
    /// Result images (succeeded only).
    pub assets: Vec<GeneratedAsset>,
    /// Why the task failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Tokens charged at submission.
    pub tokens_charged: i64,
    /// Tokens returned after a failure.
    pub tokens_refunded: i64,
    /// Text to show the user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Linked character.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_id: Option<CharacterId>,
    /// Prompt the task was submitted with.
    pub prompt: String,
    /// Requested images.
    pub image_count: u32,
    /// Submission time.
    pub created_at: String,
    /// Last status change.
    pub updated_at: String,
}

impl GenerationStatusResponse {
    fn new(task: GenerationTask, progress: u8) -> Self {
        let tokens_refunded = if task.refund_entry_id.is_some() {
            task.tokens_charged
        } else {
            0
        };

        let message = match task.status {
            TaskStatus::Failed => {
                let reason = task.failure_reason.as_deref().unwrap_or("unknown error");
                Some(if tokens_refunded > 0 {
                    format!(
                        "Image generation failed: {reason}. {tokens_refunded} tokens were refunded."
                    )
                } else {
                    format!("Image generation failed: {reason}. No tokens were charged.")
                })
            }
            _ => None,
        };

        Self {
            task_id: task.id,
            status: task.status,
            progress,
            assets: task.assets,
            failure_reason: task.failure_reason,
            tokens_charged: task.tokens_charged,
            tokens_refunded,
            message,
            character_id: task.character_id,
            prompt: task.prompt,
            image_count: task.image_count,
            created_at: task.created_at.to_rfc3339(),
            updated_at: task.updated_at.to_rfc3339(),
        }
    }

    fn stored(task: GenerationTask) -> Self {
        let progress = if task.status.is_terminal() { 100 } else { 0 };
        Self::new(task, progress)
    }
}

// =============================================================================
// Submit / status
// =============================================================================

/// Submit a generation request.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(request): Json<GenerationRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let submitted = submit_generation(&state, &auth.caller, request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            task_id: submitted.task.id,
            status: submitted.task.status,
            tokens_charged: submitted.tokens_charged,
        }),
    ))
}

/// Status query parameters.
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    /// Task to check.
    #[serde(rename = "taskId", alias = "task_id")]
    pub task_id: TaskId,
}

/// Check a task's status (`?taskId=` form).
pub async fn check_generation_status(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<StatusQuery>,
) -> Result<Json<GenerationStatusResponse>, ApiError> {
    let resolution = check_status(&state, &auth.caller, &query.task_id).await?;
    Ok(Json(GenerationStatusResponse::new(
        resolution.task,
        resolution.progress,
    )))
}

/// Check a task's status (path form).
pub async fn get_generation(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(task_id): Path<TaskId>,
) -> Result<Json<GenerationStatusResponse>, ApiError> {
    let resolution = check_status(&state, &auth.caller, &task_id).await?;
    Ok(Json(GenerationStatusResponse::new(
        resolution.task,
        resolution.progress,
    )))
}

// =============================================================================
// Listing
// =============================================================================

/// Task list query parameters.
#[derive(Debug, Deserialize)]
pub struct ListGenerationsQuery {
    /// Only tasks linked to this character.
    #[serde(default)]
    pub character_id: Option<CharacterId>,
    /// Only tasks in this status.
    #[serde(default)]
    pub status: Option<String>,
    /// Maximum number of tasks to return (default: 50).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

/// Task list response.
#[derive(Debug, Serialize)]
pub struct ListGenerationsResponse {
    /// Tasks, newest first.
    pub tasks: Vec<GenerationStatusResponse>,
    /// Whether there are more tasks.
    pub has_more: bool,
}

/// List the caller's tasks from the store. Does not contact the provider.
pub async fn list_generations(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<ListGenerationsQuery>,
) -> Result<Json<ListGenerationsResponse>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            TaskStatus::parse(s).ok_or_else(|| ApiError::BadRequest(format!("unknown status: {s}")))
        })
        .transpose()?;

    // Fetch one more than requested to determine has_more
    let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
    let filter = TaskFilter {
        character_id: query.character_id,
        status,
        limit: limit + 1,
        offset: query.offset,
    };

    let mut tasks = state.store.list_tasks_by_user(&auth.user_id, &filter).await?;
    let has_more = tasks.len() > limit;
    tasks.truncate(limit);

    Ok(Json(ListGenerationsResponse {
        tasks: tasks
            .into_iter()
            .map(GenerationStatusResponse::stored)
            .collect(),
        has_more,
    }))
}

// =============================================================================
// Estimate
// =============================================================================

/// Display-time cost and eligibility preview.
#[derive(Debug, Serialize)]
pub struct EstimateResponse {
    /// Whether a submission would pass the eligibility gate.
    pub allowed: bool,
    /// Why it would not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    /// Text for the refusal.
    #[serde(skip_serializing_if = "Option::is_none")]
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

/// Preview the cost of a request. Uses the same gate and pricing as submit.
pub async fn estimate(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<EstimateResponse>, ApiError> {
    request.validate()?;

    let caller = auth.caller;
    let images_this_week = if caller.tier().is_restricted() {
        state
            .store
            .weekly_usage(&caller.user_id, week_start(Utc::now()))
            .await?
    } else {
        0
    };

    let decision = check_eligibility(
        &caller,
        &request,
        images_this_week,
        &state.config.eligibility,
        &state.config.pricing,
    );
    let current_balance = state.ledger.balance(&caller.user_id).await?;

    Ok(Json(EstimateResponse {
        allowed: decision.allowed,
        reason: decision.reason,
        message: decision.reason.map(|r| r.message().to_string()),
        upgrade_required: decision.upgrade_required,
        token_cost: decision.token_cost,
        current_balance,
        sufficient_balance: current_balance >= decision.token_cost,
    }))
}
