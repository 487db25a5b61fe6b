//! Task status resolution.
//!
//! Provider status reports arrive from two places: a caller polling the
//! status endpoint, and the provider's callback. Both end in
//! [`apply_status`].

use muse_core::{Caller, GenerationTask, TaskId, TaskStatus};
use muse_store::Transition;

use crate::error::ApiError;
use crate::provider::ProviderTaskStatus;
use crate::state::AppState;

use super::{persist_result, refund_for};

/// A task as seen by a status check.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The stored task after any transition.
    pub task: GenerationTask,
    /// Provider-reported progress, 0-100.
    pub progress: u8,
}

/// Load a task owned by `caller` (any task for admins).
///
/// # Errors
///
/// Returns `ApiError::NotFound` for unknown tasks and for tasks owned by
/// someone else.
pub async fn load_owned_task(
    state: &AppState,
    caller: &Caller,
    task_id: &TaskId,
) -> Result<GenerationTask, ApiError> {
    state
        .store
        .get_task(task_id)
        .await?
        .filter(|task| caller.is_admin || task.user_id == caller.user_id)
        .ok_or_else(|| ApiError::NotFound(format!("task not found: {task_id}")))
}

/// Report a task's status, polling the provider while it is in flight.
///
/// Terminal and `pending` tasks are answered from the store. A `processing`
/// task is checked with the provider and any terminal outcome is applied
/// before the response is built, so a caller never sees `succeeded` before
/// the assets are stored nor `failed` before the refund.
///
/// # Errors
///
/// - `ApiError::NotFound` if the task is unknown or not the caller's.
/// - `ApiError::TransientResolution` if the provider status check fails; the
///   task is left untouched.
pub async fn check_status(
    state: &AppState,
    caller: &Caller,
    task_id: &TaskId,
) -> Result<Resolution, ApiError> {
    let task = load_owned_task(state, caller, task_id).await?;

    let provider_task_id = match (task.status, task.provider_task_id.clone()) {
        (TaskStatus::Processing, Some(id)) => id,
        (status, _) => {
            let progress = if status.is_terminal() { 100 } else { 0 };
            return Ok(Resolution { task, progress });
        }
    };

    let provider = state
        .provider()
        .map_err(|e| ApiError::TransientResolution(e.to_string()))?;

    let report = provider
        .fetch_status(&provider_task_id)
        .await
        .map_err(|e| {
            tracing::warn!(
                task_id = %task.id,
                provider_task_id = %provider_task_id,
                error = %e,
                "Provider status check failed"
            );
            ApiError::TransientResolution(format!("status check failed: {e}"))
        })?;

    let progress = report.status.progress();
    let task = apply_status(state, &task, report.status).await?;
    let progress = if task.status.is_terminal() { 100 } else { progress };

    Ok(Resolution { task, progress })
}

/// Apply a provider status to `task`.
///
/// - queued or processing: nothing changes;
/// - succeeded: the result is persisted and the task marked `succeeded`;
/// - failed: the owed refund (if any) is issued and the task marked `failed`,
///   in one store write.
///
/// Signals for a task that is already terminal change nothing.
///
/// # Errors
///
/// Returns an error if the store write fails or the task is still `pending`.
pub async fn apply_status(
    state: &AppState,
    task: &GenerationTask,
    status: ProviderTaskStatus,
) -> Result<GenerationTask, ApiError> {
    match status {
        ProviderTaskStatus::Queued | ProviderTaskStatus::Processing { .. } => Ok(task.clone()),
        ProviderTaskStatus::Succeeded { assets } => persist_result(state, &task.id, assets).await,
        ProviderTaskStatus::Failed { reason } => {
            let refund_reason = format!("Refund for failed task {}: {reason}", task.id);
            let refund = refund_for(task, &refund_reason)?;
            let transition = state.store.fail_task(&task.id, &reason, refund).await?;

            match &transition {
                Transition::Applied(failed) => tracing::info!(
                    task_id = %failed.id,
                    user_id = %failed.user_id,
                    reason = %reason,
                    tokens_refunded = if failed.refund_entry_id.is_some() {
                        failed.tokens_charged
                    } else {
                        0
                    },
                    "Generation failed"
                ),
                Transition::AlreadyTerminal(existing) => tracing::info!(
                    task_id = %existing.id,
                    status = %existing.status,
                    "Ignoring duplicate resolution signal for terminal task"
                ),
            }

            Ok(transition.into_task())
        }
    }
}
