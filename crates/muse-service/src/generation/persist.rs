//! Result persistence for succeeded tasks.

use muse_core::{GeneratedAsset, GenerationTask, TaskId};
use muse_store::Transition;

use crate::error::ApiError;
use crate::state::AppState;

/// Store `assets` for a task, count them against the owner's weekly usage,
/// then mark the task `succeeded`.
///
/// A task that is already terminal is returned unchanged; the duplicate
/// signal is logged and ignored.
///
/// # Errors
///
/// Returns an error if the task is unknown, still `pending`, or the write
/// fails.
pub async fn persist_result(
    state: &AppState,
    task_id: &TaskId,
    assets: Vec<GeneratedAsset>,
) -> Result<GenerationTask, ApiError> {
    let asset_count = assets.len();
    let transition = state.store.complete_task(task_id, assets).await?;

    match &transition {
        Transition::Applied(task) => tracing::info!(
            task_id = %task.id,
            user_id = %task.user_id,
            assets = asset_count,
            "Generation succeeded, result persisted"
        ),
        Transition::AlreadyTerminal(task) => tracing::info!(
            task_id = %task.id,
            status = %task.status,
            "Ignoring duplicate resolution signal for terminal task"
        ),
    }

    Ok(transition.into_task())
}
