//! Stale task sweep.
//!
//! Two kinds of task can be left behind:
//!
//! - `pending` tasks whose provider submission never finished (the process
//!   stopped between recording the task and calling the provider). They are
//!   failed and their charge refunded.
//! - `processing` tasks nobody is polling and whose callback never arrived.
//!   They are polled again; there is no timeout-to-failed transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use muse_core::{GenerationTask, TaskStatus};

use crate::error::ApiError;
use crate::state::AppState;

use super::{apply_status, refund_for};

/// Failure reason recorded for orphaned `pending` tasks.
pub const ORPHAN_REASON: &str = "submission never completed";

/// Tasks examined per status per sweep.
const SWEEP_BATCH: usize = 100;

/// Provider status checks in flight at once.
const REPOLL_CONCURRENCY: usize = 4;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Orphaned `pending` tasks failed (and refunded).
    pub orphans_failed: usize,
    /// `processing` tasks checked with the provider.
    pub repolled: usize,
    /// Re-polled tasks that reached a terminal status.
    pub resolved: usize,
    /// Store or provider errors; the affected tasks are retried next sweep.
    pub errors: usize,
}

impl ReconcileReport {
    /// Whether the sweep found anything to do.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.orphans_failed == 0 && self.repolled == 0 && self.errors == 0
    }
}

fn cutoff(now: DateTime<Utc>, age_seconds: u64) -> DateTime<Utc> {
    chrono::Duration::from_std(Duration::from_secs(age_seconds))
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Run one sweep over stale `pending` and `processing` tasks.
pub async fn reconcile_once(state: &AppState) -> ReconcileReport {
    let now = Utc::now();
    let mut report = ReconcileReport::default();

    let orphan_cutoff = cutoff(now, state.config.pending_orphan_after_seconds);
    match state
        .store
        .list_stale_tasks(TaskStatus::Pending, orphan_cutoff, SWEEP_BATCH)
        .await
    {
        Ok(orphans) => {
            for task in orphans {
                match fail_orphan(state, &task).await {
                    Ok(true) => report.orphans_failed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(task_id = %task.id, error = %e, "Failed to recover orphaned task");
                        report.errors += 1;
                    }
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to list pending tasks");
            report.errors += 1;
        }
    }

    if !state.has_provider() {
        return report;
    }

    let repoll_cutoff = cutoff(now, state.config.processing_repoll_after_seconds);
    let stale = match state
        .store
        .list_stale_tasks(TaskStatus::Processing, repoll_cutoff, SWEEP_BATCH)
        .await
    {
        Ok(tasks) => tasks,
        Err(e) => {
            tracing::error!(error = %e, "Failed to list processing tasks");
            report.errors += 1;
            return report;
        }
    };

    let outcomes: Vec<Result<bool, ApiError>> = stream::iter(stale)
        .map(|task| repoll(state, task))
        .buffer_unordered(REPOLL_CONCURRENCY)
        .collect()
        .await;

    for outcome in outcomes {
        report.repolled += 1;
        match outcome {
            Ok(true) => report.resolved += 1,
            Ok(false) => {}
            Err(_) => report.errors += 1,
        }
    }

    report
}

/// Fail an orphaned task with its refund. Returns whether this call did it.
async fn fail_orphan(state: &AppState, task: &GenerationTask) -> Result<bool, ApiError> {
    let refund = refund_for(task, &format!("Refund for task {}: {ORPHAN_REASON}", task.id))?;
    let transition = state.store.fail_task(&task.id, ORPHAN_REASON, refund).await?;

    if transition.was_applied() {
        tracing::warn!(
            task_id = %task.id,
            user_id = %task.user_id,
            tokens_refunded = transition.task().tokens_charged,
            "Orphaned pending task failed and refunded"
        );
    }

    Ok(transition.was_applied())
}

/// Poll the provider for a stale task. Returns whether it became terminal.
async fn repoll(state: &AppState, task: GenerationTask) -> Result<bool, ApiError> {
    let provider = state.provider()?;
    let Some(provider_task_id) = task.provider_task_id.as_deref() else {
        return Ok(false);
    };

    let report = provider.fetch_status(provider_task_id).await.map_err(|e| {
        tracing::warn!(task_id = %task.id, error = %e, "Re-poll of stale task failed");
        ApiError::TransientResolution(e.to_string())
    })?;

    let updated = apply_status(state, &task, report.status).await?;
    Ok(updated.status.is_terminal())
}

/// Spawn the periodic sweep. Returns `None` when the interval is zero.
#[must_use]
pub fn spawn_reconciler(state: Arc<AppState>) -> Option<JoinHandle<()>> {
    let interval_seconds = state.config.reconcile_interval_seconds;
    if interval_seconds == 0 {
        tracing::info!("Stale task reconciler disabled");
        return None;
    }

    tracing::info!(interval_seconds, "Starting stale task reconciler");

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let report = reconcile_once(&state).await;
            if !report.is_empty() {
                tracing::info!(
                    orphans_failed = report.orphans_failed,
                    repolled = report.repolled,
                    resolved = report.resolved,
                    errors = report.errors,
                    "Reconciler sweep finished"
                );
            }
        }
    }))
}
