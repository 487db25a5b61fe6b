//! Provider callback handler.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use muse_core::{TaskId, TaskStatus};

use crate::crypto::verify_callback_token;
use crate::error::ApiError;
use crate::generation::apply_status;
use crate::state::AppState;

/// Query parameters placed on the callback URL at submission.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    /// Local task id.
    pub task: TaskId,
    /// HMAC of the task id.
    pub token: String,
}

/// Callback acknowledgement.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Always true.
    pub received: bool,
    /// Task status after the callback was applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

/// Handle a provider callback.
///
/// Redeliveries are safe: a callback for a task that is already terminal is
/// acknowledged and changes nothing.
pub async fn provider_webhook(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let secret = state.config.webhook_secret.as_deref().ok_or_else(|| {
        tracing::warn!("Provider callback received but WEBHOOK_SECRET is not set");
        ApiError::Forbidden
    })?;

    if !verify_callback_token(secret, &query.task, &query.token) {
        tracing::warn!(task_id = %query.task, "Provider callback with invalid token");
        return Err(ApiError::Unauthorized);
    }

    let provider = state.provider()?;
    let report = match provider.parse_callback(&body) {
        Ok(Some(report)) => report,
        Ok(None) => {
            return Ok(Json(WebhookResponse {
                received: true,
                status: None,
            }))
        }
        Err(e) => {
            tracing::warn!(task_id = %query.task, error = %e, "Malformed provider callback");
            return Err(ApiError::BadRequest(e.to_string()));
        }
    };

    let task = state
        .store
        .get_task(&query.task)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task not found: {}", query.task)))?;

    if task.provider_task_id.as_deref() != Some(report.provider_task_id.as_str()) {
        if task.status == TaskStatus::Pending {
            // Callback raced ahead of the submission response; the provider retries.
            return Err(ApiError::Conflict(
                "task has not been accepted by the provider yet".into(),
            ));
        }
        tracing::warn!(
            task_id = %task.id,
            provider_task_id = %report.provider_task_id,
            "Provider callback does not match task"
        );
        return Err(ApiError::BadRequest(
            "callback does not match the task".into(),
        ));
    }

    tracing::debug!(
        task_id = %task.id,
        provider_task_id = %report.provider_task_id,
        status = ?report.status,
        "Provider callback received"
    );

    let task = apply_status(&state, &task, report.status).await?;

    Ok(Json(WebhookResponse {
        received: true,
        status: Some(task.status),
    }))
}
