//! Generation task submission.

use std::sync::Arc;

use chrono::Utc;

use muse_core::{
    check_eligibility, week_start, Caller, GenerationRequest, GenerationTask, TaskId, UserId,
};

use crate::error::ApiError;
use crate::provider::{ImageProvider, ProviderRequest};
use crate::state::AppState;

use super::refund_for;

/// A task accepted by the provider.
#[derive(Debug, Clone)]
pub struct SubmittedTask {
    /// The stored task, now `processing`.
    pub task: GenerationTask,
    /// Tokens charged for it.
    pub tokens_charged: i64,
}

/// Run a generation request from eligibility check to provider submission.
///
/// Order of effects:
///
/// 1. validate and check eligibility; a denial touches neither the ledger
///    nor the provider;
/// 2. deduct the cost (skipped when it is zero);
/// 3. record the task as `pending`;
/// 4. submit to the provider;
/// 5. on success move the task to `processing`, on failure mark it `failed`
///    and refund the charge in the same store write.
///
/// Steps 2-5 run on a spawned task and finish even if the request is
/// cancelled while waiting on the provider.
///
/// # Errors
///
/// - `ApiError::BadRequest` for an invalid request.
/// - `ApiError::EligibilityDenied` when the gate refuses.
/// - `ApiError::InsufficientTokens` when the balance does not cover the cost.
/// - `ApiError::ProviderSubmissionFailure` when the provider call fails;
///   the charge has been refunded.
pub async fn submit_generation(
    state: &Arc<AppState>,
    caller: &Caller,
    request: GenerationRequest,
) -> Result<SubmittedTask, ApiError> {
    request.validate()?;

    let user_id = caller.user_id;
    let images_this_week = if caller.tier().is_restricted() {
        state
            .store
            .weekly_usage(&user_id, week_start(Utc::now()))
            .await?
    } else {
        0
    };

    let decision = check_eligibility(
        caller,
        &request,
        images_this_week,
        &state.config.eligibility,
        &state.config.pricing,
    );

    if !decision.allowed {
        let reason = decision.reason.ok_or(ApiError::Forbidden)?;
        tracing::info!(
            user_id = %user_id,
            reason = ?reason,
            images_this_week,
            "Generation refused by eligibility gate"
        );
        return Err(ApiError::EligibilityDenied {
            reason,
            upgrade_required: decision.upgrade_required,
        });
    }

    let provider = Arc::clone(state.provider()?);
    let dispatch = tokio::spawn(charge_and_dispatch(
        Arc::clone(state),
        provider,
        user_id,
        decision.token_cost,
        request,
    ));

    dispatch.await.map_err(|e| {
        tracing::error!(user_id = %user_id, error = %e, "Submission task aborted");
        ApiError::Internal(format!("submission task aborted: {e}"))
    })?
}

/// Charge, record and submit. Runs detached from the request so a caller
/// that goes away cannot leave a charge without its outcome.
async fn charge_and_dispatch(
    state: Arc<AppState>,
    provider: Arc<dyn ImageProvider>,
    user_id: UserId,
    cost: i64,
    request: GenerationRequest,
) -> Result<SubmittedTask, ApiError> {
    let task_id = TaskId::generate();
    let mut task = GenerationTask::new(task_id, user_id, &request);

    if cost > 0 {
        let reason = format!(
            "Image generation: {} x {}",
            request.image_count, request.model
        );
        let charge = state
            .ledger
            .deduct(user_id, cost, &reason, Some(task_id))
            .await?;
        task = task.with_charge(cost, charge.id);
    }

    if let Err(e) = state.store.insert_task(&task).await {
        tracing::error!(task_id = %task_id, user_id = %user_id, error = %e, "Failed to record task");
        if cost > 0 {
            if let Err(refund_error) = state
                .ledger
                .refund(user_id, cost, "submission failure: task not recorded", Some(task_id))
                .await
            {
                tracing::error!(
                    task_id = %task_id,
                    user_id = %user_id,
                    error = %refund_error,
                    "Failed to refund charge for unrecorded task"
                );
            }
        }
        return Err(e.into());
    }

    tracing::debug!(
        task_id = %task_id,
        user_id = %user_id,
        tokens_charged = cost,
        provider = provider.name(),
        "Task recorded, submitting to provider"
    );

    let provider_request = ProviderRequest {
        webhook_url: state.webhook_url(&task_id),
        generation: request,
    };

    match provider.submit(&provider_request).await {
        Ok(provider_task_id) => {
            let task = record_acceptance(&state, &task, &provider_task_id).await?;

            tracing::info!(
                task_id = %task_id,
                user_id = %user_id,
                provider_task_id = %provider_task_id,
                tokens_charged = cost,
                "Generation submitted"
            );

            Ok(SubmittedTask {
                task,
                tokens_charged: cost,
            })
        }
        Err(e) => {
            tracing::warn!(task_id = %task_id, user_id = %user_id, error = %e, "Provider submission failed");

            let reason = format!("submission failure: {e}");
            let refund = refund_for(&task, &reason)?;
            let transition = state.store.fail_task(&task_id, &reason, refund).await?;
            let failed = transition.task();

            let tokens_refunded = if failed.refund_entry_id.is_some() {
                failed.tokens_charged
            } else {
                0
            };

            if tokens_refunded > 0 {
                tracing::info!(
                    task_id = %task_id,
                    user_id = %user_id,
                    tokens_refunded,
                    "Charge refunded after submission failure"
                );
            }

            Err(ApiError::ProviderSubmissionFailure {
                message: e.to_string(),
                tokens_refunded,
            })
        }
    }
}

/// Move an accepted task to `processing`, retrying the store write once.
///
/// The provider is already running the job at this point; if both writes
/// fail the task stays `pending` and the provider id is only in the log.
async fn record_acceptance(
    state: &AppState,
    task: &GenerationTask,
    provider_task_id: &str,
) -> Result<GenerationTask, ApiError> {
    match state.store.mark_processing(&task.id, provider_task_id).await {
        Ok(processing) => return Ok(processing),
        Err(e) => tracing::warn!(
            task_id = %task.id,
            provider_task_id,
            error = %e,
            "Failed to record provider acceptance, retrying"
        ),
    }

    state
        .store
        .mark_processing(&task.id, provider_task_id)
        .await
        .map_err(|e| {
            tracing::error!(
                task_id = %task.id,
                user_id = %task.user_id,
                provider_task_id,
                tokens_charged = task.tokens_charged,
                error = %e,
                "Provider accepted task but it could not be marked processing"
            );
            e.into()
        })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate};
    use muse_core::{GeneratedAsset, LedgerEntry, TaskStatus, TokenAccount};
    use muse_store::{MemoryStore, Result, Store, StoreError, TaskFilter, Transition};

    use super::*;
    use crate::config::ServiceConfig;
    use crate::provider::{ProviderError, ProviderTaskReport};

    /// Memory store whose first `failures` calls to `mark_processing` fail.
    struct FlakyStore {
        inner: MemoryStore,
        failures: usize,
        attempts: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures,
                attempts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn put_account(&self, account: &TokenAccount) -> Result<()> {
            self.inner.put_account(account).await
        }

        async fn get_account(&self, user_id: &UserId) -> Result<Option<TokenAccount>> {
            self.inner.get_account(user_id).await
        }

        async fn ensure_account(&self, user_id: &UserId) -> Result<TokenAccount> {
            self.inner.ensure_account(user_id).await
        }

        async fn deduct(&self, entry: &LedgerEntry) -> Result<LedgerEntry> {
            self.inner.deduct(entry).await
        }

        async fn credit(&self, entry: &LedgerEntry) -> Result<LedgerEntry> {
            self.inner.credit(entry).await
        }

        async fn list_entries(
            &self,
            user_id: &UserId,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<LedgerEntry>> {
            self.inner.list_entries(user_id, limit, offset).await
        }

        async fn entries_for_task(&self, task_id: &TaskId) -> Result<Vec<LedgerEntry>> {
            self.inner.entries_for_task(task_id).await
        }

        async fn insert_task(&self, task: &GenerationTask) -> Result<()> {
            self.inner.insert_task(task).await
        }

        async fn get_task(&self, task_id: &TaskId) -> Result<Option<GenerationTask>> {
            self.inner.get_task(task_id).await
        }

        async fn find_task_by_provider_id(
            &self,
            provider_task_id: &str,
        ) -> Result<Option<GenerationTask>> {
            self.inner.find_task_by_provider_id(provider_task_id).await
        }

        async fn list_tasks_by_user(
            &self,
            user_id: &UserId,
            filter: &TaskFilter,
        ) -> Result<Vec<GenerationTask>> {
            self.inner.list_tasks_by_user(user_id, filter).await
        }

        async fn list_stale_tasks(
            &self,
            status: TaskStatus,
            updated_before: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<GenerationTask>> {
            self.inner
                .list_stale_tasks(status, updated_before, limit)
                .await
        }

        async fn mark_processing(
            &self,
            task_id: &TaskId,
            provider_task_id: &str,
        ) -> Result<GenerationTask> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(StoreError::Database("connection reset".into()));
            }
            self.inner.mark_processing(task_id, provider_task_id).await
        }

        async fn complete_task(
            &self,
            task_id: &TaskId,
            assets: Vec<GeneratedAsset>,
        ) -> Result<Transition> {
            self.inner.complete_task(task_id, assets).await
        }

        async fn fail_task(
            &self,
            task_id: &TaskId,
            reason: &str,
            refund: Option<LedgerEntry>,
        ) -> Result<Transition> {
            self.inner.fail_task(task_id, reason, refund).await
        }

        async fn weekly_usage(&self, user_id: &UserId, week_start: NaiveDate) -> Result<u32> {
            self.inner.weekly_usage(user_id, week_start).await
        }
    }

    struct AcceptingProvider;

    #[async_trait]
    impl ImageProvider for AcceptingProvider {
        fn name(&self) -> &str {
            "accepting"
        }

        async fn submit(
            &self,
            _request: &ProviderRequest,
        ) -> std::result::Result<String, ProviderError> {
            Ok("prov-1".into())
        }

        async fn fetch_status(
            &self,
            _provider_task_id: &str,
        ) -> std::result::Result<ProviderTaskReport, ProviderError> {
            Err(ProviderError::Malformed("not used".into()))
        }

        fn parse_callback(
            &self,
            _body: &[u8],
        ) -> std::result::Result<Option<ProviderTaskReport>, ProviderError> {
            Ok(None)
        }
    }

    async fn funded_state(store: Arc<FlakyStore>, user_id: UserId) -> Arc<AppState> {
        let state = AppState::with_provider(
            store,
            ServiceConfig::default(),
            Some(Arc::new(AcceptingProvider)),
        );
        state
            .ledger
            .grant(user_id, 50, "test grant", serde_json::Value::Null)
            .await
            .unwrap();
        Arc::new(state)
    }

    #[tokio::test]
    async fn acceptance_survives_one_failed_write() {
        let user_id = UserId::generate();
        let store = Arc::new(FlakyStore::new(1));
        let state = funded_state(Arc::clone(&store), user_id).await;

        let request = GenerationRequest::new("harbor at dusk").with_image_count(4);
        let submitted = submit_generation(&state, &Caller::premium(user_id), request)
            .await
            .unwrap();

        assert_eq!(submitted.task.status, TaskStatus::Processing);
        assert_eq!(submitted.task.provider_task_id.as_deref(), Some("prov-1"));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(state.ledger.balance(&user_id).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn unrecorded_acceptance_leaves_task_pending() {
        let user_id = UserId::generate();
        let store = Arc::new(FlakyStore::new(usize::MAX));
        let state = funded_state(Arc::clone(&store), user_id).await;

        let request = GenerationRequest::new("harbor at dusk").with_image_count(4);
        let result = submit_generation(&state, &Caller::premium(user_id), request).await;
        assert!(result.is_err());
        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);

        // The charge stands for the reconciler; nothing was refunded.
        let tasks = store
            .list_tasks_by_user(&user_id, &TaskFilter::default())
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(state.ledger.balance(&user_id).await.unwrap(), 30);
    }
}
