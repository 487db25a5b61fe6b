//! Common test utilities for muse integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderName, HeaderValue};
use axum::Router;
use axum_test::TestServer;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use muse_core::{GenerationTask, TaskId, TaskStatus, UserId};
use muse_service::auth::{AppMetadata, JwtClaims};
use muse_service::crypto::callback_token;
use muse_service::{create_router, AppState, ServiceConfig, StoreBackend};
use muse_store::{Store, TaskFilter};

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const ADMIN_KEY: &str = "test-admin-key";
pub const PROVIDER_KEY: &str = "test-provider-key";
pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

/// Header carrying the admin key.
pub const ADMIN_KEY_HEADER: HeaderName = HeaderName::from_static("x-admin-key");

/// Header value from a test string.
pub fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).expect("valid header value")
}

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// Mock image provider.
    pub provider: MockServer,
    /// The state behind `server`, for direct store access.
    pub state: AppState,
    /// Temporary directory for the database (kept alive for test duration).
    pub _temp_dir: TempDir,
    /// A test user ID for authenticated requests.
    pub test_user_id: UserId,
}

impl TestHarness {
    /// Create a new test harness with a fresh database.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a harness, adjusting the config before the state is built.
    pub async fn with_config(adjust: impl FnOnce(&mut ServiceConfig)) -> Self {
        let provider = MockServer::start().await;
        let temp_dir = TempDir::new().expect("Failed to create temp directory");

        let mut config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            data_dir: temp_dir.path().to_string_lossy().to_string(),
            auth_jwt_secret: Some(JWT_SECRET.into()),
            auth_audience: None,
            admin_api_key: Some(ADMIN_KEY.into()),
            provider_base_url: provider.uri(),
            provider_api_key: Some(PROVIDER_KEY.into()),
            provider_timeout_seconds: 5,
            public_base_url: Some("http://muse.test".into()),
            webhook_secret: Some(WEBHOOK_SECRET.into()),
            reconcile_interval_seconds: 0,
            ..ServiceConfig::default()
        };
        adjust(&mut config);

        let store = open_store(&temp_dir, config.store_backend);
        let state = AppState::new(store, config);
        let router: Router = create_router(state.clone());

        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            provider,
            state,
            _temp_dir: temp_dir,
            test_user_id: UserId::generate(),
        }
    }

    /// Direct store access.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.state.store
    }

    // ========================================================================
    // Identities
    // ========================================================================

    /// Bearer header for a signed token with the given flags.
    pub fn auth_header_for(user_id: UserId, is_admin: bool, is_premium: bool) -> String {
        let claims = JwtClaims {
            sub: user_id.to_string(),
            exp: chrono::Utc::now().timestamp() + 3600,
            aud: None,
            app_metadata: AppMetadata {
                is_admin,
                is_premium,
            },
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("Failed to sign test token");
        format!("Bearer {token}")
    }

    /// Free-tier auth header for the test user.
    pub fn free_auth(&self) -> String {
        Self::auth_header_for(self.test_user_id, false, false)
    }

    /// Premium auth header for the test user.
    pub fn premium_auth(&self) -> String {
        Self::auth_header_for(self.test_user_id, false, true)
    }

    /// Admin auth header for the test user.
    pub fn admin_auth(&self) -> String {
        Self::auth_header_for(self.test_user_id, true, false)
    }

    /// A different user's auth header (for testing isolation).
    pub fn other_user_auth_header() -> String {
        Self::auth_header_for(UserId::generate(), false, true)
    }

    // ========================================================================
    // Tokens
    // ========================================================================

    /// Grant tokens to the test user through the admin endpoint.
    pub async fn grant(&self, amount: i64) {
        self.server
            .post("/v1/tokens/grant")
            .add_header(ADMIN_KEY_HEADER, header_value(ADMIN_KEY))
            .json(&json!({
                "user_id": self.test_user_id.to_string(),
                "amount": amount,
                "reason": "Test funding"
            }))
            .await
            .assert_status_ok();
    }

    /// The test user's balance.
    pub async fn balance(&self) -> i64 {
        self.state
            .ledger
            .balance(&self.test_user_id)
            .await
            .expect("balance")
    }

    /// Number of ledger entries for the test user.
    pub async fn entry_count(&self) -> usize {
        self.store()
            .list_entries(&self.test_user_id, 100, 0)
            .await
            .expect("entries")
            .len()
    }

    // ========================================================================
    // Provider mocks
    // ========================================================================

    /// Accept submissions with `provider_task_id`, expecting `calls` of them.
    pub async fn mock_submit_ok(&self, provider_task_id: &str, calls: u64) {
        Mock::given(method("POST"))
            .and(path("/v3/async/txt2img"))
            .and(header("authorization", format!("Bearer {PROVIDER_KEY}").as_str()))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "task_id": provider_task_id })),
            )
            .expect(calls)
            .mount(&self.provider)
            .await;
    }

    /// Reject submissions with `status`.
    pub async fn mock_submit_error(&self, status: u16) {
        Mock::given(method("POST"))
            .and(path("/v3/async/txt2img"))
            .respond_with(
                ResponseTemplate::new(status).set_body_json(json!({ "reason": "GPU pool exhausted" })),
            )
            .mount(&self.provider)
            .await;
    }

    /// Answer submissions with `status` and `body` after `delay`.
    pub async fn mock_submit_delayed(
        &self,
        status: u16,
        body: serde_json::Value,
        delay: std::time::Duration,
    ) {
        Mock::given(method("POST"))
            .and(path("/v3/async/txt2img"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body).set_delay(delay))
            .expect(1)
            .mount(&self.provider)
            .await;
    }

    /// No submission may reach the provider.
    pub async fn expect_no_submission(&self) {
        Mock::given(method("POST"))
            .and(path("/v3/async/txt2img"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "task_id": "never" })))
            .expect(0)
            .mount(&self.provider)
            .await;
    }

    /// Answer status checks for `provider_task_id` with `body`.
    pub async fn mock_status(&self, provider_task_id: &str, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/v3/async/task-result"))
            .and(query_param("task_id", provider_task_id))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.provider)
            .await;
    }

    /// Fail status checks for `provider_task_id` with `status`.
    pub async fn mock_status_error(&self, provider_task_id: &str, status: u16) {
        Mock::given(method("GET"))
            .and(path("/v3/async/task-result"))
            .and(query_param("task_id", provider_task_id))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.provider)
            .await;
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Submit a generation and return the response body.
    pub async fn submit(&self, auth: &str, body: serde_json::Value) -> axum_test::TestResponse {
        self.server
            .post("/v1/generations")
            .add_header(AUTHORIZATION, header_value(auth))
            .json(&body)
            .await
    }

    /// Check a task through the `?taskId=` endpoint.
    pub async fn status(&self, auth: &str, task_id: &str) -> axum_test::TestResponse {
        self.server
            .get("/v1/generations/status")
            .add_query_param("taskId", task_id)
            .add_header(AUTHORIZATION, header_value(auth))
            .await
    }

    /// The test user's newest task once it has left `pending`, polling the
    /// store for up to `timeout`.
    pub async fn wait_for_settled_task(&self, timeout: std::time::Duration) -> GenerationTask {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let tasks = self
                .store()
                .list_tasks_by_user(&self.test_user_id, &TaskFilter::default())
                .await
                .expect("tasks");
            if let Some(task) = tasks.into_iter().next() {
                if task.status != TaskStatus::Pending {
                    return task;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task did not leave pending in time"
            );
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    /// Callback path with a valid token for `task_id`.
    pub fn callback_path(task_id: &TaskId) -> String {
        let token = callback_token(WEBHOOK_SECRET, task_id).expect("token");
        format!("/webhooks/provider?task={task_id}&token={token}")
    }
}

fn open_store(temp_dir: &TempDir, backend: StoreBackend) -> Arc<dyn Store> {
    match backend {
        #[cfg(feature = "rocksdb-backend")]
        StoreBackend::RocksDb => Arc::new(
            muse_store::RocksStore::open(temp_dir.path()).expect("Failed to open store"),
        ),
        _ => {
            let _ = temp_dir;
            Arc::new(muse_store::MemoryStore::new())
        }
    }
}

/// Provider status body for a finished task with one image.
pub fn succeeded_body(provider_task_id: &str) -> serde_json::Value {
    json!({
        "task": { "task_id": provider_task_id, "status": "TASK_STATUS_SUCCEED", "progress_percent": 100 },
        "images": [
            { "image_url": format!("https://cdn.test/{provider_task_id}.jpeg"), "image_type": "jpeg", "image_url_ttl": 3600 }
        ]
    })
}

/// Provider status body for a failed task.
pub fn failed_body(provider_task_id: &str, reason: &str) -> serde_json::Value {
    json!({
        "task": { "task_id": provider_task_id, "status": "TASK_STATUS_FAILED", "reason": reason }
    })
}

/// Provider status body for a running task.
pub fn processing_body(provider_task_id: &str, progress: u8) -> serde_json::Value {
    json!({
        "task": { "task_id": provider_task_id, "status": "TASK_STATUS_PROCESSING", "progress_percent": progress }
    })
}
