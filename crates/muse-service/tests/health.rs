//! Health endpoint integration tests.

mod common;

use common::TestHarness;

#[tokio::test]
async fn health_check_returns_ok() {
    let harness = TestHarness::new().await;

    let response = harness.server.get("/health").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "muse");
    assert_eq!(body["provider_configured"], true);
}

#[tokio::test]
async fn health_reports_missing_provider() {
    let harness = TestHarness::with_config(|config| config.provider_api_key = None).await;

    let body: serde_json::Value = harness.server.get("/health").await.json();
    assert_eq!(body["provider_configured"], false);
}
