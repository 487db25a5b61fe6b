//! Generation workflow integration tests.

mod common;

use std::time::Duration;

use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use chrono::Utc;
use serde_json::{json, Value};

use common::{failed_body, header_value, processing_body, succeeded_body, TestHarness};
use muse_core::{week_start, CharacterId, TaskId, TaskStatus};

fn task_id_of(body: &Value) -> String {
    body["task_id"].as_str().expect("task_id").to_string()
}

fn parse_task_id(body: &Value) -> TaskId {
    task_id_of(body).parse().expect("uuid task id")
}

// ============================================================================
// Submission
// ============================================================================

#[tokio::test]
async fn free_single_clean_image_is_free() {
    let harness = TestHarness::new().await;
    harness.mock_submit_ok("prov-free-1", 1).await;

    let response = harness
        .submit(
            &harness.free_auth(),
            json!({ "prompt": "a lighthouse at dusk", "image_count": 1 }),
        )
        .await;

    response.assert_status(StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["status"], "processing");
    assert_eq!(body["tokens_charged"], 0);

    assert_eq!(harness.entry_count().await, 0);

    let task = harness
        .store()
        .get_task(&parse_task_id(&body))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.provider_task_id.as_deref(), Some("prov-free-1"));
    assert_eq!(task.status, TaskStatus::Processing);
}

#[tokio::test]
async fn free_multi_image_is_denied_without_spend() {
    let harness = TestHarness::new().await;
    harness.expect_no_submission().await;

    let response = harness
        .submit(
            &harness.free_auth(),
            json!({ "prompt": "a lighthouse at dusk", "image_count": 4 }),
        )
        .await;

    response.assert_status(StatusCode::FORBIDDEN);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "eligibility_denied");
    assert_eq!(body["error"]["details"]["upgrade_required"], true);
    assert_eq!(
        body["error"]["details"]["reason"],
        "multi_image_requires_upgrade"
    );

    assert_eq!(harness.entry_count().await, 0);
}

#[tokio::test]
async fn free_flagged_prompt_is_denied() {
    let harness = TestHarness::new().await;
    harness.expect_no_submission().await;

    let response = harness
        .submit(
            &harness.free_auth(),
            json!({ "prompt": "Nude figure study, charcoal" }),
        )
        .await;

    response.assert_status(StatusCode::FORBIDDEN);
    let body: Value = response.json();
    assert_eq!(body["error"]["details"]["reason"], "nsfw_requires_upgrade");
    assert_eq!(body["error"]["message"], "NSFW content requires upgrade.");
}

#[tokio::test]
async fn premium_flagged_prompt_is_allowed() {
    let harness = TestHarness::new().await;
    harness.mock_submit_ok("prov-premium-nsfw", 1).await;

    let response = harness
        .submit(
            &harness.premium_auth(),
            json!({ "prompt": "Nude figure study, charcoal" }),
        )
        .await;

    response.assert_status(StatusCode::ACCEPTED);
}

#[tokio::test]
async fn weekly_free_limit_blocks_after_success() {
    let harness = TestHarness::with_config(|config| {
        config.eligibility.free_weekly_image_limit = 1;
    })
    .await;
    harness.mock_submit_ok("prov-weekly-1", 1).await;
    harness
        .mock_status("prov-weekly-1", succeeded_body("prov-weekly-1"))
        .await;

    let auth = harness.free_auth();
    let first: Value = harness
        .submit(&auth, json!({ "prompt": "a paper crane" }))
        .await
        .json();
    harness
        .status(&auth, &task_id_of(&first))
        .await
        .assert_status_ok();

    let usage = harness
        .store()
        .weekly_usage(&harness.test_user_id, week_start(Utc::now()))
        .await
        .unwrap();
    assert_eq!(usage, 1);

    let response = harness
        .submit(&auth, json!({ "prompt": "another paper crane" }))
        .await;
    response.assert_status(StatusCode::FORBIDDEN);
    let body: Value = response.json();
    assert_eq!(body["error"]["details"]["reason"], "weekly_free_limit_reached");
}

#[tokio::test]
async fn premium_submission_failure_refunds_charge() {
    let harness = TestHarness::new().await;
    harness.grant(50).await;
    harness.mock_submit_error(500).await;

    let response = harness
        .submit(
            &harness.premium_auth(),
            json!({ "prompt": "a harbor at night", "image_count": 4 }),
        )
        .await;

    response.assert_status(StatusCode::BAD_GATEWAY);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "provider_submission_failure");
    assert_eq!(body["error"]["details"]["tokens_refunded"], 20);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("20 tokens were refunded"));

    assert_eq!(harness.balance().await, 50);
    // grant, deduction, refund
    assert_eq!(harness.entry_count().await, 3);

    let list: Value = harness
        .server
        .get("/v1/generations")
        .add_header(AUTHORIZATION, header_value(&harness.premium_auth()))
        .await
        .json();
    let task = &list["tasks"][0];
    assert_eq!(task["status"], "failed");
    assert_eq!(task["tokens_refunded"], 20);
}

#[tokio::test]
async fn submission_cut_off_by_request_timeout_still_refunds() {
    let harness = TestHarness::with_config(|config| {
        config.request_timeout_seconds = 1;
        config.provider_timeout_seconds = 5;
    })
    .await;
    harness.grant(50).await;
    harness
        .mock_submit_delayed(
            500,
            json!({ "reason": "GPU pool exhausted" }),
            Duration::from_secs(2),
        )
        .await;

    harness
        .submit(
            &harness.premium_auth(),
            json!({ "prompt": "a harbor at night", "image_count": 4 }),
        )
        .await
        .assert_status(StatusCode::REQUEST_TIMEOUT);

    let task = harness.wait_for_settled_task(Duration::from_secs(5)).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.refund_entry_id.is_some());
    assert_eq!(harness.balance().await, 50);
}

#[tokio::test]
async fn submission_accepted_after_request_timeout_is_recorded() {
    let harness = TestHarness::with_config(|config| {
        config.request_timeout_seconds = 1;
        config.provider_timeout_seconds = 5;
    })
    .await;
    harness.grant(50).await;
    harness
        .mock_submit_delayed(
            200,
            json!({ "task_id": "prov-slow-1" }),
            Duration::from_secs(2),
        )
        .await;

    harness
        .submit(
            &harness.premium_auth(),
            json!({ "prompt": "a harbor at night", "image_count": 4 }),
        )
        .await
        .assert_status(StatusCode::REQUEST_TIMEOUT);

    let task = harness.wait_for_settled_task(Duration::from_secs(5)).await;
    assert_eq!(task.status, TaskStatus::Processing);
    assert_eq!(task.provider_task_id.as_deref(), Some("prov-slow-1"));
    // The provider is running the job, so the charge stands.
    assert_eq!(harness.balance().await, 30);
}

#[tokio::test]
async fn simultaneous_submissions_never_overdraw() {
    let harness = TestHarness::new().await;
    harness.grant(30).await;
    harness.mock_submit_ok("prov-race", 1).await;

    let auth = harness.premium_auth();
    let body = json!({ "prompt": "a harbor at night", "image_count": 4 });
    let (first, second) = tokio::join!(
        harness.submit(&auth, body.clone()),
        harness.submit(&auth, body.clone())
    );

    let mut statuses = [first.status_code(), second.status_code()];
    statuses.sort();
    assert_eq!(statuses, [StatusCode::ACCEPTED, StatusCode::PAYMENT_REQUIRED]);

    assert_eq!(harness.balance().await, 10);
    // grant plus exactly one deduction
    assert_eq!(harness.entry_count().await, 2);
}

#[tokio::test]
async fn insufficient_tokens_skips_provider() {
    let harness = TestHarness::new().await;
    harness.grant(10).await;
    harness.expect_no_submission().await;

    let response = harness
        .submit(
            &harness.premium_auth(),
            json!({ "prompt": "a harbor at night", "image_count": 4 }),
        )
        .await;

    response.assert_status(StatusCode::PAYMENT_REQUIRED);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "insufficient_tokens");
    assert_eq!(body["error"]["details"]["currentBalance"], 10);
    assert_eq!(body["error"]["details"]["requiredTokens"], 20);

    assert_eq!(harness.balance().await, 10);
    assert_eq!(harness.entry_count().await, 1);
}

#[tokio::test]
async fn admin_is_never_charged() {
    let harness = TestHarness::new().await;
    harness.mock_submit_ok("prov-admin-1", 1).await;

    let response = harness
        .submit(
            &harness.admin_auth(),
            json!({ "prompt": "eight variations of a teapot", "image_count": 8 }),
        )
        .await;

    response.assert_status(StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["tokens_charged"], 0);
    assert_eq!(harness.entry_count().await, 0);
}

#[tokio::test]
async fn invalid_request_is_rejected() {
    let harness = TestHarness::new().await;
    harness.expect_no_submission().await;

    let response = harness
        .submit(&harness.premium_auth(), json!({ "prompt": "   " }))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn missing_or_bad_token_is_unauthorized() {
    let harness = TestHarness::new().await;

    harness
        .server
        .post("/v1/generations")
        .json(&json!({ "prompt": "a cat" }))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    harness
        .submit("Bearer not-a-jwt", json!({ "prompt": "a cat" }))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
}

// ============================================================================
// Estimate
// ============================================================================

#[tokio::test]
async fn estimate_matches_charge() {
    let harness = TestHarness::new().await;
    harness.grant(50).await;
    harness.mock_submit_ok("prov-estimate-1", 1).await;

    let request = json!({ "prompt": "a harbor at night", "image_count": 4 });

    let estimate = harness
        .server
        .post("/v1/generations/estimate")
        .add_header(AUTHORIZATION, header_value(&harness.premium_auth()))
        .json(&request)
        .await;
    estimate.assert_status_ok();
    let estimate: Value = estimate.json();
    assert_eq!(estimate["allowed"], true);
    assert_eq!(estimate["current_balance"], 50);
    assert_eq!(estimate["sufficient_balance"], true);

    let submitted: Value = harness.submit(&harness.premium_auth(), request).await.json();
    assert_eq!(submitted["tokens_charged"], estimate["token_cost"]);
    assert_eq!(harness.balance().await, 30);
}

#[tokio::test]
async fn estimate_reports_denial() {
    let harness = TestHarness::new().await;

    let estimate: Value = harness
        .server
        .post("/v1/generations/estimate")
        .add_header(AUTHORIZATION, header_value(&harness.free_auth()))
        .json(&json!({ "prompt": "a harbor", "image_count": 2 }))
        .await
        .json();

    assert_eq!(estimate["allowed"], false);
    assert_eq!(estimate["upgrade_required"], true);
    assert_eq!(estimate["reason"], "multi_image_requires_upgrade");
}

// ============================================================================
// Status resolution
// ============================================================================

#[tokio::test]
async fn polling_success_persists_assets() {
    let harness = TestHarness::new().await;
    harness.mock_submit_ok("prov-ok-1", 1).await;
    harness.mock_status("prov-ok-1", succeeded_body("prov-ok-1")).await;

    let auth = harness.free_auth();
    let submitted: Value = harness
        .submit(&auth, json!({ "prompt": "a fox in snow" }))
        .await
        .json();

    let response = harness.status(&auth, &task_id_of(&submitted)).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["progress"], 100);
    assert_eq!(body["assets"][0]["url"], "https://cdn.test/prov-ok-1.jpeg");

    let task = harness
        .store()
        .get_task(&parse_task_id(&submitted))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.assets.len(), 1);
}

#[tokio::test]
async fn polling_in_progress_reports_progress() {
    let harness = TestHarness::new().await;
    harness.mock_submit_ok("prov-run-1", 1).await;
    harness
        .mock_status("prov-run-1", processing_body("prov-run-1", 45))
        .await;

    let auth = harness.free_auth();
    let submitted: Value = harness
        .submit(&auth, json!({ "prompt": "a fox in snow" }))
        .await
        .json();

    let body: Value = harness
        .server
        .get(&format!("/v1/generations/{}", task_id_of(&submitted)))
        .add_header(AUTHORIZATION, header_value(&auth))
        .await
        .json();
    assert_eq!(body["status"], "processing");
    assert_eq!(body["progress"], 45);
}

#[tokio::test]
async fn provider_failure_refunds_exactly_once() {
    let harness = TestHarness::new().await;
    harness.grant(50).await;
    harness.mock_submit_ok("prov-fail-1", 1).await;
    harness
        .mock_status("prov-fail-1", failed_body("prov-fail-1", "queue timeout"))
        .await;

    let auth = harness.premium_auth();
    let submitted: Value = harness
        .submit(&auth, json!({ "prompt": "a storm", "image_count": 4 }))
        .await
        .json();
    assert_eq!(harness.balance().await, 30);

    let first: Value = harness.status(&auth, &task_id_of(&submitted)).await.json();
    assert_eq!(first["status"], "failed");
    assert_eq!(first["failure_reason"], "queue timeout");
    assert_eq!(first["tokens_refunded"], 20);
    assert!(first["message"].as_str().unwrap().contains("refunded"));

    let second: Value = harness.status(&auth, &task_id_of(&submitted)).await.json();
    assert_eq!(second["status"], "failed");

    assert_eq!(harness.balance().await, 50);

    let task_entries = harness
        .store()
        .entries_for_task(&parse_task_id(&submitted))
        .await
        .unwrap();
    assert_eq!(task_entries.len(), 2);
    assert_eq!(task_entries.iter().map(|e| e.delta).sum::<i64>(), 0);
}

#[tokio::test]
async fn status_check_error_is_transient() {
    let harness = TestHarness::new().await;
    harness.mock_submit_ok("prov-flaky-1", 1).await;
    harness.mock_status_error("prov-flaky-1", 500).await;

    let auth = harness.free_auth();
    let submitted: Value = harness
        .submit(&auth, json!({ "prompt": "a storm" }))
        .await
        .json();

    let response = harness.status(&auth, &task_id_of(&submitted)).await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "transient_resolution_error");
    assert_eq!(body["error"]["details"]["retryable"], true);

    let task = harness
        .store()
        .get_task(&parse_task_id(&submitted))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Processing);
}

#[tokio::test]
async fn other_users_task_is_not_found() {
    let harness = TestHarness::new().await;
    harness.mock_submit_ok("prov-private-1", 1).await;

    let submitted: Value = harness
        .submit(&harness.free_auth(), json!({ "prompt": "a secret garden" }))
        .await
        .json();

    harness
        .status(
            &TestHarness::other_user_auth_header(),
            &task_id_of(&submitted),
        )
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

// ============================================================================
// Listing
// ============================================================================

#[tokio::test]
async fn list_filters_by_character() {
    let harness = TestHarness::new().await;
    harness.mock_submit_ok("prov-list", 2).await;

    let character_id = CharacterId::generate().to_string();
    let auth = harness.premium_auth();
    harness
        .submit(
            &auth,
            json!({ "prompt": "portrait", "character_id": character_id }),
        )
        .await
        .assert_status(StatusCode::ACCEPTED);
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    harness
        .submit(&auth, json!({ "prompt": "landscape" }))
        .await
        .assert_status(StatusCode::ACCEPTED);

    let all: Value = harness
        .server
        .get("/v1/generations")
        .add_header(AUTHORIZATION, header_value(&auth))
        .await
        .json();
    assert_eq!(all["tasks"].as_array().unwrap().len(), 2);
    assert_eq!(all["tasks"][0]["prompt"], "landscape");

    let filtered: Value = harness
        .server
        .get("/v1/generations")
        .add_query_param("character_id", &character_id)
        .add_header(AUTHORIZATION, header_value(&auth))
        .await
        .json();
    let tasks = filtered["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["prompt"], "portrait");
    assert_eq!(filtered["has_more"], false);
}

#[tokio::test]
async fn list_rejects_unknown_status() {
    let harness = TestHarness::new().await;

    harness
        .server
        .get("/v1/generations")
        .add_query_param("status", "exploded")
        .add_header(AUTHORIZATION, header_value(&harness.free_auth()))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}
