//! Integration tests for scheduled delivery against a mock Slack API.

use chrono::{Duration, Utc};
use secrecy::ExposeSecret;
use serde_json::json;
use slackpost_core::MessageStatus;
use slackpost_integration_tests::{TestContext, mock_post, mock_refresh};
use slackpost_server::db::ScheduledMessageStore;
use slackpost_server::test_support::{rotating_credential, user};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, ResponseTemplate};

fn in_the_past() -> String {
    (Utc::now() - Duration::minutes(1)).to_rfc3339()
}

// =============================================================================
// Token refresh during delivery
// =============================================================================

#[tokio::test]
async fn test_due_message_refreshes_expiring_token_before_posting() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    ctx.credentials
        .insert(rotating_credential(&alice, Utc::now() + Duration::minutes(1)))
        .await;
    mock_refresh(&ctx.slack, "xoxe-1-initial", "xoxe.xoxp-rotated", "xoxe-1-rotated", 1).await;
    mock_post(&ctx.slack, "xoxe.xoxp-rotated", "1700000000.000200", 1).await;

    let scheduled = ctx
        .state
        .messaging()
        .schedule_message(&alice, "C0001", "standup in 5", &in_the_past())
        .await
        .expect("scheduled");

    let report = ctx.state.scheduler().run_due(Utc::now()).await.expect("run");
    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 0);

    let delivered = ctx
        .messages
        .get(scheduled.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(delivered.status, MessageStatus::Sent);
    assert_eq!(delivered.slack_ts.as_deref(), Some("1700000000.000200"));

    let stored = ctx.credentials.get(&alice).await.expect("credential kept");
    assert_eq!(stored.access_token.expose_secret(), "xoxe.xoxp-rotated");
    assert_eq!(
        stored.refresh_token.as_ref().map(|t| t.expose_secret()),
        Some("xoxe-1-rotated")
    );
    assert!(stored.expires_at.expect("expiry") > Utc::now() + Duration::hours(11));
    assert!(stored.last_refreshed.is_some());
}

#[tokio::test]
async fn test_concurrent_deliveries_share_one_refresh() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    ctx.credentials
        .insert(rotating_credential(&alice, Utc::now() + Duration::seconds(30)))
        .await;

    Mock::given(method("POST"))
        .and(path("/oauth.v2.access"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "ok": true,
                    "access_token": "xoxe.xoxp-rotated",
                    "refresh_token": "xoxe-1-rotated",
                    "expires_in": 43200
                }))
                .set_delay(std::time::Duration::from_millis(150)),
        )
        .expect(1)
        .mount(&ctx.slack)
        .await;
    mock_post(&ctx.slack, "xoxe.xoxp-rotated", "1700000000.000300", 5).await;

    for n in 0..5 {
        ctx.state
            .messaging()
            .schedule_message(&alice, "C0001", &format!("update {n}"), &in_the_past())
            .await
            .expect("scheduled");
    }

    let report = ctx.state.scheduler().run_due(Utc::now()).await.expect("run");

    assert_eq!(report.due, 5);
    assert_eq!(report.sent, 5);
}

#[tokio::test]
async fn test_rejected_refresh_fails_message_without_posting() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    ctx.credentials
        .insert(rotating_credential(&alice, Utc::now() - Duration::minutes(10)))
        .await;

    Mock::given(method("POST"))
        .and(path("/oauth.v2.access"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "ok": false, "error": "invalid_refresh_token" })),
        )
        .expect(1)
        .mount(&ctx.slack)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat.postMessage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "ts": "1" })))
        .expect(0)
        .mount(&ctx.slack)
        .await;

    let scheduled = ctx
        .state
        .messaging()
        .schedule_message(&alice, "C0001", "will not go out", &in_the_past())
        .await
        .expect("scheduled");

    let report = ctx.state.scheduler().run_due(Utc::now()).await.expect("run");
    assert_eq!(report.failed, 1);

    let failed = ctx
        .messages
        .get(scheduled.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(failed.status, MessageStatus::Failed);
    assert!(
        failed
            .error
            .as_deref()
            .is_some_and(|e| e.contains("invalid_refresh_token")),
        "error should name the rejection: {:?}",
        failed.error
    );

    // The rejected credential is left in place for the user to reconnect.
    let stored = ctx.credentials.get(&alice).await.expect("credential kept");
    assert_eq!(stored.access_token.expose_secret(), "xoxe.xoxp-initial");
}

// =============================================================================
// Channel membership and cancellation
// =============================================================================

#[tokio::test]
async fn test_not_in_channel_joins_then_delivers() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    ctx.credentials
        .insert(rotating_credential(&alice, Utc::now() + Duration::hours(6)))
        .await;

    Mock::given(method("POST"))
        .and(path("/chat.postMessage"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "ok": false, "error": "not_in_channel" })),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&ctx.slack)
        .await;
    Mock::given(method("POST"))
        .and(path("/conversations.join"))
        .and(body_string_contains("channel=C0042"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "ok": true, "channel": { "id": "C0042" } })),
        )
        .expect(1)
        .mount(&ctx.slack)
        .await;
    mock_post(&ctx.slack, "xoxe.xoxp-initial", "1700000000.000400", 1).await;

    let scheduled = ctx
        .state
        .messaging()
        .schedule_message(&alice, "C0042", "hello new channel", &in_the_past())
        .await
        .expect("scheduled");

    let report = ctx.state.scheduler().run_due(Utc::now()).await.expect("run");
    assert_eq!(report.sent, 1);

    let delivered = ctx
        .messages
        .get(scheduled.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(delivered.status, MessageStatus::Sent);
}

#[tokio::test]
async fn test_cancelled_message_is_never_posted() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    ctx.credentials
        .insert(rotating_credential(&alice, Utc::now() + Duration::hours(6)))
        .await;
    mock_post(&ctx.slack, "xoxe.xoxp-initial", "1", 0).await;

    let messaging = ctx.state.messaging();
    let scheduled = messaging
        .schedule_message(&alice, "C0001", "never mind", &in_the_past())
        .await
        .expect("scheduled");
    messaging
        .cancel_message(&alice, scheduled.id)
        .await
        .expect("cancelled");

    let report = ctx.state.scheduler().run_due(Utc::now()).await.expect("run");

    assert_eq!(report.due, 0);
    let cancelled = ctx
        .messages
        .get(scheduled.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(cancelled.status, MessageStatus::Cancelled);
}

#[tokio::test]
async fn test_future_message_waits_for_its_time() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    ctx.credentials
        .insert(rotating_credential(&alice, Utc::now() + Duration::hours(6)))
        .await;
    mock_post(&ctx.slack, "xoxe.xoxp-initial", "1700000000.000500", 1).await;

    let at = Utc::now() + Duration::minutes(30);
    ctx.state
        .messaging()
        .schedule_message(&alice, "C0001", "later", &at.to_rfc3339())
        .await
        .expect("scheduled");

    let early = ctx.state.scheduler().run_due(Utc::now()).await.expect("run");
    assert_eq!(early.due, 0);

    let on_time = ctx
        .state
        .scheduler()
        .run_due(at + Duration::seconds(1))
        .await
        .expect("run");
    assert_eq!(on_time.sent, 1);
}
