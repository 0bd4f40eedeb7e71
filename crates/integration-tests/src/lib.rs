//! Integration tests for slackpost.
//!
//! The tests wire the real Slack client against a `wiremock` server and run
//! the full router and services over in-memory stores. No database or Slack
//! workspace is needed.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p slackpost-integration-tests
//! ```
//!
//! # Test Categories
//!
//! - `delivery` - Scheduled delivery with token refresh and channel join
//! - `slack_connection` - OAuth connect, legacy migration, scope errors

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use slackpost_server::routes;
use slackpost_server::slack::SlackClient;
use slackpost_server::state::AppState;
use slackpost_server::test_support::{
    InMemoryCredentialStore, InMemoryScheduledMessageStore, server_config,
};
use tower::ServiceExt;
use wiremock::matchers::{body_string_contains, header as header_matcher, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Identity header set by the upstream identity provider.
pub const IDENTITY_HEADER: &str = "x-authenticated-user";

/// A running app over in-memory stores and a mock Slack API.
pub struct TestContext {
    pub slack: MockServer,
    pub credentials: Arc<InMemoryCredentialStore>,
    pub messages: Arc<InMemoryScheduledMessageStore>,
    pub state: AppState,
}

impl TestContext {
    /// Start a mock Slack server and build state around it.
    ///
    /// # Panics
    ///
    /// Panics if the Slack client or the lazy pool cannot be built.
    pub async fn new() -> Self {
        let slack = MockServer::start().await;
        let config = server_config(&slack.uri());
        let client = SlackClient::new(&config.slack).expect("slack client");
        let pool = sqlx::PgPool::connect_lazy(config.database_url.expose_secret())
            .expect("lazy pool");

        let credentials = Arc::new(InMemoryCredentialStore::new());
        let messages = Arc::new(InMemoryScheduledMessageStore::new());
        let state = AppState::new(
            config,
            pool,
            credentials.clone(),
            messages.clone(),
            Arc::new(client),
        );

        Self {
            slack,
            credentials,
            messages,
            state,
        }
    }

    #[must_use]
    pub fn app(&self) -> Router {
        routes::app(self.state.clone())
    }

    /// Send a request through the full middleware stack.
    ///
    /// # Panics
    ///
    /// Panics if the router or body read fails.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }
}

/// A request carrying `user` in the identity header.
///
/// # Panics
///
/// Panics if the request cannot be built.
#[must_use]
pub fn as_user(method: &str, uri: &str, user: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(IDENTITY_HEADER, user);
    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request")
}

/// Expect exactly `times` refreshes of `refresh_token`, answering with a new
/// rotating pair that expires in 12 hours.
pub async fn mock_refresh(
    server: &MockServer,
    refresh_token: &str,
    new_access: &str,
    new_refresh: &str,
    times: u64,
) {
    Mock::given(method("POST"))
        .and(path("/oauth.v2.access"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains(format!("refresh_token={refresh_token}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "access_token": new_access,
            "refresh_token": new_refresh,
            "expires_in": 43200
        })))
        .expect(times)
        .mount(server)
        .await;
}

/// Expect exactly `times` posts made with `token`, each answered with `ts`.
pub async fn mock_post(server: &MockServer, token: &str, ts: &str, times: u64) {
    Mock::given(method("POST"))
        .and(path("/chat.postMessage"))
        .and(header_matcher("authorization", format!("Bearer {token}").as_str()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "ts": ts })),
        )
        .expect(times)
        .mount(server)
        .await;
}
