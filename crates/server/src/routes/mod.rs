//! HTTP route handlers.
//!
//! # Route Structure
//!
//! ```text
//! GET  /health                          - Liveness
//! GET  /health/ready                    - Readiness (database ping)
//!
//! # Messages (identity header required)
//! GET  /api/messages                    - The caller's scheduled messages
//! POST /api/messages/schedule           - Schedule a message
//! POST /api/messages/send               - Post a message now
//! POST /api/messages/{id}/cancel        - Cancel a pending message
//! POST /api/messages/{id}/confirm       - Confirm a scheduled message
//!
//! # Slack (identity header required, except the callback)
//! GET  /api/slack/connect               - Slack authorize URL with signed state
//! GET  /api/slack/callback              - OAuth redirect target
//! POST /api/slack/disconnect            - Forget the caller's credential
//! GET  /api/slack/channels              - Channels visible to the caller
//! GET  /api/slack/channels/{id}         - Channel detail
//! GET  /api/slack/channels/{id}/members - Channel member IDs
//! GET  /api/slack/users                 - Workspace members
//!
//! # Admin (bearer token required)
//! GET  /api/admin/tokens                - Token status across users
//! POST /api/admin/tokens/migrate        - Migrate all legacy tokens
//! POST /api/admin/tokens/sweep          - Run a token sweep now
//! ```

pub mod admin;
pub mod health;
pub mod messages;
pub mod slack;

use axum::{Router, middleware::from_fn};
use tower_http::trace::{DefaultOnResponse, OnResponse, TraceLayer};
use tracing::Span;

use crate::middleware::request_id_middleware;
use crate::state::AppState;

/// All routes, without middleware.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(messages::router())
        .merge(slack::router())
        .merge(admin::router())
}

/// The complete application: routes, request IDs, tracing and Sentry.
pub fn app(state: AppState) -> Router {
    routes()
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri().path(),
                        request_id = tracing::field::Empty,
                        user_id = tracing::field::Empty,
                        status = tracing::field::Empty,
                        latency_ms = tracing::field::Empty,
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &Span| {
                        span.record("status", response.status().as_u16());
                        span.record(
                            "latency_ms",
                            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                        );
                        DefaultOnResponse::default().on_response(response, latency, span);
                    },
                ),
        )
        .with_state(state)
        // Sentry layers (outermost for full request coverage)
        .layer(sentry_tower::NewSentryLayer::new_from_top())
        .layer(sentry_tower::SentryHttpLayer::new().enable_transaction())
}
