//! Scheduled and immediate message endpoints.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slackpost_core::{MessageStatus, ScheduledMessageId};
use tracing::instrument;

use crate::db::ScheduledMessage;
use crate::error::AppError;
use crate::middleware::CurrentUser;
use crate::state::AppState;

/// Create message routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/messages", get(list_messages))
        .route("/api/messages/schedule", post(schedule_message))
        .route("/api/messages/send", post(send_message))
        .route("/api/messages/{id}/cancel", post(cancel_message))
        .route("/api/messages/{id}/confirm", post(confirm_message))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest {
    channel_id: String,
    message: String,
    /// RFC 3339 timestamp.
    scheduled_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    channel_id: String,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScheduledResponse {
    id: ScheduledMessageId,
    status: MessageStatus,
    scheduled_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    id: ScheduledMessageId,
    status: MessageStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SentResponse {
    platform_message_id: String,
    channel_id: String,
}

/// A scheduled message as shown to its owner.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageView {
    id: ScheduledMessageId,
    channel_id: String,
    message: String,
    scheduled_time: DateTime<Utc>,
    status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    slack_ts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cancelled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<ScheduledMessage> for MessageView {
    fn from(m: ScheduledMessage) -> Self {
        Self {
            id: m.id,
            channel_id: m.channel_id,
            message: m.message,
            scheduled_time: m.scheduled_time,
            status: m.status,
            slack_ts: m.slack_ts,
            error: m.error,
            sent_at: m.sent_at,
            cancelled_at: m.cancelled_at,
            created_at: m.created_at,
        }
    }
}

#[instrument(skip_all, fields(user_id = %user))]
async fn schedule_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<ScheduleRequest>,
) -> Result<(StatusCode, Json<ScheduledResponse>), AppError> {
    let created = state
        .messaging()
        .schedule_message(&user, &body.channel_id, &body.message, &body.scheduled_time)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ScheduledResponse {
            id: created.id,
            status: created.status,
            scheduled_time: created.scheduled_time,
        }),
    ))
}

async fn list_messages(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<MessageView>>, AppError> {
    let messages = state.messaging().list_messages(&user).await?;
    Ok(Json(messages.into_iter().map(MessageView::from).collect()))
}

#[instrument(skip_all, fields(user_id = %user))]
async fn cancel_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<ScheduledMessageId>,
) -> Result<Json<StatusResponse>, AppError> {
    let cancelled = state.messaging().cancel_message(&user, id).await?;
    Ok(Json(StatusResponse {
        id: cancelled.id,
        status: cancelled.status,
    }))
}

#[instrument(skip_all, fields(user_id = %user))]
async fn confirm_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<ScheduledMessageId>,
) -> Result<Json<StatusResponse>, AppError> {
    let confirmed = state.messaging().confirm_message(&user, id).await?;
    Ok(Json(StatusResponse {
        id: confirmed.id,
        status: confirmed.status,
    }))
}

#[instrument(skip_all, fields(user_id = %user))]
async fn send_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<SendRequest>,
) -> Result<Json<SentResponse>, AppError> {
    let posted = state
        .messaging()
        .send_immediate(&user, &body.channel_id, &body.message)
        .await?;

    Ok(Json(SentResponse {
        platform_message_id: posted.ts,
        channel_id: posted.channel_id,
    }))
}
