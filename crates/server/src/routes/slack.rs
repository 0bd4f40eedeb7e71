//! Slack connection and lookup endpoints.
//!
//! The OAuth callback is the one user-facing route that does not read the
//! identity header: the user is recovered from the signed `state` instead.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::AppError;
use crate::middleware::CurrentUser;
use crate::services::ConnectedWorkspace;
use crate::slack::{Channel, SlackUser, authorization_url};
use crate::state::AppState;

/// Create Slack routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/slack/connect", get(connect))
        .route("/api/slack/callback", get(callback))
        .route("/api/slack/disconnect", post(disconnect))
        .route("/api/slack/channels", get(list_channels))
        .route("/api/slack/channels/{id}", get(channel_info))
        .route("/api/slack/channels/{id}/members", get(channel_members))
        .route("/api/slack/users", get(list_users))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectResponse {
    authorization_url: String,
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    /// Set by Slack when the user declines.
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct DisconnectResponse {
    disconnected: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelView {
    id: String,
    name: String,
    is_private: bool,
    is_member: bool,
    is_archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_members: Option<u32>,
}

impl From<Channel> for ChannelView {
    fn from(c: Channel) -> Self {
        Self {
            id: c.id,
            name: c.name,
            is_private: c.is_private,
            is_member: c.is_member,
            is_archived: c.is_archived,
            num_members: c.num_members,
        }
    }
}

#[derive(Debug, Serialize)]
struct MembersResponse {
    members: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserView {
    id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    real_name: Option<String>,
    is_bot: bool,
}

impl From<SlackUser> for UserView {
    fn from(u: SlackUser) -> Self {
        Self {
            id: u.id,
            name: u.name,
            real_name: u.real_name,
            is_bot: u.is_bot,
        }
    }
}

/// Start the OAuth flow: return the Slack authorize URL for this user.
#[instrument(skip_all, fields(user_id = %user))]
async fn connect(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<ConnectResponse>, AppError> {
    let signed = state.oauth_state().issue(&user, Utc::now())?;
    let url = authorization_url(&state.config().slack, &signed)?;
    Ok(Json(ConnectResponse {
        authorization_url: url,
    }))
}

/// Finish the OAuth flow started by [`connect`].
#[instrument(skip(state, params))]
async fn callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<ConnectedWorkspace>, AppError> {
    if let Some(error) = params.error {
        warn!(error = %error, "Slack authorization declined");
        return Err(AppError::BadRequest(format!(
            "Slack authorization was not granted: {error}"
        )));
    }

    let signed = params
        .state
        .ok_or_else(|| AppError::BadRequest("missing state".to_string()))?;
    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::BadRequest("missing code".to_string()))?;

    let user = state.oauth_state().verify(&signed, Utc::now())?;
    let connected = state.tokens().exchange_oauth_code(&code, &user).await?;

    info!(user_id = %user, workspace = %connected.workspace.name, "OAuth callback complete");
    Ok(Json(connected))
}

#[instrument(skip_all, fields(user_id = %user))]
async fn disconnect(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<DisconnectResponse>, AppError> {
    let disconnected = state.tokens().disconnect(&user).await?;
    Ok(Json(DisconnectResponse { disconnected }))
}

async fn list_channels(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<ChannelView>>, AppError> {
    let channels = state.messaging().list_channels(&user).await?;
    Ok(Json(channels.into_iter().map(ChannelView::from).collect()))
}

async fn channel_info(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<ChannelView>, AppError> {
    let channel = state.messaging().channel_info(&user, &id).await?;
    Ok(Json(channel.into()))
}

async fn channel_members(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<MembersResponse>, AppError> {
    let members = state.messaging().channel_members(&user, &id).await?;
    Ok(Json(MembersResponse { members }))
}

async fn list_users(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<UserView>>, AppError> {
    let users = state.messaging().list_users(&user).await?;
    Ok(Json(
        users
            .into_iter()
            .filter(|u| !u.deleted)
            .map(UserView::from)
            .collect(),
    ))
}
