//! Slack Web API request and response types.
//!
//! Wire types mirror the subset of fields this service reads; everything
//! Slack returns beyond that is ignored. Public result types
//! ([`OAuthGrant`], [`RotatedToken`], [`Channel`], ...) are what the rest of
//! the crate works with.
//!
//! See: <https://api.slack.com/methods>

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

// =============================================================================
// Wire types
// =============================================================================

/// Fields common to every Slack Web API response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiStatus {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Set with `missing_scope`.
    #[serde(default)]
    pub needed: Option<String>,
    /// Set with `missing_scope`.
    #[serde(default)]
    pub provided: Option<String>,
}

/// Cursor pagination metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ResponseMetadata {
    #[serde(default)]
    pub next_cursor: Option<String>,
}

impl ResponseMetadata {
    /// Next cursor, treating Slack's empty string as "no more pages".
    pub fn cursor(&self) -> Option<&str> {
        self.next_cursor.as_deref().filter(|c| !c.is_empty())
    }
}

/// `oauth.v2.access` / `oauth.v2.exchange` response.
#[derive(Debug, Deserialize)]
pub(crate) struct OAuthAccessResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until `access_token` expires.
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub bot_user_id: Option<String>,
    #[serde(default)]
    pub team: Option<TeamRef>,
    #[serde(default)]
    pub authed_user: Option<AuthedUserRef>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TeamRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AuthedUserRef {
    #[serde(default)]
    pub id: Option<String>,
}

/// `chat.postMessage` request body.
#[derive(Debug, Serialize)]
pub(crate) struct PostMessageRequest<'a> {
    pub channel: &'a str,
    pub text: &'a str,
}

/// `chat.postMessage` response.
#[derive(Debug, Deserialize)]
pub(crate) struct PostMessageResponse {
    pub ts: String,
    #[serde(default)]
    pub channel: Option<String>,
}

/// `conversations.list` response.
#[derive(Debug, Deserialize)]
pub(crate) struct ConversationsListResponse {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub response_metadata: ResponseMetadata,
}

/// `conversations.info` response.
#[derive(Debug, Deserialize)]
pub(crate) struct ConversationsInfoResponse {
    pub channel: Channel,
}

/// `conversations.members` response.
#[derive(Debug, Deserialize)]
pub(crate) struct ConversationsMembersResponse {
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub response_metadata: ResponseMetadata,
}

/// `users.list` response.
#[derive(Debug, Deserialize)]
pub(crate) struct UsersListResponse {
    #[serde(default)]
    pub members: Vec<SlackUser>,
    #[serde(default)]
    pub response_metadata: ResponseMetadata,
}

// =============================================================================
// Public result types
// =============================================================================

/// Credential material and workspace identity from a successful code exchange.
///
/// Implements `Debug` manually to redact tokens.
#[derive(Clone)]
pub struct OAuthGrant {
    pub access_token: SecretString,
    /// `None` when the app has token rotation disabled.
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
    pub workspace_id: String,
    pub workspace_name: String,
    pub authed_user_id: String,
    pub bot_user_id: Option<String>,
    pub scope: Option<String>,
}

impl std::fmt::Debug for OAuthGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthGrant")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("workspace_id", &self.workspace_id)
            .field("workspace_name", &self.workspace_name)
            .field("authed_user_id", &self.authed_user_id)
            .field("bot_user_id", &self.bot_user_id)
            .field("scope", &self.scope)
            .finish()
    }
}

/// New token pair from a refresh or a legacy-token exchange.
#[derive(Clone)]
pub struct RotatedToken {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for RotatedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatedToken")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostedMessage {
    /// Slack message timestamp, unique per channel.
    pub ts: String,
    pub channel_id: String,
}

/// A Slack conversation (public or private channel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_member: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_members: Option<u32>,
}

/// A workspace member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlackUser {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_name: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub is_bot: bool,
}
