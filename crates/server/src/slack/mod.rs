//! Slack integration: OAuth token lifecycle, message posting, and lookups.
//!
//! This module provides:
//! - [`SlackApi`], the gateway the services depend on
//! - [`SlackClient`], its Web API implementation
//! - [`OAuthState`] for signing the OAuth `state` parameter
//!
//! # Flow
//!
//! 1. `/api/slack/connect` redirects the user to Slack with a signed `state`
//! 2. Slack redirects back to `/api/slack/callback` with a one-time `code`
//! 3. The code is exchanged for a rotating token pair and stored sealed
//! 4. Scheduled and immediate messages are posted with that user's token

mod client;
mod error;
mod state;
mod types;

use async_trait::async_trait;
use secrecy::SecretString;

pub use client::{SlackClient, authorization_url};
pub use error::SlackError;
pub use state::{OAuthState, StateError};
pub use types::{Channel, OAuthGrant, PostedMessage, RotatedToken, SlackUser};

/// Outbound calls to the Slack Web API.
///
/// Every call is bounded by the client's request timeout.
#[async_trait]
pub trait SlackApi: Send + Sync {
    /// Exchange a one-time OAuth code for a grant.
    ///
    /// Fails with [`SlackError::InvalidCode`] unless the response carries an
    /// access token, `team.id`, `team.name` and `authed_user.id`.
    async fn exchange_code(&self, code: &str) -> Result<OAuthGrant, SlackError>;

    /// Trade a refresh token for a new token pair.
    async fn refresh_token(&self, refresh_token: &SecretString) -> Result<RotatedToken, SlackError>;

    /// Trade a long-lived legacy token for a rotating token pair.
    async fn exchange_legacy_token(&self, token: &SecretString) -> Result<RotatedToken, SlackError>;

    /// Post `text` to `channel`.
    ///
    /// On `not_in_channel` the bot joins the channel and retries exactly once.
    async fn post_message(
        &self,
        token: &SecretString,
        channel: &str,
        text: &str,
    ) -> Result<PostedMessage, SlackError>;

    /// Public and private channels visible to the token.
    async fn list_channels(&self, token: &SecretString) -> Result<Vec<Channel>, SlackError>;

    async fn channel_info(&self, token: &SecretString, channel: &str) -> Result<Channel, SlackError>;

    /// Member user IDs of a channel.
    async fn channel_members(
        &self,
        token: &SecretString,
        channel: &str,
    ) -> Result<Vec<String>, SlackError>;

    async fn list_users(&self, token: &SecretString) -> Result<Vec<SlackUser>, SlackError>;
}
