//! Slack Web API client.
//!
//! Covers the OAuth v2 token lifecycle (code exchange, refresh, legacy token
//! exchange), message posting with automatic channel join, and read-only
//! channel and user listings.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

use super::SlackApi;
use super::error::SlackError;
use super::types::{
    ApiStatus, Channel, ConversationsInfoResponse, ConversationsListResponse,
    ConversationsMembersResponse, OAuthAccessResponse, OAuthGrant, PostMessageRequest,
    PostMessageResponse, PostedMessage, RotatedToken, SlackUser, UsersListResponse,
};
use crate::config::SlackAppConfig;

/// Slack OAuth authorize page.
const SLACK_AUTHORIZE_URL: &str = "https://slack.com/oauth/v2/authorize";

/// Page size requested from paginated list methods.
const PAGE_LIMIT: &str = "200";

/// Upper bound on pages fetched for one listing.
const MAX_PAGES: usize = 50;

/// Slack API client bound to one Slack app.
///
/// User tokens are passed per call; the client itself only holds the app's
/// OAuth credentials.
#[derive(Clone)]
pub struct SlackClient {
    /// HTTP client (carries the request timeout).
    client: Client,
    /// Web API base URL, without trailing slash.
    api_base: String,
    client_id: String,
    client_secret: SecretString,
    redirect_uri: String,
}

impl std::fmt::Debug for SlackClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackClient")
            .field("api_base", &self.api_base)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

impl SlackClient {
    /// Create a new Slack client.
    ///
    /// # Errors
    ///
    /// Returns `SlackError::Config` if the HTTP client cannot be built.
    pub fn new(config: &SlackAppConfig) -> Result<Self, SlackError> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| SlackError::Config(e.to_string()))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{method}", self.api_base)
    }

    /// Send a request and decode the Slack envelope.
    ///
    /// `ok: false` becomes `InsufficientScope` for `missing_scope` and
    /// `PlatformRejected` otherwise.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        request: RequestBuilder,
    ) -> Result<T, SlackError> {
        let response = request.send().await.map_err(|e| {
            warn!(method, error = %e, "Slack request failed");
            SlackError::Transport(e.to_string())
        })?;

        let http_status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| SlackError::Transport(e.to_string()))?;

        let status: ApiStatus = serde_json::from_slice(&body).map_err(|e| {
            error!(method, %http_status, "Slack returned a non-JSON response");
            SlackError::Transport(format!("{method} returned {http_status}: {e}"))
        })?;

        if !status.ok {
            let code = status.error.unwrap_or_else(|| "unknown_error".to_string());
            debug!(method, code = %code, "Slack API returned an error");
            if code == "missing_scope" {
                return Err(SlackError::InsufficientScope {
                    needed: status.needed.unwrap_or_default(),
                    provided: status.provided.unwrap_or_default(),
                });
            }
            return Err(SlackError::PlatformRejected { code });
        }

        serde_json::from_slice(&body).map_err(|e| SlackError::Response(format!("{method}: {e}")))
    }

    async fn post_once(
        &self,
        token: &SecretString,
        channel: &str,
        text: &str,
    ) -> Result<PostMessageResponse, SlackError> {
        let request = self
            .client
            .post(self.endpoint("chat.postMessage"))
            .bearer_auth(token.expose_secret())
            .json(&PostMessageRequest { channel, text });
        self.call("chat.postMessage", request).await
    }

    async fn join_channel(&self, token: &SecretString, channel: &str) -> Result<(), SlackError> {
        let request = self
            .client
            .post(self.endpoint("conversations.join"))
            .bearer_auth(token.expose_secret())
            .form(&[("channel", channel)]);
        self.call::<serde_json::Value>("conversations.join", request)
            .await
            .map(|_| ())
    }

    /// Follow `response_metadata.next_cursor` until exhausted.
    async fn paginate<R, T>(
        &self,
        method: &str,
        token: &SecretString,
        params: &[(&str, &str)],
        split: impl Fn(R) -> (Vec<T>, Option<String>) + Send,
    ) -> Result<Vec<T>, SlackError>
    where
        R: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut query: Vec<(&str, &str)> = params.to_vec();
            query.push(("limit", PAGE_LIMIT));
            if let Some(c) = cursor.as_deref() {
                query.push(("cursor", c));
            }

            let request = self
                .client
                .get(self.endpoint(method))
                .bearer_auth(token.expose_secret())
                .query(&query);
            let page: R = self.call(method, request).await?;

            let (mut batch, next) = split(page);
            items.append(&mut batch);

            match next {
                Some(next) => cursor = Some(next),
                None => return Ok(items),
            }
        }

        warn!(method, pages = MAX_PAGES, "Pagination stopped at page limit");
        Ok(items)
    }
}

/// Build the Slack "Add to Slack" URL for the given signed state.
///
/// # Errors
///
/// Returns `SlackError::Config` if the authorize URL cannot be built.
pub fn authorization_url(config: &SlackAppConfig, state: &str) -> Result<String, SlackError> {
    let mut url =
        url::Url::parse(SLACK_AUTHORIZE_URL).map_err(|e| SlackError::Config(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("client_id", &config.client_id)
        .append_pair("scope", &config.bot_scopes.join(","))
        .append_pair("redirect_uri", &config.redirect_uri)
        .append_pair("state", state);
    Ok(url.into())
}

/// Absolute expiry for a relative `expires_in`, rejecting values that do not
/// fit a timestamp.
fn expires_at(expires_in: Option<i64>) -> Result<Option<DateTime<Utc>>, SlackError> {
    expires_in
        .map(|secs| {
            Duration::try_seconds(secs)
                .and_then(|ttl| Utc::now().checked_add_signed(ttl))
                .ok_or_else(|| SlackError::Response(format!("expires_in out of range: {secs}")))
        })
        .transpose()
}

fn rotated_token(
    response: OAuthAccessResponse,
    missing_token: impl FnOnce() -> SlackError,
) -> Result<RotatedToken, SlackError> {
    let access_token = response
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(missing_token)?;
    Ok(RotatedToken {
        access_token: SecretString::from(access_token),
        refresh_token: response
            .refresh_token
            .filter(|t| !t.is_empty())
            .map(SecretString::from),
        expires_at: expires_at(response.expires_in)?,
    })
}

#[async_trait]
impl SlackApi for SlackClient {
    #[instrument(skip(self, code))]
    async fn exchange_code(&self, code: &str) -> Result<OAuthGrant, SlackError> {
        let request = self.client.post(self.endpoint("oauth.v2.access")).form(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
        ]);

        let response: OAuthAccessResponse = self
            .call("oauth.v2.access", request)
            .await
            .map_err(|e| match e {
                SlackError::PlatformRejected { code } => SlackError::InvalidCode(code),
                SlackError::InsufficientScope { needed, .. } => {
                    SlackError::InvalidCode(format!("missing_scope: {needed}"))
                }
                other => other,
            })?;

        let access_token = response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SlackError::InvalidCode("response missing access_token".to_string()))?;
        let team = response
            .team
            .ok_or_else(|| SlackError::InvalidCode("response missing team".to_string()))?;
        let workspace_id = team
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SlackError::InvalidCode("response missing team.id".to_string()))?;
        let workspace_name = team
            .name
            .ok_or_else(|| SlackError::InvalidCode("response missing team.name".to_string()))?;
        let authed_user_id = response
            .authed_user
            .and_then(|u| u.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                SlackError::InvalidCode("response missing authed_user.id".to_string())
            })?;

        info!(workspace_id = %workspace_id, "Slack OAuth code exchanged");

        Ok(OAuthGrant {
            access_token: SecretString::from(access_token),
            refresh_token: response
                .refresh_token
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            expires_at: expires_at(response.expires_in)?,
            workspace_id,
            workspace_name,
            authed_user_id,
            bot_user_id: response.bot_user_id,
            scope: response.scope,
        })
    }

    #[instrument(skip_all)]
    async fn refresh_token(&self, refresh_token: &SecretString) -> Result<RotatedToken, SlackError> {
        let request = self.client.post(self.endpoint("oauth.v2.access")).form(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret()),
        ]);

        let response: OAuthAccessResponse = self
            .call("oauth.v2.access", request)
            .await
            .map_err(|e| match e {
                SlackError::PlatformRejected { code } => SlackError::RefreshRejected(code),
                other => other,
            })?;

        rotated_token(response, || {
            SlackError::RefreshRejected("response missing access_token".to_string())
        })
    }

    #[instrument(skip_all)]
    async fn exchange_legacy_token(&self, token: &SecretString) -> Result<RotatedToken, SlackError> {
        let request = self.client.post(self.endpoint("oauth.v2.exchange")).form(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("token", token.expose_secret()),
        ]);

        let response: OAuthAccessResponse = self.call("oauth.v2.exchange", request).await?;

        rotated_token(response, || {
            SlackError::Response("oauth.v2.exchange missing access_token".to_string())
        })
    }

    #[instrument(skip(self, token, text), fields(channel = %channel))]
    async fn post_message(
        &self,
        token: &SecretString,
        channel: &str,
        text: &str,
    ) -> Result<PostedMessage, SlackError> {
        let response = match self.post_once(token, channel, text).await {
            Err(SlackError::PlatformRejected { code }) if code == "not_in_channel" => {
                info!("Bot not in channel, joining before retry");
                self.join_channel(token, channel).await.map_err(|e| {
                    let reason = e.code().map_or_else(|| e.to_string(), String::from);
                    SlackError::ChannelJoin {
                        channel: channel.to_string(),
                        reason,
                    }
                })?;
                self.post_once(token, channel, text).await?
            }
            other => other?,
        };

        debug!(ts = %response.ts, "Message posted to Slack");

        Ok(PostedMessage {
            channel_id: response.channel.unwrap_or_else(|| channel.to_string()),
            ts: response.ts,
        })
    }

    #[instrument(skip_all)]
    async fn list_channels(&self, token: &SecretString) -> Result<Vec<Channel>, SlackError> {
        self.paginate(
            "conversations.list",
            token,
            &[
                ("types", "public_channel,private_channel"),
                ("exclude_archived", "true"),
            ],
            |page: ConversationsListResponse| {
                let next = page.response_metadata.cursor().map(String::from);
                (page.channels, next)
            },
        )
        .await
    }

    #[instrument(skip(self, token), fields(channel = %channel))]
    async fn channel_info(&self, token: &SecretString, channel: &str) -> Result<Channel, SlackError> {
        let request = self
            .client
            .get(self.endpoint("conversations.info"))
            .bearer_auth(token.expose_secret())
            .query(&[("channel", channel), ("include_num_members", "true")]);
        let response: ConversationsInfoResponse = self.call("conversations.info", request).await?;
        Ok(response.channel)
    }

    #[instrument(skip(self, token), fields(channel = %channel))]
    async fn channel_members(
        &self,
        token: &SecretString,
        channel: &str,
    ) -> Result<Vec<String>, SlackError> {
        self.paginate(
            "conversations.members",
            token,
            &[("channel", channel)],
            |page: ConversationsMembersResponse| {
                let next = page.response_metadata.cursor().map(String::from);
                (page.members, next)
            },
        )
        .await
    }

    #[instrument(skip_all)]
    async fn list_users(&self, token: &SecretString) -> Result<Vec<SlackUser>, SlackError> {
        self.paginate(
            "users.list",
            token,
            &[],
            |page: UsersListResponse| {
                let next = page.response_metadata.cursor().map(String::from);
                (page.members, next)
            },
        )
        .await
    }
}
