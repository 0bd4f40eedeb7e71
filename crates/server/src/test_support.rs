//! Shared test infrastructure: in-memory stores and a scripted Slack gateway.
//!
//! Used by unit tests in this crate and by the `integration-tests` crate.
//! Nothing here is wired into the server binary.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use slackpost_core::{MessageStatus, ScheduledMessageId, UserId};
use tokio::sync::Mutex;

use crate::config::{SchedulerConfig, SecurityConfig, ServerConfig, SlackAppConfig};
use crate::db::{
    CredentialStore, NewScheduledMessage, RepositoryError, ScheduledMessage,
    ScheduledMessageStore, SlackCredential, TokenUpdate,
};
use crate::slack::{
    Channel, OAuthGrant, PostedMessage, RotatedToken, SlackApi, SlackError, SlackUser,
};
use crate::state::AppState;

/// Admin bearer token in [`server_config`].
pub const ADMIN_TOKEN: &str = "adm_7Qe2pL9xVb4KfT1sWm8RzN3c";

/// 32 zero bytes, base64 encoded.
pub const ENCRYPTION_KEY_B64: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

/// Configuration for tests, pointing the Slack client at `slack_api_base`.
#[must_use]
pub fn server_config(slack_api_base: &str) -> ServerConfig {
    ServerConfig {
        database_url: SecretString::from("postgres://localhost/slackpost_test"),
        host: std::net::IpAddr::from([127, 0, 0, 1]),
        port: 0,
        base_url: "http://localhost:3002".to_string(),
        slack: SlackAppConfig {
            client_id: "1111.2222".to_string(),
            client_secret: SecretString::from("client-secret-for-tests"),
            redirect_uri: "http://localhost:3002/api/slack/callback".to_string(),
            api_base: slack_api_base.to_string(),
            bot_scopes: vec!["chat:write".to_string(), "channels:read".to_string()],
            http_timeout: Duration::from_secs(2),
        },
        security: SecurityConfig {
            token_encryption_key: SecretString::from(ENCRYPTION_KEY_B64),
            token_encryption_key_id: "test".to_string(),
            state_signing_secret: SecretString::from("Xk9#mP2$vL7@nQ4&wR8*tY3!bZ6^cF1%"),
            admin_api_token: SecretString::from(ADMIN_TOKEN),
        },
        scheduler: SchedulerConfig::default(),
        identity_header: "x-authenticated-user".to_string(),
        json_logs: false,
        sentry_dsn: None,
        sentry_environment: None,
        sentry_sample_rate: 0.0,
        sentry_traces_sample_rate: 0.0,
    }
}

/// Application state over the given fakes.
///
/// The pool never connects; only the readiness check touches it.
///
/// # Panics
///
/// Panics if the placeholder database URL cannot be parsed.
#[must_use]
pub fn app_state(
    credentials: Arc<dyn CredentialStore>,
    messages: Arc<dyn ScheduledMessageStore>,
    slack: Arc<dyn SlackApi>,
) -> AppState {
    let config = server_config("http://127.0.0.1:9");
    let pool = sqlx::PgPool::connect_lazy(config.database_url.expose_secret())
        .expect("lazy pool from static URL");
    AppState::new(config, pool, credentials, messages, slack)
}

/// Parse a user ID, panicking on invalid input.
///
/// # Panics
///
/// Panics if `raw` is not a valid user ID.
#[must_use]
pub fn user(raw: &str) -> UserId {
    UserId::parse(raw).expect("valid test user id")
}

/// A rotating credential for `user_id` that expires at `expires_at`.
#[must_use]
pub fn rotating_credential(user_id: &UserId, expires_at: DateTime<Utc>) -> SlackCredential {
    SlackCredential {
        user_id: user_id.clone(),
        access_token: SecretString::from("xoxe.xoxp-initial"),
        refresh_token: Some(SecretString::from("xoxe-1-initial")),
        expires_at: Some(expires_at),
        last_refreshed: None,
        workspace_id: "T0001".to_string(),
        workspace_name: "Acme".to_string(),
        authed_user_id: Some("U0001".to_string()),
        bot_user_id: Some("B0001".to_string()),
        scope: Some("chat:write,channels:read".to_string()),
    }
}

/// A long-lived credential with no refresh token and no expiry.
#[must_use]
pub fn legacy_credential(user_id: &UserId) -> SlackCredential {
    SlackCredential {
        access_token: SecretString::from("xoxp-legacy"),
        refresh_token: None,
        expires_at: None,
        ..rotating_credential(user_id, Utc::now())
    }
}

// =============================================================================
// Credential store
// =============================================================================

/// Credential store backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    credentials: Mutex<HashMap<UserId, SlackCredential>>,
    /// Users whose stored row fails to decode.
    corrupt: Mutex<HashSet<UserId>>,
}

impl InMemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a credential directly, bypassing `save` semantics.
    pub async fn insert(&self, credential: SlackCredential) {
        self.credentials
            .lock()
            .await
            .insert(credential.user_id.clone(), credential);
    }

    /// Make `load` for `user_id` fail as an undecryptable row would.
    pub async fn corrupt(&self, user_id: &UserId) {
        self.corrupt.lock().await.insert(user_id.clone());
    }

    /// Stored credential without going through `load`.
    pub async fn get(&self, user_id: &UserId) -> Option<SlackCredential> {
        self.credentials.lock().await.get(user_id).cloned()
    }

    pub async fn is_empty(&self) -> bool {
        self.credentials.lock().await.is_empty()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn save(&self, credential: &SlackCredential) -> Result<(), RepositoryError> {
        let mut credentials = self.credentials.lock().await;
        let mut next = credential.clone();
        if next.refresh_token.is_none() {
            next.refresh_token = credentials
                .get(&credential.user_id)
                .and_then(|existing| existing.refresh_token.clone());
        }
        credentials.insert(next.user_id.clone(), next);
        Ok(())
    }

    async fn load(&self, user_id: &UserId) -> Result<Option<SlackCredential>, RepositoryError> {
        if self.corrupt.lock().await.contains(user_id) {
            return Err(RepositoryError::DataCorruption(format!(
                "access token for user {user_id}: undecryptable"
            )));
        }
        Ok(self.credentials.lock().await.get(user_id).cloned())
    }

    async fn update_tokens(
        &self,
        user_id: &UserId,
        update: &TokenUpdate,
    ) -> Result<bool, RepositoryError> {
        let mut credentials = self.credentials.lock().await;
        let Some(credential) = credentials.get_mut(user_id) else {
            return Ok(false);
        };
        credential.access_token = update.access_token.clone();
        if let Some(refresh) = &update.refresh_token {
            credential.refresh_token = Some(refresh.clone());
        }
        credential.expires_at = update.expires_at;
        credential.last_refreshed = Some(update.refreshed_at);
        Ok(true)
    }

    async fn list_connected(&self) -> Result<Vec<UserId>, RepositoryError> {
        let mut users: Vec<UserId> = self.credentials.lock().await.keys().cloned().collect();
        users.sort();
        Ok(users)
    }

    async fn clear(&self, user_id: &UserId) -> Result<bool, RepositoryError> {
        Ok(self.credentials.lock().await.remove(user_id).is_some())
    }
}

// =============================================================================
// Scheduled message store
// =============================================================================

/// Scheduled message store backed by a map, with the same transition rules
/// as the `PostgreSQL` store.
#[derive(Debug, Default)]
pub struct InMemoryScheduledMessageStore {
    messages: Mutex<HashMap<ScheduledMessageId, ScheduledMessage>>,
}

impl InMemoryScheduledMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn transition(
        &self,
        id: ScheduledMessageId,
        next: MessageStatus,
        apply: impl FnOnce(&mut ScheduledMessage) + Send,
    ) -> Result<ScheduledMessage, RepositoryError> {
        let mut messages = self.messages.lock().await;
        let message = messages.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        if !message.status.can_transition_to(next) {
            return Err(RepositoryError::InvalidState {
                current: message.status,
            });
        }
        message.status = next;
        message.updated_at = Utc::now();
        apply(message);
        Ok(message.clone())
    }
}

#[async_trait]
impl ScheduledMessageStore for InMemoryScheduledMessageStore {
    async fn create(&self, new: NewScheduledMessage) -> Result<ScheduledMessage, RepositoryError> {
        let now = Utc::now();
        let message = ScheduledMessage {
            id: ScheduledMessageId::generate(),
            user_id: new.user_id,
            channel_id: new.channel_id,
            message: new.message,
            scheduled_time: new.scheduled_time,
            status: MessageStatus::Scheduled,
            slack_ts: None,
            error: None,
            sent_at: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        };
        self.messages
            .lock()
            .await
            .insert(message.id, message.clone());
        Ok(message)
    }

    async fn get(
        &self,
        id: ScheduledMessageId,
    ) -> Result<Option<ScheduledMessage>, RepositoryError> {
        Ok(self.messages.lock().await.get(&id).cloned())
    }

    async fn confirm(&self, id: ScheduledMessageId) -> Result<ScheduledMessage, RepositoryError> {
        self.transition(id, MessageStatus::Confirmed, |_| {}).await
    }

    async fn mark_sent(
        &self,
        id: ScheduledMessageId,
        slack_ts: &str,
    ) -> Result<ScheduledMessage, RepositoryError> {
        let slack_ts = slack_ts.to_string();
        self.transition(id, MessageStatus::Sent, move |m| {
            m.slack_ts = Some(slack_ts);
            m.sent_at = Some(Utc::now());
            m.error = None;
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: ScheduledMessageId,
        error: &str,
    ) -> Result<ScheduledMessage, RepositoryError> {
        let error = error.to_string();
        self.transition(id, MessageStatus::Failed, move |m| m.error = Some(error))
            .await
    }

    async fn cancel(&self, id: ScheduledMessageId) -> Result<ScheduledMessage, RepositoryError> {
        self.transition(id, MessageStatus::Cancelled, |m| {
            m.cancelled_at = Some(Utc::now());
        })
        .await
    }

    async fn due_messages(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        let mut due: Vec<ScheduledMessage> = self
            .messages
            .lock()
            .await
            .values()
            .filter(|m| m.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|m| m.scheduled_time);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        let mut mine: Vec<ScheduledMessage> = self
            .messages
            .lock()
            .await
            .values()
            .filter(|m| &m.user_id == user_id)
            .cloned()
            .collect();
        mine.sort_by(|a, b| b.scheduled_time.cmp(&a.scheduled_time));
        mine.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(mine)
    }
}

// =============================================================================
// Slack gateway
// =============================================================================

/// A message accepted by [`StubSlack::post_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedText {
    pub token: String,
    pub channel: String,
    pub text: String,
}

/// Scripted [`SlackApi`] that counts calls.
///
/// Codes equal to [`StubSlack::BAD_CODE`] fail the exchange. Tokens handed
/// out are numbered so tests can tell which refresh produced them.
#[derive(Debug)]
pub struct StubSlack {
    refresh_delay: Duration,
    reject_refresh: bool,
    token_lifetime: chrono::Duration,
    failing_channels: HashMap<String, String>,
    channels: Vec<Channel>,
    refresh_calls: AtomicUsize,
    legacy_exchange_calls: AtomicUsize,
    exchange_calls: AtomicUsize,
    posts: Mutex<Vec<PostedText>>,
}

impl Default for StubSlack {
    fn default() -> Self {
        Self::new()
    }
}

impl StubSlack {
    pub const BAD_CODE: &'static str = "bad-code";

    #[must_use]
    pub fn new() -> Self {
        Self {
            refresh_delay: Duration::ZERO,
            reject_refresh: false,
            token_lifetime: chrono::Duration::hours(12),
            failing_channels: HashMap::new(),
            channels: vec![Channel {
                id: "C0001".to_string(),
                name: "general".to_string(),
                is_private: false,
                is_member: true,
                is_archived: false,
                num_members: Some(3),
            }],
            refresh_calls: AtomicUsize::new(0),
            legacy_exchange_calls: AtomicUsize::new(0),
            exchange_calls: AtomicUsize::new(0),
            posts: Mutex::new(Vec::new()),
        }
    }

    /// Hold every refresh for `delay` before answering.
    #[must_use]
    pub const fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    /// Reject every refresh with `invalid_refresh_token`.
    #[must_use]
    pub const fn rejecting_refresh(mut self) -> Self {
        self.reject_refresh = true;
        self
    }

    /// Fail posts to `channel` with Slack error `code`.
    #[must_use]
    pub fn failing_channel(mut self, channel: &str, code: &str) -> Self {
        self.failing_channels
            .insert(channel.to_string(), code.to_string());
        self
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn legacy_exchange_calls(&self) -> usize {
        self.legacy_exchange_calls.load(Ordering::SeqCst)
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub async fn posts(&self) -> Vec<PostedText> {
        self.posts.lock().await.clone()
    }

    fn rotated(&self, n: usize) -> RotatedToken {
        RotatedToken {
            access_token: SecretString::from(format!("xoxe.xoxp-{n}")),
            refresh_token: Some(SecretString::from(format!("xoxe-1-{n}"))),
            expires_at: Some(Utc::now() + self.token_lifetime),
        }
    }
}

#[async_trait]
impl SlackApi for StubSlack {
    async fn exchange_code(&self, code: &str) -> Result<OAuthGrant, SlackError> {
        let n = self.exchange_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if code == Self::BAD_CODE {
            return Err(SlackError::InvalidCode("invalid_code".to_string()));
        }
        let rotated = self.rotated(n);
        Ok(OAuthGrant {
            access_token: SecretString::from(format!("xoxe.xoxp-granted-{n}")),
            refresh_token: rotated.refresh_token,
            expires_at: rotated.expires_at,
            workspace_id: "T0001".to_string(),
            workspace_name: "Acme".to_string(),
            authed_user_id: "U0001".to_string(),
            bot_user_id: Some("B0001".to_string()),
            scope: Some("chat:write,channels:read".to_string()),
        })
    }

    async fn refresh_token(&self, _refresh_token: &SecretString) -> Result<RotatedToken, SlackError> {
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.reject_refresh {
            return Err(SlackError::RefreshRejected(
                "invalid_refresh_token".to_string(),
            ));
        }
        Ok(self.rotated(n))
    }

    async fn exchange_legacy_token(&self, _token: &SecretString) -> Result<RotatedToken, SlackError> {
        let n = self.legacy_exchange_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.rotated(1000 + n))
    }

    async fn post_message(
        &self,
        token: &SecretString,
        channel: &str,
        text: &str,
    ) -> Result<PostedMessage, SlackError> {
        if let Some(code) = self.failing_channels.get(channel) {
            return Err(SlackError::PlatformRejected { code: code.clone() });
        }
        let mut posts = self.posts.lock().await;
        posts.push(PostedText {
            token: token.expose_secret().to_string(),
            channel: channel.to_string(),
            text: text.to_string(),
        });
        Ok(PostedMessage {
            ts: format!("1700000000.{:06}", posts.len()),
            channel_id: channel.to_string(),
        })
    }

    async fn list_channels(&self, _token: &SecretString) -> Result<Vec<Channel>, SlackError> {
        Ok(self.channels.clone())
    }

    async fn channel_info(&self, _token: &SecretString, channel: &str) -> Result<Channel, SlackError> {
        self.channels
            .iter()
            .find(|c| c.id == channel)
            .cloned()
            .ok_or_else(|| SlackError::PlatformRejected {
                code: "channel_not_found".to_string(),
            })
    }

    async fn channel_members(
        &self,
        _token: &SecretString,
        _channel: &str,
    ) -> Result<Vec<String>, SlackError> {
        Ok(vec!["U0001".to_string(), "U0002".to_string()])
    }

    async fn list_users(&self, _token: &SecretString) -> Result<Vec<SlackUser>, SlackError> {
        Ok(vec![SlackUser {
            id: "U0001".to_string(),
            name: "ada".to_string(),
            real_name: Some("Ada Lovelace".to_string()),
            deleted: false,
            is_bot: false,
        }])
    }
}
