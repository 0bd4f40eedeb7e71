//! Slack token lifecycle: on-demand refresh, legacy migration and sweeps.
//!
//! Slack rotating tokens expire after 12 hours. Callers ask for a usable
//! token with [`TokenLifecycleManager::get_valid_access_token`]; tokens close
//! to expiry are refreshed first. A background sweep keeps idle users'
//! tokens fresh and migrates long-lived legacy tokens to rotation.
//!
//! # Refresh serialization
//!
//! Slack invalidates a refresh token once it has been used, so two
//! concurrent refreshes for the same user would leave one of them holding a
//! dead token. Every refresh runs under a per-user async lock, and the
//! credential is re-read after the lock is acquired: callers that queued
//! behind a refresh find a fresh token and reuse it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use slackpost_core::UserId;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::db::{CredentialStore, RepositoryError, SlackCredential, TokenUpdate};
use crate::slack::{RotatedToken, SlackApi, SlackError};

/// Idle time after which a user's refresh lock is dropped.
const LOCK_IDLE: Duration = Duration::from_secs(60 * 60);

/// Errors from token lifecycle operations.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The user has never connected Slack, or has disconnected.
    #[error("Slack is not connected for this user")]
    NoCredential,

    /// A refresh was requested for a legacy token.
    #[error("Stored Slack credential has no refresh token")]
    NoRefreshToken,

    /// Slack refused the stored refresh token; the user must reconnect.
    #[error("Slack rejected the refresh token: {0}")]
    RefreshRejected(String),

    #[error("Credential storage error: {0}")]
    Storage(#[from] RepositoryError),

    #[error(transparent)]
    Slack(SlackError),
}

impl From<SlackError> for TokenError {
    fn from(err: SlackError) -> Self {
        match err {
            SlackError::RefreshRejected(reason) => Self::RefreshRejected(reason),
            other => Self::Slack(other),
        }
    }
}

/// Outcome counts of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub checked: usize,
    pub migrated: usize,
    pub refreshed: usize,
    pub failed: usize,
}

/// Outcome counts of a forced legacy migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub checked: usize,
    pub migrated_count: usize,
    pub error_count: usize,
}

/// Health of one stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenHealth {
    Valid,
    /// Expires within the sweep window.
    ExpiringSoon,
    Expired,
    /// Long-lived token without rotation.
    Legacy,
    /// Stored row could not be decoded.
    Unreadable,
}

/// Per-user token status, without token material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatus {
    pub user_id: UserId,
    pub health: TokenHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceRef>,
    /// First characters of the access token, enough to tell tokens apart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_prefix: Option<String>,
    pub has_refresh_token: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Seconds until `expires_at`; negative once expired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_remaining_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refreshed: Option<DateTime<Utc>>,
}

/// Token status across all connected users.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatusReport {
    pub total: usize,
    pub valid: usize,
    pub expiring_soon: usize,
    pub expired: usize,
    pub legacy: usize,
    pub unreadable: usize,
    pub users: Vec<TokenStatus>,
}

impl TokenStatusReport {
    fn push(&mut self, status: TokenStatus) {
        self.total += 1;
        match status.health {
            TokenHealth::Valid => self.valid += 1,
            TokenHealth::ExpiringSoon => self.expiring_soon += 1,
            TokenHealth::Expired => self.expired += 1,
            TokenHealth::Legacy => self.legacy += 1,
            TokenHealth::Unreadable => self.unreadable += 1,
        }
        self.users.push(status);
    }
}

/// Workspace a user connected through the OAuth callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedWorkspace {
    pub user_id: UserId,
    pub workspace: WorkspaceRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceRef {
    pub id: String,
    pub name: String,
}

/// Owns every read and write of Slack credentials outside the store itself.
pub struct TokenLifecycleManager {
    store: Arc<dyn CredentialStore>,
    slack: Arc<dyn SlackApi>,
    locks: Cache<UserId, Arc<Mutex<()>>>,
    refresh_window: chrono::Duration,
    sweep_window: chrono::Duration,
}

impl std::fmt::Debug for TokenLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLifecycleManager")
            .field("refresh_window", &self.refresh_window)
            .field("sweep_window", &self.sweep_window)
            .finish_non_exhaustive()
    }
}

impl TokenLifecycleManager {
    /// Create a manager with the refresh windows from `config`.
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        slack: Arc<dyn SlackApi>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            slack,
            locks: Cache::builder().time_to_idle(LOCK_IDLE).build(),
            refresh_window: to_chrono(config.refresh_window),
            sweep_window: to_chrono(config.sweep_window),
        }
    }

    async fn lock_for(&self, user_id: &UserId) -> Arc<Mutex<()>> {
        self.locks
            .get_with(user_id.clone(), async { Arc::new(Mutex::new(())) })
            .await
    }

    async fn load_required(&self, user_id: &UserId) -> Result<SlackCredential, TokenError> {
        self.store
            .load(user_id)
            .await?
            .ok_or(TokenError::NoCredential)
    }

    /// Return an access token that is valid for at least the refresh window.
    ///
    /// Legacy tokens are returned as stored.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::NoCredential` if the user has not connected Slack,
    /// `TokenError::RefreshRejected` if a needed refresh was refused, and
    /// `TokenError::Storage` if the store is unavailable.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_valid_access_token(
        &self,
        user_id: &UserId,
    ) -> Result<SecretString, TokenError> {
        let credential = self.load_required(user_id).await?;
        if !needs_refresh(&credential, Utc::now(), self.refresh_window) {
            return Ok(credential.access_token);
        }

        match self.refresh_if_expiring(user_id, self.refresh_window).await? {
            Some(rotated) => Ok(rotated.access_token),
            None => Ok(self.load_required(user_id).await?.access_token),
        }
    }

    /// Refresh under the user's lock unless another caller already did.
    ///
    /// Returns `None` when the re-read credential no longer needs a refresh.
    async fn refresh_if_expiring(
        &self,
        user_id: &UserId,
        window: chrono::Duration,
    ) -> Result<Option<RotatedToken>, TokenError> {
        let lock = self.lock_for(user_id).await;
        let _guard = lock.lock().await;

        let credential = self.load_required(user_id).await?;
        if !needs_refresh(&credential, Utc::now(), window) {
            debug!(user_id = %user_id, "Token already refreshed by another caller");
            return Ok(None);
        }

        self.refresh_locked(&credential).await.map(Some)
    }

    /// Force a refresh with the stored refresh token.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::NoRefreshToken` for legacy credentials and
    /// `TokenError::RefreshRejected` if Slack refuses the refresh token.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn refresh(&self, user_id: &UserId) -> Result<RotatedToken, TokenError> {
        let lock = self.lock_for(user_id).await;
        let _guard = lock.lock().await;

        let credential = self.load_required(user_id).await?;
        self.refresh_locked(&credential).await
    }

    /// Caller must hold the user's lock.
    async fn refresh_locked(&self, credential: &SlackCredential) -> Result<RotatedToken, TokenError> {
        let refresh_token = credential
            .refresh_token
            .as_ref()
            .ok_or(TokenError::NoRefreshToken)?;

        let rotated = self.slack.refresh_token(refresh_token).await.map_err(|e| {
            warn!(user_id = %credential.user_id, error = %e, "Slack token refresh failed");
            TokenError::from(e)
        })?;

        self.store_rotated(&credential.user_id, &rotated).await?;
        info!(
            user_id = %credential.user_id,
            expires_at = ?rotated.expires_at,
            "Slack token refreshed"
        );
        Ok(rotated)
    }

    async fn store_rotated(&self, user_id: &UserId, rotated: &RotatedToken) -> Result<(), TokenError> {
        let update = TokenUpdate {
            access_token: rotated.access_token.clone(),
            refresh_token: rotated.refresh_token.clone(),
            expires_at: rotated.expires_at,
            refreshed_at: Utc::now(),
        };
        if self.store.update_tokens(user_id, &update).await? {
            Ok(())
        } else {
            // Disconnected while the refresh was in flight.
            Err(TokenError::NoCredential)
        }
    }

    /// Exchange a legacy token for a rotating pair.
    ///
    /// Returns `false` without calling Slack if the user has no credential or
    /// already rotates.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Slack` if the exchange fails or yields no refresh
    /// token, and `TokenError::Storage` if the store is unavailable.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn migrate_legacy_credential(&self, user_id: &UserId) -> Result<bool, TokenError> {
        let lock = self.lock_for(user_id).await;
        let _guard = lock.lock().await;

        let Some(credential) = self.store.load(user_id).await? else {
            return Ok(false);
        };
        if !credential.is_legacy() {
            return Ok(false);
        }

        let rotated = self
            .slack
            .exchange_legacy_token(&credential.access_token)
            .await?;
        if rotated.refresh_token.is_none() {
            return Err(TokenError::Slack(SlackError::Response(
                "oauth.v2.exchange returned no refresh token".to_string(),
            )));
        }

        self.store_rotated(user_id, &rotated).await?;
        info!(user_id = %user_id, "Legacy Slack token migrated to rotation");
        Ok(true)
    }

    /// Migrate legacy credentials and refresh tokens expiring within the
    /// sweep window, one user at a time.
    ///
    /// Per-user failures are counted and logged, never returned.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Storage` only if the connected users cannot be listed.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport, TokenError> {
        let users = self.store.list_connected().await?;
        let mut report = SweepReport::default();

        for user_id in users {
            report.checked += 1;

            let credential = match self.store.load(&user_id).await {
                Ok(Some(credential)) => credential,
                Ok(None) => continue,
                Err(e) => {
                    error!(user_id = %user_id, error = %e, "Could not load credential during sweep");
                    report.failed += 1;
                    continue;
                }
            };

            if credential.is_legacy() {
                match self.migrate_legacy_credential(&user_id).await {
                    Ok(true) => report.migrated += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "Legacy migration failed during sweep");
                        report.failed += 1;
                    }
                }
            } else if credential.expires_within(Utc::now(), self.sweep_window) {
                match self.refresh_if_expiring(&user_id, self.sweep_window).await {
                    Ok(Some(_)) => report.refreshed += 1,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "Token refresh failed during sweep");
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            checked = report.checked,
            migrated = report.migrated,
            refreshed = report.refreshed,
            failed = report.failed,
            "Token sweep complete"
        );
        Ok(report)
    }

    /// Summarize every stored credential.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Storage` if the connected users cannot be listed.
    pub async fn token_status(&self) -> Result<TokenStatusReport, TokenError> {
        let now = Utc::now();
        let mut report = TokenStatusReport::default();

        for user_id in self.store.list_connected().await? {
            let status = match self.store.load(&user_id).await {
                Ok(Some(credential)) => TokenStatus {
                    health: health(&credential, now, self.sweep_window),
                    token_prefix: Some(token_prefix(credential.access_token.expose_secret())),
                    has_refresh_token: credential.refresh_token.is_some(),
                    time_remaining_secs: credential
                        .expires_at
                        .map(|at| (at - now).num_seconds()),
                    expires_at: credential.expires_at,
                    last_refreshed: credential.last_refreshed,
                    workspace: Some(WorkspaceRef {
                        id: credential.workspace_id,
                        name: credential.workspace_name,
                    }),
                    user_id,
                },
                Ok(None) => continue,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Unreadable credential");
                    TokenStatus {
                        user_id,
                        health: TokenHealth::Unreadable,
                        workspace: None,
                        token_prefix: None,
                        has_refresh_token: false,
                        expires_at: None,
                        time_remaining_secs: None,
                        last_refreshed: None,
                    }
                }
            };
            report.push(status);
        }

        Ok(report)
    }

    /// Migrate every legacy credential now.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Storage` if the connected users cannot be listed.
    #[instrument(skip(self))]
    pub async fn force_migration(&self) -> Result<MigrationReport, TokenError> {
        let mut report = MigrationReport::default();

        for user_id in self.store.list_connected().await? {
            report.checked += 1;
            match self.migrate_legacy_credential(&user_id).await {
                Ok(true) => report.migrated_count += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Forced migration failed");
                    report.error_count += 1;
                }
            }
        }

        info!(
            migrated = report.migrated_count,
            errors = report.error_count,
            "Forced token migration complete"
        );
        Ok(report)
    }

    /// Exchange an OAuth code and store the resulting credential.
    ///
    /// Nothing is stored if the exchange fails.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Slack(SlackError::InvalidCode)` for a rejected or
    /// incomplete exchange and `TokenError::Storage` if saving fails.
    #[instrument(skip(self, code), fields(user_id = %user_id))]
    pub async fn exchange_oauth_code(
        &self,
        code: &str,
        user_id: &UserId,
    ) -> Result<ConnectedWorkspace, TokenError> {
        let grant = self.slack.exchange_code(code).await?;

        let credential = SlackCredential {
            user_id: user_id.clone(),
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: grant.expires_at,
            last_refreshed: Some(Utc::now()),
            workspace_id: grant.workspace_id,
            workspace_name: grant.workspace_name,
            authed_user_id: Some(grant.authed_user_id),
            bot_user_id: grant.bot_user_id,
            scope: grant.scope,
        };

        let lock = self.lock_for(user_id).await;
        let _guard = lock.lock().await;
        self.store.save(&credential).await?;

        info!(
            user_id = %user_id,
            workspace_id = %credential.workspace_id,
            rotating = !credential.is_legacy(),
            "Slack workspace connected"
        );
        Ok(ConnectedWorkspace {
            user_id: credential.user_id,
            workspace: WorkspaceRef {
                id: credential.workspace_id,
                name: credential.workspace_name,
            },
        })
    }

    /// Remove the user's credential. Returns `false` if none was stored.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Storage` if the store is unavailable.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn disconnect(&self, user_id: &UserId) -> Result<bool, TokenError> {
        let lock = self.lock_for(user_id).await;
        let _guard = lock.lock().await;

        let cleared = self.store.clear(user_id).await?;
        if cleared {
            info!(user_id = %user_id, "Slack workspace disconnected");
        }
        Ok(cleared)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Rotating tokens inside the window need a refresh; legacy tokens never do.
fn needs_refresh(credential: &SlackCredential, now: DateTime<Utc>, window: chrono::Duration) -> bool {
    !credential.is_legacy() && credential.expires_within(now, window)
}

const TOKEN_PREFIX_CHARS: usize = 8;

fn token_prefix(token: &str) -> String {
    let mut prefix: String = token.chars().take(TOKEN_PREFIX_CHARS).collect();
    prefix.push('\u{2026}');
    prefix
}

fn health(credential: &SlackCredential, now: DateTime<Utc>, window: chrono::Duration) -> TokenHealth {
    if credential.is_legacy() {
        TokenHealth::Legacy
    } else if credential.expires_within(now, chrono::Duration::zero()) {
        TokenHealth::Expired
    } else if credential.expires_within(now, window) {
        TokenHealth::ExpiringSoon
    } else {
        TokenHealth::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        InMemoryCredentialStore, StubSlack, legacy_credential, rotating_credential, user,
    };
    use chrono::Duration as ChronoDuration;

    fn manager(
        store: &Arc<InMemoryCredentialStore>,
        slack: &Arc<StubSlack>,
    ) -> Arc<TokenLifecycleManager> {
        Arc::new(TokenLifecycleManager::new(
            store.clone(),
            slack.clone(),
            &SchedulerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_fresh_token_returned_without_refresh() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let slack = Arc::new(StubSlack::new());
        let alice = user("alice");
        store
            .insert(rotating_credential(&alice, Utc::now() + ChronoDuration::hours(6)))
            .await;

        let token = manager(&store, &slack)
            .get_valid_access_token(&alice)
            .await
            .expect("token");

        assert_eq!(token.expose_secret(), "xoxe.xoxp-initial");
        assert_eq!(slack.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_stored() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let slack = Arc::new(StubSlack::new());
        let alice = user("alice");
        store
            .insert(rotating_credential(&alice, Utc::now() + ChronoDuration::minutes(2)))
            .await;

        let token = manager(&store, &slack)
            .get_valid_access_token(&alice)
            .await
            .expect("token");

        assert_eq!(token.expose_secret(), "xoxe.xoxp-1");
        let stored = store.get(&alice).await.expect("stored");
        assert_eq!(stored.access_token.expose_secret(), "xoxe.xoxp-1");
        assert_eq!(
            stored.refresh_token.as_ref().map(ExposeSecret::expose_secret),
            Some("xoxe-1-1")
        );
        assert!(stored.last_refreshed.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let slack = Arc::new(StubSlack::new().with_refresh_delay(Duration::from_millis(50)));
        let alice = user("alice");
        store
            .insert(rotating_credential(&alice, Utc::now() + ChronoDuration::minutes(1)))
            .await;
        let manager = manager(&store, &slack);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let alice = alice.clone();
            handles.push(tokio::spawn(async move {
                manager.get_valid_access_token(&alice).await
            }));
        }

        for handle in handles {
            let token = handle.await.expect("join").expect("token");
            assert_eq!(token.expose_secret(), "xoxe.xoxp-1");
        }
        assert_eq!(slack.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let slack = Arc::new(StubSlack::new());

        let result = manager(&store, &slack)
            .get_valid_access_token(&user("nobody"))
            .await;

        assert!(matches!(result, Err(TokenError::NoCredential)));
    }

    #[tokio::test]
    async fn test_legacy_token_returned_as_is() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let slack = Arc::new(StubSlack::new());
        let alice = user("alice");
        store.insert(legacy_credential(&alice)).await;

        let token = manager(&store, &slack)
            .get_valid_access_token(&alice)
            .await
            .expect("token");

        assert_eq!(token.expose_secret(), "xoxp-legacy");
        assert_eq!(slack.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_refresh_legacy_is_no_refresh_token() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let slack = Arc::new(StubSlack::new());
        let alice = user("alice");
        store.insert(legacy_credential(&alice)).await;

        let result = manager(&store, &slack).refresh(&alice).await;

        assert!(matches!(result, Err(TokenError::NoRefreshToken)));
    }

    #[tokio::test]
    async fn test_rejected_refresh_leaves_credential_untouched() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let slack = Arc::new(StubSlack::new().rejecting_refresh());
        let alice = user("alice");
        store
            .insert(rotating_credential(&alice, Utc::now() + ChronoDuration::minutes(1)))
            .await;

        let result = manager(&store, &slack).get_valid_access_token(&alice).await;

        assert!(matches!(result, Err(TokenError::RefreshRejected(_))));
        let stored = store.get(&alice).await.expect("stored");
        assert_eq!(stored.access_token.expose_secret(), "xoxe.xoxp-initial");
    }

    #[tokio::test]
    async fn test_migrate_skips_rotating_credential() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let slack = Arc::new(StubSlack::new());
        let alice = user("alice");
        store
            .insert(rotating_credential(&alice, Utc::now() + ChronoDuration::hours(6)))
            .await;

        let migrated = manager(&store, &slack)
            .migrate_legacy_credential(&alice)
            .await
            .expect("migrate");

        assert!(!migrated);
        assert_eq!(slack.legacy_exchange_calls(), 0);
    }

    #[tokio::test]
    async fn test_sweep_counts_each_outcome() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let slack = Arc::new(StubSlack::new());
        let (legacy, expiring, fresh, broken) =
            (user("legacy"), user("expiring"), user("fresh"), user("broken"));
        store.insert(legacy_credential(&legacy)).await;
        store
            .insert(rotating_credential(&expiring, Utc::now() + ChronoDuration::hours(2)))
            .await;
        store
            .insert(rotating_credential(&fresh, Utc::now() + ChronoDuration::hours(10)))
            .await;
        store
            .insert(rotating_credential(&broken, Utc::now() + ChronoDuration::hours(10)))
            .await;
        store.corrupt(&broken).await;

        let report = manager(&store, &slack).sweep().await.expect("sweep");

        assert_eq!(
            report,
            SweepReport {
                checked: 4,
                migrated: 1,
                refreshed: 1,
                failed: 1,
            }
        );
        let migrated = store.get(&legacy).await.expect("stored");
        assert!(!migrated.is_legacy());
    }

    #[tokio::test]
    async fn test_token_status_classifies_credentials() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let slack = Arc::new(StubSlack::new());
        store.insert(legacy_credential(&user("a"))).await;
        store
            .insert(rotating_credential(&user("b"), Utc::now() - ChronoDuration::minutes(5)))
            .await;
        store
            .insert(rotating_credential(&user("c"), Utc::now() + ChronoDuration::hours(1)))
            .await;
        store
            .insert(rotating_credential(&user("d"), Utc::now() + ChronoDuration::hours(10)))
            .await;

        let report = manager(&store, &slack).token_status().await.expect("status");

        assert_eq!(report.total, 4);
        assert_eq!(report.legacy, 1);
        assert_eq!(report.expired, 1);
        assert_eq!(report.expiring_soon, 1);
        assert_eq!(report.valid, 1);

        let legacy = report
            .users
            .iter()
            .find(|status| status.user_id == user("a"))
            .expect("legacy user");
        assert_eq!(legacy.token_prefix.as_deref(), Some("xoxp-leg\u{2026}"));
        assert!(!legacy.has_refresh_token);
        assert_eq!(legacy.time_remaining_secs, None);
        assert_eq!(
            legacy.workspace,
            Some(WorkspaceRef {
                id: "T0001".to_string(),
                name: "Acme".to_string()
            })
        );

        let valid = report
            .users
            .iter()
            .find(|status| status.user_id == user("d"))
            .expect("valid user");
        assert!(valid.has_refresh_token);
        let remaining = valid.time_remaining_secs.expect("rotating token expires");
        assert!(remaining > 9 * 3600 && remaining <= 10 * 3600);
    }

    #[test]
    fn test_token_prefix_is_truncated() {
        assert_eq!(token_prefix("xoxe.xoxp-1-abcdef"), "xoxe.xox\u{2026}");
        assert_eq!(token_prefix("short"), "short\u{2026}");
    }

    #[tokio::test]
    async fn test_failed_exchange_persists_nothing() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let slack = Arc::new(StubSlack::new());

        let result = manager(&store, &slack)
            .exchange_oauth_code(StubSlack::BAD_CODE, &user("alice"))
            .await;

        assert!(matches!(
            result,
            Err(TokenError::Slack(SlackError::InvalidCode(_)))
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_disconnect_clears_credential() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let slack = Arc::new(StubSlack::new());
        let alice = user("alice");
        store.insert(legacy_credential(&alice)).await;
        let manager = manager(&store, &slack);

        assert!(manager.disconnect(&alice).await.expect("disconnect"));
        assert!(!manager.disconnect(&alice).await.expect("disconnect"));
        assert!(matches!(
            manager.get_valid_access_token(&alice).await,
            Err(TokenError::NoCredential)
        ));
    }
}
