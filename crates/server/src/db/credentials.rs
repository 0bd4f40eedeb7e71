//! Slack credential storage.
//!
//! One credential per user, stored on the `users` row. Access and refresh
//! tokens are sealed with [`TokenCipher`] before they are written.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use slackpost_core::UserId;
use sqlx::PgPool;
use tracing::instrument;

use super::RepositoryError;
use crate::crypto::TokenCipher;

// =============================================================================
// Types
// =============================================================================

/// OAuth credential for one user's Slack workspace connection.
///
/// A credential without a refresh token is a legacy long-lived token that has
/// not been migrated to rotation yet.
///
/// Implements `Debug` manually to redact tokens.
#[derive(Clone)]
pub struct SlackCredential {
    pub user_id: UserId,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    /// `None` for legacy tokens that never expire.
    pub expires_at: Option<DateTime<Utc>>,
    pub last_refreshed: Option<DateTime<Utc>>,
    pub workspace_id: String,
    pub workspace_name: String,
    /// Slack user who authorized the app.
    pub authed_user_id: Option<String>,
    pub bot_user_id: Option<String>,
    /// Granted bot scopes, comma separated as Slack reports them.
    pub scope: Option<String>,
}

impl std::fmt::Debug for SlackCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackCredential")
            .field("user_id", &self.user_id)
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("last_refreshed", &self.last_refreshed)
            .field("workspace_id", &self.workspace_id)
            .field("workspace_name", &self.workspace_name)
            .field("authed_user_id", &self.authed_user_id)
            .field("bot_user_id", &self.bot_user_id)
            .field("scope", &self.scope)
            .finish()
    }
}

impl SlackCredential {
    /// Whether this is a non-rotating token awaiting migration.
    #[must_use]
    pub const fn is_legacy(&self) -> bool {
        self.refresh_token.is_none()
    }

    /// Whether the access token expires within `window` of `now`.
    ///
    /// Tokens without an expiry never do. An already-expired token does.
    #[must_use]
    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.expires_at.is_some_and(|at| at <= now + window)
    }
}

/// New token material after a refresh or legacy migration.
///
/// Implements `Debug` manually to redact tokens.
#[derive(Clone)]
pub struct TokenUpdate {
    pub access_token: SecretString,
    /// `None` keeps the stored refresh token.
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
    pub refreshed_at: DateTime<Utc>,
}

impl std::fmt::Debug for TokenUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenUpdate")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("refreshed_at", &self.refreshed_at)
            .finish()
    }
}

/// Persistence for per-user Slack credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert or replace a user's credential.
    ///
    /// A `None` refresh token never overwrites a stored one.
    async fn save(&self, credential: &SlackCredential) -> Result<(), RepositoryError>;

    /// Load a user's credential. Absence is `Ok(None)`.
    async fn load(&self, user_id: &UserId) -> Result<Option<SlackCredential>, RepositoryError>;

    /// Overwrite token fields in place. Returns `false` if the user has no credential.
    async fn update_tokens(
        &self,
        user_id: &UserId,
        update: &TokenUpdate,
    ) -> Result<bool, RepositoryError>;

    /// Every user that currently holds a credential.
    async fn list_connected(&self) -> Result<Vec<UserId>, RepositoryError>;

    /// Remove a user's credential, keeping the user row. Returns `false` if none was stored.
    async fn clear(&self, user_id: &UserId) -> Result<bool, RepositoryError>;
}

/// Internal row type for `PostgreSQL` queries.
#[derive(Debug, sqlx::FromRow)]
struct CredentialRow {
    user_id: UserId,
    slack_access_token: String,
    slack_refresh_token: Option<String>,
    slack_token_expires_at: Option<DateTime<Utc>>,
    slack_token_last_refreshed: Option<DateTime<Utc>>,
    slack_team_id: Option<String>,
    slack_team_name: Option<String>,
    slack_authed_user_id: Option<String>,
    slack_bot_user_id: Option<String>,
    slack_scope: Option<String>,
}

impl CredentialRow {
    fn open(self, cipher: &TokenCipher) -> Result<SlackCredential, RepositoryError> {
        let corrupt = |field: &str, e: &dyn std::fmt::Display| {
            RepositoryError::DataCorruption(format!("{field} for user {}: {e}", self.user_id))
        };

        let access_token = cipher
            .open(&self.slack_access_token)
            .map_err(|e| corrupt("access token", &e))?;
        let refresh_token = self
            .slack_refresh_token
            .as_deref()
            .map(|sealed| cipher.open(sealed))
            .transpose()
            .map_err(|e| corrupt("refresh token", &e))?;

        Ok(SlackCredential {
            access_token,
            refresh_token,
            expires_at: self.slack_token_expires_at,
            last_refreshed: self.slack_token_last_refreshed,
            workspace_id: self.slack_team_id.unwrap_or_default(),
            workspace_name: self.slack_team_name.unwrap_or_default(),
            authed_user_id: self.slack_authed_user_id,
            bot_user_id: self.slack_bot_user_id,
            scope: self.slack_scope,
            user_id: self.user_id,
        })
    }
}

// =============================================================================
// Repository
// =============================================================================

/// `PostgreSQL` credential store with tokens sealed at rest.
#[derive(Debug, Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
    cipher: TokenCipher,
}

impl PgCredentialStore {
    /// Create a new credential store.
    #[must_use]
    pub const fn new(pool: PgPool, cipher: TokenCipher) -> Self {
        Self { pool, cipher }
    }

    fn seal(&self, token: &SecretString) -> Result<String, RepositoryError> {
        self.cipher
            .seal(token)
            .map_err(|e| RepositoryError::DataCorruption(e.to_string()))
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    #[instrument(skip(self, credential), fields(user_id = %credential.user_id))]
    async fn save(&self, credential: &SlackCredential) -> Result<(), RepositoryError> {
        let access_token = self.seal(&credential.access_token)?;
        let refresh_token = credential
            .refresh_token
            .as_ref()
            .map(|t| self.seal(t))
            .transpose()?;

        sqlx::query(
            r"
            INSERT INTO users (
                user_id,
                slack_access_token,
                slack_refresh_token,
                slack_token_expires_at,
                slack_token_last_refreshed,
                slack_team_id,
                slack_team_name,
                slack_authed_user_id,
                slack_bot_user_id,
                slack_scope
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id) DO UPDATE SET
                slack_access_token = EXCLUDED.slack_access_token,
                slack_refresh_token = COALESCE(EXCLUDED.slack_refresh_token, users.slack_refresh_token),
                slack_token_expires_at = EXCLUDED.slack_token_expires_at,
                slack_token_last_refreshed = EXCLUDED.slack_token_last_refreshed,
                slack_team_id = EXCLUDED.slack_team_id,
                slack_team_name = EXCLUDED.slack_team_name,
                slack_authed_user_id = EXCLUDED.slack_authed_user_id,
                slack_bot_user_id = EXCLUDED.slack_bot_user_id,
                slack_scope = EXCLUDED.slack_scope,
                updated_at = NOW()
            ",
        )
        .bind(&credential.user_id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(credential.expires_at)
        .bind(credential.last_refreshed)
        .bind(&credential.workspace_id)
        .bind(&credential.workspace_name)
        .bind(&credential.authed_user_id)
        .bind(&credential.bot_user_id)
        .bind(&credential.scope)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn load(&self, user_id: &UserId) -> Result<Option<SlackCredential>, RepositoryError> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r"
            SELECT
                user_id,
                slack_access_token,
                slack_refresh_token,
                slack_token_expires_at,
                slack_token_last_refreshed,
                slack_team_id,
                slack_team_name,
                slack_authed_user_id,
                slack_bot_user_id,
                slack_scope
            FROM users
            WHERE user_id = $1 AND slack_access_token IS NOT NULL
            ",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.open(&self.cipher)).transpose()
    }

    #[instrument(skip(self, update), fields(user_id = %user_id))]
    async fn update_tokens(
        &self,
        user_id: &UserId,
        update: &TokenUpdate,
    ) -> Result<bool, RepositoryError> {
        let access_token = self.seal(&update.access_token)?;
        let refresh_token = update
            .refresh_token
            .as_ref()
            .map(|t| self.seal(t))
            .transpose()?;

        let result = sqlx::query(
            r"
            UPDATE users
            SET
                slack_access_token = $2,
                slack_refresh_token = COALESCE($3, slack_refresh_token),
                slack_token_expires_at = $4,
                slack_token_last_refreshed = $5,
                updated_at = NOW()
            WHERE user_id = $1 AND slack_access_token IS NOT NULL
            ",
        )
        .bind(user_id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(update.expires_at)
        .bind(update.refreshed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_connected(&self) -> Result<Vec<UserId>, RepositoryError> {
        let ids = sqlx::query_scalar::<_, UserId>(
            r"
            SELECT user_id FROM users
            WHERE slack_access_token IS NOT NULL
            ORDER BY user_id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn clear(&self, user_id: &UserId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE users
            SET
                slack_access_token = NULL,
                slack_refresh_token = NULL,
                slack_token_expires_at = NULL,
                slack_token_last_refreshed = NULL,
                slack_team_id = NULL,
                slack_team_name = NULL,
                slack_authed_user_id = NULL,
                slack_bot_user_id = NULL,
                slack_scope = NULL,
                updated_at = NOW()
            WHERE user_id = $1 AND slack_access_token IS NOT NULL
            ",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
