//! Application state shared across handlers.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::ServerConfig;
use crate::crypto::{CryptoError, TokenCipher};
use crate::db::{CredentialStore, PgCredentialStore, PgScheduledMessageStore, ScheduledMessageStore};
use crate::services::{DeliveryScheduler, MessagingService, TokenLifecycleManager};
use crate::slack::{OAuthState, SlackApi, SlackClient, SlackError};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: ServerConfig,
    pool: PgPool,
    tokens: Arc<TokenLifecycleManager>,
    scheduler: Arc<DeliveryScheduler>,
    messaging: MessagingService,
    oauth_state: OAuthState,
}

/// Errors building the production state.
#[derive(Debug, thiserror::Error)]
pub enum StateInitError {
    #[error("token cipher: {0}")]
    Cipher(#[from] CryptoError),
    #[error("Slack client: {0}")]
    Slack(#[from] SlackError),
}

impl AppState {
    /// Wire the production stores and Slack client.
    ///
    /// # Errors
    ///
    /// Returns `StateInitError` if the encryption key or Slack client
    /// configuration is unusable.
    pub fn from_config(config: ServerConfig, pool: PgPool) -> Result<Self, StateInitError> {
        let cipher = TokenCipher::from_config(&config.security)?;
        let credentials = Arc::new(PgCredentialStore::new(pool.clone(), cipher));
        let messages = Arc::new(PgScheduledMessageStore::new(pool.clone()));
        let slack = Arc::new(SlackClient::new(&config.slack)?);

        Ok(Self::new(config, pool, credentials, messages, slack))
    }

    /// Build state from explicit parts.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        pool: PgPool,
        credentials: Arc<dyn CredentialStore>,
        messages: Arc<dyn ScheduledMessageStore>,
        slack: Arc<dyn SlackApi>,
    ) -> Self {
        let tokens = Arc::new(TokenLifecycleManager::new(
            credentials,
            slack.clone(),
            &config.scheduler,
        ));
        let scheduler = Arc::new(DeliveryScheduler::new(
            messages.clone(),
            tokens.clone(),
            slack.clone(),
            config.scheduler.delivery_concurrency,
        ));
        let messaging = MessagingService::new(messages, tokens.clone(), slack, scheduler.clone());
        let oauth_state = OAuthState::new(config.security.state_signing_secret.clone());

        Self {
            inner: Arc::new(AppStateInner {
                config,
                pool,
                tokens,
                scheduler,
                messaging,
                oauth_state,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenLifecycleManager> {
        &self.inner.tokens
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<DeliveryScheduler> {
        &self.inner.scheduler
    }

    #[must_use]
    pub fn messaging(&self) -> &MessagingService {
        &self.inner.messaging
    }

    #[must_use]
    pub fn oauth_state(&self) -> &OAuthState {
        &self.inner.oauth_state
    }
}
