//! Database operations for the service `PostgreSQL` database.
//!
//! ## Tables
//!
//! - `users` - One row per identity-provider user, carrying the sealed Slack credential
//! - `scheduled_messages` - Delivery intents and their status history
//!
//! # Migrations
//!
//! Migrations are stored in `crates/server/migrations/` and run via:
//! ```bash
//! cargo run -p slackpost-cli -- migrate
//! ```

pub mod credentials;
pub mod scheduled_messages;

use std::time::Duration;

use secrecy::ExposeSecret;
use slackpost_core::MessageStatus;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

pub use credentials::{CredentialStore, PgCredentialStore, SlackCredential, TokenUpdate};
pub use scheduled_messages::{
    NewScheduledMessage, PgScheduledMessageStore, ScheduledMessage, ScheduledMessageStore,
};

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,

    /// The record exists but its status does not allow the transition.
    #[error("invalid state: message is {current}")]
    InvalidState { current: MessageStatus },
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}
