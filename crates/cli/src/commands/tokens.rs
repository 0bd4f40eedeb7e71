//! Token maintenance commands.
//!
//! Run the same operations as the `/api/admin/tokens` endpoints, directly
//! against the database and Slack. Requires the full server environment
//! (see `slackpost_server::config`).

use std::sync::Arc;

use slackpost_server::config::ServerConfig;
use slackpost_server::crypto::TokenCipher;
use slackpost_server::db::{self, PgCredentialStore};
use slackpost_server::services::TokenLifecycleManager;
use slackpost_server::slack::SlackClient;

async fn manager() -> Result<TokenLifecycleManager, Box<dyn std::error::Error>> {
    let config = ServerConfig::from_env()?;
    let pool = db::create_pool(&config.database_url).await?;
    let cipher = TokenCipher::from_config(&config.security)?;
    let slack = SlackClient::new(&config.slack)?;

    Ok(TokenLifecycleManager::new(
        Arc::new(PgCredentialStore::new(pool, cipher)),
        Arc::new(slack),
        &config.scheduler,
    ))
}

#[allow(clippy::print_stdout)]
fn print_json(value: &impl serde::Serialize) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print token health for every connected user.
///
/// # Errors
///
/// Returns an error if configuration, the database or the listing fails.
pub async fn status() -> Result<(), Box<dyn std::error::Error>> {
    let report = manager().await?.token_status().await?;
    tracing::info!(
        total = report.total,
        legacy = report.legacy,
        expired = report.expired,
        "Token status loaded"
    );
    print_json(&report)?;
    Ok(())
}

/// Migrate every legacy token.
///
/// # Errors
///
/// Returns an error if configuration, the database or the listing fails.
/// Per-user failures are counted in the printed report.
pub async fn migrate() -> Result<(), Box<dyn std::error::Error>> {
    let report = manager().await?.force_migration().await?;
    print_json(&report)?;
    Ok(())
}

/// Run one sweep.
///
/// # Errors
///
/// Returns an error if configuration, the database or the listing fails.
pub async fn sweep() -> Result<(), Box<dyn std::error::Error>> {
    let report = manager().await?.sweep().await?;
    print_json(&report)?;
    Ok(())
}
