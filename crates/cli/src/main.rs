//! slackpost CLI - Database migrations and token maintenance.
//!
//! # Usage
//!
//! ```bash
//! # Run database migrations
//! sp-cli migrate
//!
//! # Show token health across connected users
//! sp-cli tokens status
//!
//! # Migrate every legacy (non-rotating) token now
//! sp-cli tokens migrate
//!
//! # Run one token sweep (migrate legacy, refresh expiring)
//! sp-cli tokens sweep
//! ```
//!
//! # Commands
//!
//! - `migrate` - Run database migrations
//! - `tokens` - Inspect and maintain stored Slack tokens

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "sp-cli")]
#[command(author, version, about = "slackpost CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Inspect and maintain stored Slack tokens
    Tokens {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Show token health for every connected user
    Status,
    /// Exchange every legacy token for a rotating pair
    Migrate,
    /// Migrate legacy tokens and refresh tokens close to expiry
    Sweep,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate => commands::migrate::run().await?,
        Commands::Tokens { action } => match action {
            TokenAction::Status => commands::tokens::status().await?,
            TokenAction::Migrate => commands::tokens::migrate().await?,
            TokenAction::Sweep => commands::tokens::sweep().await?,
        },
    }
    Ok(())
}
