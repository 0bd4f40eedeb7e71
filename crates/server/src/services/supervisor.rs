//! Background loops owned by the server process.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::SchedulerConfig;
use crate::services::{DeliveryScheduler, TokenLifecycleManager};

/// Handle to the delivery loop and the token sweep loop.
///
/// Dropping the handle does not stop the loops; call [`Self::shutdown`].
#[derive(Debug)]
pub struct BackgroundTasks {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Spawn both loops. The sweep runs once immediately and then every
    /// `config.sweep_interval`.
    #[must_use]
    pub fn spawn(
        scheduler: Arc<DeliveryScheduler>,
        tokens: Arc<TokenLifecycleManager>,
        config: &SchedulerConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();

        let delivery = tokio::spawn(scheduler.run(config.poll_interval, shutdown.clone()));
        let sweep = tokio::spawn(run_sweeps(tokens, config.sweep_interval, shutdown.clone()));

        Self {
            shutdown,
            handles: vec![delivery, sweep],
        }
    }

    /// Stop both loops and wait for them to finish their current run.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background task panicked");
            }
        }
        info!("Background tasks stopped");
    }
}

async fn run_sweeps(
    tokens: Arc<TokenLifecycleManager>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_secs = interval.as_secs(), "Token sweep started");
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = tokens.sweep().await {
            error!(error = %e, "Token sweep failed");
        }
    }
    info!("Token sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        InMemoryCredentialStore, InMemoryScheduledMessageStore, StubSlack, legacy_credential, user,
    };

    #[tokio::test]
    async fn test_sweep_runs_at_start_and_stops_on_shutdown() {
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let slack = Arc::new(StubSlack::new());
        let alice = user("alice");
        credentials.insert(legacy_credential(&alice)).await;

        let config = SchedulerConfig {
            poll_interval: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(3600),
            ..SchedulerConfig::default()
        };
        let tokens = Arc::new(TokenLifecycleManager::new(
            credentials.clone(),
            slack.clone(),
            &config,
        ));
        let scheduler = Arc::new(DeliveryScheduler::new(
            Arc::new(InMemoryScheduledMessageStore::new()),
            tokens.clone(),
            slack.clone(),
            1,
        ));

        let tasks = BackgroundTasks::spawn(scheduler, tokens, &config);
        for _ in 0..50 {
            if slack.legacy_exchange_calls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::timeout(Duration::from_secs(1), tasks.shutdown())
            .await
            .expect("shutdown completes");

        assert_eq!(slack.legacy_exchange_calls(), 1);
        let stored = credentials.get(&alice).await.expect("stored");
        assert!(!stored.is_legacy());
    }
}
