//! Delivery of scheduled messages.
//!
//! One loop task drives [`DeliveryScheduler::run_due`] on a fixed interval
//! and whenever [`DeliveryScheduler::trigger`] is called, so runs never
//! overlap within a process. Across replicas the store's compare-and-set
//! transitions decide which worker records the outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use slackpost_core::ScheduledMessageId;
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{RepositoryError, ScheduledMessage, ScheduledMessageStore};
use crate::services::TokenLifecycleManager;
use crate::slack::SlackApi;

/// Upper bound on messages picked up by one run.
const BATCH_SIZE: i64 = 500;

/// Attempts at recording a post Slack already accepted.
const RECORD_ATTEMPTS: u32 = 3;

/// Backoff step between recording attempts, multiplied by the attempt number.
const RECORD_BACKOFF: Duration = Duration::from_millis(50);

/// Outcome counts of one delivery run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub due: usize,
    pub sent: usize,
    pub failed: usize,
    /// Cancelled, already delivered, unreadable when re-checked, or posted
    /// by an earlier run whose store write is only now completed.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Sent,
    Failed,
    Skipped,
}

/// Posts due messages with their owner's Slack token.
pub struct DeliveryScheduler {
    messages: Arc<dyn ScheduledMessageStore>,
    tokens: Arc<TokenLifecycleManager>,
    slack: Arc<dyn SlackApi>,
    concurrency: usize,
    wake: Notify,
    /// Posted messages whose `sent` status could not be stored, by Slack `ts`.
    /// These are never posted again; later runs only retry the store write.
    unrecorded: Mutex<HashMap<ScheduledMessageId, String>>,
}

impl std::fmt::Debug for DeliveryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryScheduler")
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl DeliveryScheduler {
    #[must_use]
    pub fn new(
        messages: Arc<dyn ScheduledMessageStore>,
        tokens: Arc<TokenLifecycleManager>,
        slack: Arc<dyn SlackApi>,
        concurrency: usize,
    ) -> Self {
        Self {
            messages,
            tokens,
            slack,
            concurrency: concurrency.max(1),
            wake: Notify::new(),
            unrecorded: Mutex::new(HashMap::new()),
        }
    }

    /// Request a run as soon as the loop is free.
    ///
    /// Triggers that arrive while a run is in progress collapse into one
    /// follow-up run.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Deliver every message due at `now`.
    ///
    /// Each message is handled independently: a failure is recorded on that
    /// message and never aborts the run. Failed messages are not retried.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError` only if the due messages cannot be fetched.
    #[instrument(skip(self))]
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<DeliveryReport, RepositoryError> {
        let due = self.messages.due_messages(now, BATCH_SIZE).await?;
        let mut report = DeliveryReport {
            due: due.len(),
            ..DeliveryReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<Outcome> = futures::stream::iter(due)
            .map(|message| self.deliver(message))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Outcome::Sent => report.sent += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Skipped => report.skipped += 1,
            }
        }

        info!(
            due = report.due,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            "Delivery run complete"
        );
        Ok(report)
    }

    #[instrument(skip(self, message), fields(message_id = %message.id, user_id = %message.user_id, channel = %message.channel_id))]
    async fn deliver(&self, message: ScheduledMessage) -> Outcome {
        let unrecorded_ts = self.unrecorded.lock().await.get(&message.id).cloned();
        if let Some(ts) = unrecorded_ts {
            return self.finish_unrecorded(message.id, &ts).await;
        }

        // Cancelled or delivered since the due query ran.
        match self.messages.get(message.id).await {
            Ok(Some(current)) if current.status.is_deliverable() => {}
            Ok(_) => {
                debug!("Message no longer due, skipping");
                return Outcome::Skipped;
            }
            Err(e) => {
                warn!(error = %e, "Could not re-check message status, leaving for next run");
                return Outcome::Skipped;
            }
        }

        let token = match self.tokens.get_valid_access_token(&message.user_id).await {
            Ok(token) => token,
            Err(e) => return self.fail(&message, &e.to_string()).await,
        };

        match self
            .slack
            .post_message(&token, &message.channel_id, &message.message)
            .await
        {
            Ok(posted) => {
                match self.record_sent(message.id, &posted.ts).await {
                    Ok(()) => {}
                    Err(RepositoryError::InvalidState { current }) => {
                        warn!(%current, slack_ts = %posted.ts, "Message changed state while posting");
                    }
                    Err(e) => {
                        error!(error = %e, slack_ts = %posted.ts, "Message posted but not recorded as sent");
                        self.unrecorded
                            .lock()
                            .await
                            .insert(message.id, posted.ts.clone());
                    }
                }
                info!(slack_ts = %posted.ts, "Scheduled message delivered");
                Outcome::Sent
            }
            Err(e) => self.fail(&message, &e.to_string()).await,
        }
    }

    /// Store `sent`, retrying storage errors with a short backoff.
    async fn record_sent(&self, id: ScheduledMessageId, ts: &str) -> Result<(), RepositoryError> {
        let mut attempt = 1;
        loop {
            match self.messages.mark_sent(id, ts).await {
                Ok(_) => return Ok(()),
                Err(RepositoryError::Database(e)) if attempt < RECORD_ATTEMPTS => {
                    warn!(attempt, error = %e, "Recording sent message failed, retrying");
                    tokio::time::sleep(RECORD_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Complete the store write for a message an earlier run already posted.
    async fn finish_unrecorded(&self, id: ScheduledMessageId, ts: &str) -> Outcome {
        match self.record_sent(id, ts).await {
            Ok(()) => info!(slack_ts = ts, "Earlier post recorded as sent"),
            Err(RepositoryError::InvalidState { current }) => {
                warn!(%current, slack_ts = ts, "Earlier post superseded by a state change");
            }
            Err(RepositoryError::NotFound) => {
                warn!(slack_ts = ts, "Earlier post belongs to a deleted message");
            }
            Err(e) => {
                error!(error = %e, slack_ts = ts, "Earlier post still not recorded");
                return Outcome::Skipped;
            }
        }
        self.unrecorded.lock().await.remove(&id);
        Outcome::Skipped
    }

    async fn fail(&self, message: &ScheduledMessage, reason: &str) -> Outcome {
        warn!(error = reason, "Scheduled message delivery failed");
        match self.messages.mark_failed(message.id, reason).await {
            Ok(_) => Outcome::Failed,
            Err(RepositoryError::InvalidState { current }) => {
                debug!(%current, "Message changed state during delivery");
                Outcome::Skipped
            }
            Err(e) => {
                error!(error = %e, "Could not record delivery failure");
                Outcome::Failed
            }
        }
    }

    /// Run deliveries every `interval` and on each trigger until `shutdown`
    /// is cancelled. The first run happens immediately.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs(), "Delivery scheduler started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                () = self.wake.notified() => {}
            }

            if let Err(e) = self.run_due(Utc::now()).await {
                error!(error = %e, "Delivery run failed");
            }
        }
        info!("Delivery scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::db::NewScheduledMessage;
    use crate::test_support::{
        InMemoryCredentialStore, InMemoryScheduledMessageStore, StubSlack, rotating_credential,
        user,
    };
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use slackpost_core::{MessageStatus, UserId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Message store whose `mark_sent` fails with a pool timeout a set
    /// number of times before it starts working.
    struct FlakyMarkSent {
        inner: Arc<InMemoryScheduledMessageStore>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl ScheduledMessageStore for FlakyMarkSent {
        async fn create(&self, new: NewScheduledMessage) -> Result<ScheduledMessage, RepositoryError> {
            self.inner.create(new).await
        }

        async fn get(
            &self,
            id: ScheduledMessageId,
        ) -> Result<Option<ScheduledMessage>, RepositoryError> {
            self.inner.get(id).await
        }

        async fn confirm(&self, id: ScheduledMessageId) -> Result<ScheduledMessage, RepositoryError> {
            self.inner.confirm(id).await
        }

        async fn mark_sent(
            &self,
            id: ScheduledMessageId,
            slack_ts: &str,
        ) -> Result<ScheduledMessage, RepositoryError> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.mark_sent(id, slack_ts).await
        }

        async fn mark_failed(
            &self,
            id: ScheduledMessageId,
            error: &str,
        ) -> Result<ScheduledMessage, RepositoryError> {
            self.inner.mark_failed(id, error).await
        }

        async fn cancel(&self, id: ScheduledMessageId) -> Result<ScheduledMessage, RepositoryError> {
            self.inner.cancel(id).await
        }

        async fn due_messages(
            &self,
            now: DateTime<Utc>,
            limit: i64,
        ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
            self.inner.due_messages(now, limit).await
        }

        async fn list_for_user(
            &self,
            user_id: &UserId,
            limit: i64,
        ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
            self.inner.list_for_user(user_id, limit).await
        }
    }

    /// Scheduler over a store that fails `mark_sent` `failures` times.
    fn flaky_harness(failures: usize) -> Harness {
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let messages = Arc::new(InMemoryScheduledMessageStore::new());
        let slack = Arc::new(StubSlack::new());
        let tokens = Arc::new(TokenLifecycleManager::new(
            credentials.clone(),
            slack.clone(),
            &SchedulerConfig::default(),
        ));
        let flaky = Arc::new(FlakyMarkSent {
            inner: messages.clone(),
            failures_left: AtomicUsize::new(failures),
        });
        let scheduler = Arc::new(DeliveryScheduler::new(flaky, tokens, slack.clone(), 4));
        Harness {
            credentials,
            messages,
            slack,
            scheduler,
        }
    }

    struct Harness {
        credentials: Arc<InMemoryCredentialStore>,
        messages: Arc<InMemoryScheduledMessageStore>,
        slack: Arc<StubSlack>,
        scheduler: Arc<DeliveryScheduler>,
    }

    fn harness(slack: StubSlack) -> Harness {
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let messages = Arc::new(InMemoryScheduledMessageStore::new());
        let slack = Arc::new(slack);
        let tokens = Arc::new(TokenLifecycleManager::new(
            credentials.clone(),
            slack.clone(),
            &SchedulerConfig::default(),
        ));
        let scheduler = Arc::new(DeliveryScheduler::new(
            messages.clone(),
            tokens,
            slack.clone(),
            4,
        ));
        Harness {
            credentials,
            messages,
            slack,
            scheduler,
        }
    }

    async fn schedule(
        messages: &InMemoryScheduledMessageStore,
        user_id: &UserId,
        channel: &str,
        at: DateTime<Utc>,
    ) -> ScheduledMessage {
        messages
            .create(NewScheduledMessage {
                user_id: user_id.clone(),
                channel_id: channel.to_string(),
                message: "deploy at noon".to_string(),
                scheduled_time: at,
            })
            .await
            .expect("create")
    }

    #[tokio::test]
    async fn test_due_message_is_sent_with_ts() {
        let h = harness(StubSlack::new());
        let alice = user("alice");
        h.credentials
            .insert(rotating_credential(&alice, Utc::now() + ChronoDuration::hours(6)))
            .await;
        let message = schedule(&h.messages, &alice, "C0001", Utc::now() - ChronoDuration::minutes(1)).await;

        let report = h.scheduler.run_due(Utc::now()).await.expect("run");

        assert_eq!(report.due, 1);
        assert_eq!(report.sent, 1);
        let stored = h.messages.get(message.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, MessageStatus::Sent);
        assert!(stored.slack_ts.is_some());
        assert!(stored.sent_at.is_some());
    }

    #[tokio::test]
    async fn test_future_message_is_left_alone() {
        let h = harness(StubSlack::new());
        let alice = user("alice");
        h.credentials
            .insert(rotating_credential(&alice, Utc::now() + ChronoDuration::hours(6)))
            .await;
        let message = schedule(&h.messages, &alice, "C0001", Utc::now() + ChronoDuration::hours(1)).await;

        let report = h.scheduler.run_due(Utc::now()).await.expect("run");

        assert_eq!(report, DeliveryReport::default());
        let stored = h.messages.get(message.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, MessageStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let h = harness(StubSlack::new().failing_channel("C_ARCHIVED", "is_archived"));
        let alice = user("alice");
        h.credentials
            .insert(rotating_credential(&alice, Utc::now() + ChronoDuration::hours(6)))
            .await;
        let past = Utc::now() - ChronoDuration::minutes(1);
        let bad = schedule(&h.messages, &alice, "C_ARCHIVED", past).await;
        let good = schedule(&h.messages, &alice, "C0001", past).await;

        let report = h.scheduler.run_due(Utc::now()).await.expect("run");

        assert_eq!(report.sent, 1);
        assert_eq!(report.failed, 1);
        let bad = h.messages.get(bad.id).await.expect("get").expect("exists");
        assert_eq!(bad.status, MessageStatus::Failed);
        assert!(bad.error.as_deref().is_some_and(|e| e.contains("is_archived")));
        let good = h.messages.get(good.id).await.expect("get").expect("exists");
        assert_eq!(good.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_missing_credential_fails_message() {
        let h = harness(StubSlack::new());
        let message = schedule(&h.messages, &user("ghost"), "C0001", Utc::now()).await;

        let report = h.scheduler.run_due(Utc::now()).await.expect("run");

        assert_eq!(report.failed, 1);
        let stored = h.messages.get(message.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, MessageStatus::Failed);
        assert!(h.slack.posts().await.is_empty());
    }

    #[tokio::test]
    async fn test_transient_record_failure_is_retried() {
        let h = flaky_harness(1);
        let alice = user("alice");
        h.credentials
            .insert(rotating_credential(&alice, Utc::now() + ChronoDuration::hours(6)))
            .await;
        let message = schedule(&h.messages, &alice, "C0001", Utc::now() - ChronoDuration::minutes(1)).await;

        let report = h.scheduler.run_due(Utc::now()).await.expect("run");

        assert_eq!(report.sent, 1);
        let stored = h.messages.get(message.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(h.slack.posts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unrecorded_post_is_never_posted_again() {
        let h = flaky_harness(RECORD_ATTEMPTS as usize);
        let alice = user("alice");
        h.credentials
            .insert(rotating_credential(&alice, Utc::now() + ChronoDuration::hours(6)))
            .await;
        let message = schedule(&h.messages, &alice, "C0001", Utc::now() - ChronoDuration::minutes(1)).await;

        let first = h.scheduler.run_due(Utc::now()).await.expect("run");
        assert_eq!(first.sent, 1);
        let stored = h.messages.get(message.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, MessageStatus::Scheduled);

        let second = h.scheduler.run_due(Utc::now()).await.expect("run");
        assert_eq!(second.due, 1);
        assert_eq!(second.sent, 0);
        assert_eq!(second.skipped, 1);

        assert_eq!(h.slack.posts().await.len(), 1, "message posted more than once");
        let stored = h.messages.get(message.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, MessageStatus::Sent);
        assert!(stored.slack_ts.is_some());

        let third = h.scheduler.run_due(Utc::now()).await.expect("run");
        assert_eq!(third.due, 0);
    }

    #[tokio::test]
    async fn test_trigger_wakes_loop() {
        let h = harness(StubSlack::new());
        let alice = user("alice");
        h.credentials
            .insert(rotating_credential(&alice, Utc::now() + ChronoDuration::hours(6)))
            .await;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            h.scheduler
                .clone()
                .run(Duration::from_secs(3600), shutdown.clone()),
        );
        // Let the immediate first tick pass on an empty store.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let message = schedule(&h.messages, &alice, "C0001", Utc::now()).await;
        h.scheduler.trigger();

        let mut delivered = false;
        for _ in 0..50 {
            let stored = h.messages.get(message.id).await.expect("get").expect("exists");
            if stored.status == MessageStatus::Sent {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        task.await.expect("join");

        assert!(delivered);
    }
}
