//! User-facing messaging operations.
//!
//! Every operation acts on behalf of one authenticated user: messages are
//! looked up by ID and then checked for ownership, and Slack calls use that
//! user's own token.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use slackpost_core::{ScheduledMessageId, UserId};
use tracing::{info, instrument};

use crate::db::{NewScheduledMessage, ScheduledMessage, ScheduledMessageStore};
use crate::error::AppError;
use crate::services::{DeliveryScheduler, TokenLifecycleManager};
use crate::slack::{Channel, PostedMessage, SlackApi, SlackUser};

/// Slack rejects message text longer than this.
const MAX_MESSAGE_CHARS: usize = 40_000;

/// Messages returned by [`MessagingService::list_messages`].
const LIST_LIMIT: i64 = 200;

/// Scheduling, cancellation, immediate sends and Slack lookups.
pub struct MessagingService {
    messages: Arc<dyn ScheduledMessageStore>,
    tokens: Arc<TokenLifecycleManager>,
    slack: Arc<dyn SlackApi>,
    scheduler: Arc<DeliveryScheduler>,
}

impl std::fmt::Debug for MessagingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingService").finish_non_exhaustive()
    }
}

impl MessagingService {
    #[must_use]
    pub fn new(
        messages: Arc<dyn ScheduledMessageStore>,
        tokens: Arc<TokenLifecycleManager>,
        slack: Arc<dyn SlackApi>,
        scheduler: Arc<DeliveryScheduler>,
    ) -> Self {
        Self {
            messages,
            tokens,
            slack,
            scheduler,
        }
    }

    /// Schedule `message` for `channel_id` at an RFC 3339 time.
    ///
    /// Past and present times are accepted and delivered on the next run,
    /// which is triggered immediately.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BadRequest` for an empty channel or message, an
    /// oversized message, or an unparseable time.
    #[instrument(skip(self, message), fields(user_id = %user_id, channel = %channel_id))]
    pub async fn schedule_message(
        &self,
        user_id: &UserId,
        channel_id: &str,
        message: &str,
        scheduled_time: &str,
    ) -> Result<ScheduledMessage, AppError> {
        let channel_id = validate_channel(channel_id)?;
        let message = validate_text(message)?;
        let scheduled_time = DateTime::parse_from_rfc3339(scheduled_time.trim())
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| AppError::BadRequest(format!("scheduledTime is not RFC 3339: {e}")))?;

        let created = self
            .messages
            .create(NewScheduledMessage {
                user_id: user_id.clone(),
                channel_id: channel_id.to_string(),
                message: message.to_string(),
                scheduled_time,
            })
            .await?;

        info!(message_id = %created.id, scheduled_time = %created.scheduled_time, "Message scheduled");
        if created.scheduled_time <= Utc::now() {
            self.scheduler.trigger();
        }
        Ok(created)
    }

    async fn owned(
        &self,
        user_id: &UserId,
        id: ScheduledMessageId,
    ) -> Result<ScheduledMessage, AppError> {
        match self.messages.get(id).await? {
            Some(message) if &message.user_id == user_id => Ok(message),
            // Someone else's message is reported as missing.
            _ => Err(AppError::NotFound(format!("scheduled message {id}"))),
        }
    }

    /// Cancel a pending message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the message does not exist or belongs
    /// to another user, and an invalid-state error if it is no longer pending.
    #[instrument(skip(self), fields(user_id = %user_id, message_id = %id))]
    pub async fn cancel_message(
        &self,
        user_id: &UserId,
        id: ScheduledMessageId,
    ) -> Result<ScheduledMessage, AppError> {
        self.owned(user_id, id).await?;
        let cancelled = self.messages.cancel(id).await?;
        info!("Message cancelled");
        Ok(cancelled)
    }

    /// Confirm a scheduled message.
    ///
    /// # Errors
    ///
    /// Same as [`Self::cancel_message`].
    #[instrument(skip(self), fields(user_id = %user_id, message_id = %id))]
    pub async fn confirm_message(
        &self,
        user_id: &UserId,
        id: ScheduledMessageId,
    ) -> Result<ScheduledMessage, AppError> {
        self.owned(user_id, id).await?;
        Ok(self.messages.confirm(id).await?)
    }

    /// The user's messages, latest scheduled time first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Database` if the store is unavailable.
    pub async fn list_messages(&self, user_id: &UserId) -> Result<Vec<ScheduledMessage>, AppError> {
        Ok(self.messages.list_for_user(user_id, LIST_LIMIT).await?)
    }

    /// Post `message` to `channel_id` now, bypassing the schedule.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BadRequest` for invalid input, a token error if the
    /// user has no usable credential, and a Slack error if posting fails.
    #[instrument(skip(self, message), fields(user_id = %user_id, channel = %channel_id))]
    pub async fn send_immediate(
        &self,
        user_id: &UserId,
        channel_id: &str,
        message: &str,
    ) -> Result<PostedMessage, AppError> {
        let channel_id = validate_channel(channel_id)?;
        let message = validate_text(message)?;

        let token = self.tokens.get_valid_access_token(user_id).await?;
        let posted = self.slack.post_message(&token, channel_id, message).await?;
        info!(slack_ts = %posted.ts, "Message sent");
        Ok(posted)
    }

    /// Channels visible to the user's token.
    ///
    /// # Errors
    ///
    /// Returns a token error or a Slack error (including missing scopes).
    pub async fn list_channels(&self, user_id: &UserId) -> Result<Vec<Channel>, AppError> {
        let token = self.tokens.get_valid_access_token(user_id).await?;
        Ok(self.slack.list_channels(&token).await?)
    }

    /// # Errors
    ///
    /// Returns a token error or a Slack error.
    pub async fn channel_info(&self, user_id: &UserId, channel_id: &str) -> Result<Channel, AppError> {
        let channel_id = validate_channel(channel_id)?;
        let token = self.tokens.get_valid_access_token(user_id).await?;
        Ok(self.slack.channel_info(&token, channel_id).await?)
    }

    /// # Errors
    ///
    /// Returns a token error or a Slack error.
    pub async fn channel_members(
        &self,
        user_id: &UserId,
        channel_id: &str,
    ) -> Result<Vec<String>, AppError> {
        let channel_id = validate_channel(channel_id)?;
        let token = self.tokens.get_valid_access_token(user_id).await?;
        Ok(self.slack.channel_members(&token, channel_id).await?)
    }

    /// # Errors
    ///
    /// Returns a token error or a Slack error.
    pub async fn list_users(&self, user_id: &UserId) -> Result<Vec<SlackUser>, AppError> {
        let token = self.tokens.get_valid_access_token(user_id).await?;
        Ok(self.slack.list_users(&token).await?)
    }
}

fn validate_channel(channel_id: &str) -> Result<&str, AppError> {
    let channel_id = channel_id.trim();
    if channel_id.is_empty() {
        return Err(AppError::BadRequest("channelId is required".to_string()));
    }
    Ok(channel_id)
}

fn validate_text(message: &str) -> Result<&str, AppError> {
    if message.trim().is_empty() {
        return Err(AppError::BadRequest("message must not be empty".to_string()));
    }
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(AppError::BadRequest(format!(
            "message exceeds {MAX_MESSAGE_CHARS} characters"
        )));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::db::RepositoryError;
    use crate::test_support::{
        InMemoryCredentialStore, InMemoryScheduledMessageStore, StubSlack, rotating_credential,
        user,
    };
    use chrono::Duration;
    use slackpost_core::MessageStatus;

    struct Harness {
        credentials: Arc<InMemoryCredentialStore>,
        messages: Arc<InMemoryScheduledMessageStore>,
        slack: Arc<StubSlack>,
        service: MessagingService,
    }

    fn harness() -> Harness {
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let messages = Arc::new(InMemoryScheduledMessageStore::new());
        let slack = Arc::new(StubSlack::new());
        let tokens = Arc::new(TokenLifecycleManager::new(
            credentials.clone(),
            slack.clone(),
            &SchedulerConfig::default(),
        ));
        let scheduler = Arc::new(DeliveryScheduler::new(
            messages.clone(),
            tokens.clone(),
            slack.clone(),
            2,
        ));
        let service = MessagingService::new(messages.clone(), tokens, slack.clone(), scheduler);
        Harness {
            credentials,
            messages,
            slack,
            service,
        }
    }

    #[tokio::test]
    async fn test_schedule_parses_offset_time() {
        let h = harness();
        let created = h
            .service
            .schedule_message(&user("alice"), "C0001", "hello", "2030-01-01T09:00:00+02:00")
            .await
            .expect("schedule");

        assert_eq!(created.status, MessageStatus::Scheduled);
        assert_eq!(created.scheduled_time.to_rfc3339(), "2030-01-01T07:00:00+00:00");
    }

    #[tokio::test]
    async fn test_schedule_rejects_bad_input() {
        let h = harness();
        let alice = user("alice");

        for (channel, text, time) in [
            ("C0001", "   ", "2030-01-01T09:00:00Z"),
            ("", "hello", "2030-01-01T09:00:00Z"),
            ("C0001", "hello", "tomorrow at nine"),
        ] {
            let result = h.service.schedule_message(&alice, channel, text, time).await;
            assert!(matches!(result, Err(AppError::BadRequest(_))), "{channel:?} {text:?} {time:?}");
        }
    }

    #[tokio::test]
    async fn test_cancel_other_users_message_is_not_found() {
        let h = harness();
        let created = h
            .service
            .schedule_message(&user("alice"), "C0001", "hello", "2030-01-01T09:00:00Z")
            .await
            .expect("schedule");

        let result = h.service.cancel_message(&user("mallory"), created.id).await;

        assert!(matches!(result, Err(AppError::NotFound(_))));
        let stored = h.messages.get(created.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, MessageStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_cancel_sent_message_is_invalid_state() {
        let h = harness();
        let alice = user("alice");
        let created = h
            .service
            .schedule_message(&alice, "C0001", "hello", "2030-01-01T09:00:00Z")
            .await
            .expect("schedule");
        h.messages
            .mark_sent(created.id, "1700000000.000001")
            .await
            .expect("mark sent");

        let result = h.service.cancel_message(&alice, created.id).await;

        assert!(matches!(
            result,
            Err(AppError::Database(RepositoryError::InvalidState {
                current: MessageStatus::Sent
            }))
        ));
    }

    #[tokio::test]
    async fn test_confirmed_message_can_be_cancelled() {
        let h = harness();
        let alice = user("alice");
        let created = h
            .service
            .schedule_message(&alice, "C0001", "hello", "2030-01-01T09:00:00Z")
            .await
            .expect("schedule");

        h.service.confirm_message(&alice, created.id).await.expect("confirm");
        let cancelled = h.service.cancel_message(&alice, created.id).await.expect("cancel");

        assert_eq!(cancelled.status, MessageStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
    }

    #[tokio::test]
    async fn test_send_immediate_uses_users_token() {
        let h = harness();
        let alice = user("alice");
        h.credentials
            .insert(rotating_credential(&alice, Utc::now() + Duration::hours(6)))
            .await;

        let posted = h
            .service
            .send_immediate(&alice, "C0001", "ship it")
            .await
            .expect("send");

        assert_eq!(posted.channel_id, "C0001");
        let posts = h.slack.posts().await;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].token, "xoxe.xoxp-initial");
        assert_eq!(posts[0].text, "ship it");
    }

    #[tokio::test]
    async fn test_send_immediate_without_connection() {
        let h = harness();

        let result = h.service.send_immediate(&user("alice"), "C0001", "hi").await;

        assert!(matches!(
            result,
            Err(AppError::Token(crate::services::TokenError::NoCredential))
        ));
    }
}
