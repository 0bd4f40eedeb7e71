//! Database operations for scheduled messages.
//!
//! Every status change is a compare-and-set on the current status, so two
//! workers racing on the same row cannot both deliver or both cancel it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slackpost_core::{MessageStatus, ScheduledMessageId, UserId};
use sqlx::PgPool;
use tracing::instrument;

use super::RepositoryError;

/// Columns selected for every `ScheduledMessage` query.
const COLUMNS: &str = "id, user_id, channel_id, message, scheduled_time, status, slack_ts, \
                       error, sent_at, cancelled_at, created_at, updated_at";

/// A persisted intent to post a message at a given time.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ScheduledMessage {
    pub id: ScheduledMessageId,
    pub user_id: UserId,
    pub channel_id: String,
    pub message: String,
    pub scheduled_time: DateTime<Utc>,
    pub status: MessageStatus,
    /// Slack timestamp of the delivered message.
    pub slack_ts: Option<String>,
    /// Human-readable delivery failure.
    pub error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledMessage {
    /// Whether the scheduler should deliver this message at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_deliverable() && self.scheduled_time <= now
    }
}

/// Parameters for creating a scheduled message.
#[derive(Debug, Clone)]
pub struct NewScheduledMessage {
    pub user_id: UserId,
    pub channel_id: String,
    pub message: String,
    pub scheduled_time: DateTime<Utc>,
}

/// Persistence for scheduled messages and their state machine.
///
/// Transition methods fail with [`RepositoryError::NotFound`] for unknown IDs
/// and [`RepositoryError::InvalidState`] when the current status forbids the
/// move; in both cases nothing is written.
#[async_trait]
pub trait ScheduledMessageStore: Send + Sync {
    /// Record a new intent with status `scheduled`. Any timestamp is accepted.
    async fn create(&self, new: NewScheduledMessage) -> Result<ScheduledMessage, RepositoryError>;

    async fn get(&self, id: ScheduledMessageId)
    -> Result<Option<ScheduledMessage>, RepositoryError>;

    /// `scheduled -> confirmed`.
    async fn confirm(&self, id: ScheduledMessageId) -> Result<ScheduledMessage, RepositoryError>;

    /// `scheduled | confirmed -> sent`.
    async fn mark_sent(
        &self,
        id: ScheduledMessageId,
        slack_ts: &str,
    ) -> Result<ScheduledMessage, RepositoryError>;

    /// `scheduled | confirmed -> failed`.
    async fn mark_failed(
        &self,
        id: ScheduledMessageId,
        error: &str,
    ) -> Result<ScheduledMessage, RepositoryError>;

    /// `scheduled | confirmed -> cancelled`.
    async fn cancel(&self, id: ScheduledMessageId) -> Result<ScheduledMessage, RepositoryError>;

    /// Pending messages whose time has come, oldest first.
    async fn due_messages(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError>;

    /// A user's messages, latest scheduled time first.
    async fn list_for_user(
        &self,
        user_id: &UserId,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError>;
}

/// `PostgreSQL` scheduled message store.
#[derive(Debug, Clone)]
pub struct PgScheduledMessageStore {
    pool: PgPool,
}

impl PgScheduledMessageStore {
    /// Create a new scheduled message store.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a compare-and-set update matched no row.
    async fn transition_miss(&self, id: ScheduledMessageId) -> RepositoryError {
        match self.get(id).await {
            Ok(Some(existing)) => RepositoryError::InvalidState {
                current: existing.status,
            },
            Ok(None) => RepositoryError::NotFound,
            Err(e) => e,
        }
    }
}

#[async_trait]
impl ScheduledMessageStore for PgScheduledMessageStore {
    #[instrument(skip(self, new), fields(user_id = %new.user_id, channel = %new.channel_id))]
    async fn create(&self, new: NewScheduledMessage) -> Result<ScheduledMessage, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // Users who schedule before connecting Slack still need an owning row.
        sqlx::query("INSERT INTO users (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(&new.user_id)
            .execute(&mut *tx)
            .await?;

        let message = sqlx::query_as::<_, ScheduledMessage>(&format!(
            r"
            INSERT INTO scheduled_messages (id, user_id, channel_id, message, scheduled_time, status)
            VALUES ($1, $2, $3, $4, $5, 'scheduled')
            RETURNING {COLUMNS}
            "
        ))
        .bind(ScheduledMessageId::generate())
        .bind(&new.user_id)
        .bind(&new.channel_id)
        .bind(&new.message)
        .bind(new.scheduled_time)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message)
    }

    async fn get(
        &self,
        id: ScheduledMessageId,
    ) -> Result<Option<ScheduledMessage>, RepositoryError> {
        let message = sqlx::query_as::<_, ScheduledMessage>(&format!(
            "SELECT {COLUMNS} FROM scheduled_messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(message)
    }

    #[instrument(skip(self), fields(message_id = %id))]
    async fn confirm(&self, id: ScheduledMessageId) -> Result<ScheduledMessage, RepositoryError> {
        let updated = sqlx::query_as::<_, ScheduledMessage>(&format!(
            r"
            UPDATE scheduled_messages
            SET status = 'confirmed', updated_at = NOW()
            WHERE id = $1 AND status = 'scheduled'
            RETURNING {COLUMNS}
            "
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(message) => Ok(message),
            None => Err(self.transition_miss(id).await),
        }
    }

    #[instrument(skip(self), fields(message_id = %id))]
    async fn mark_sent(
        &self,
        id: ScheduledMessageId,
        slack_ts: &str,
    ) -> Result<ScheduledMessage, RepositoryError> {
        let updated = sqlx::query_as::<_, ScheduledMessage>(&format!(
            r"
            UPDATE scheduled_messages
            SET status = 'sent', slack_ts = $2, sent_at = NOW(), error = NULL, updated_at = NOW()
            WHERE id = $1 AND status IN ('scheduled', 'confirmed')
            RETURNING {COLUMNS}
            "
        ))
        .bind(id)
        .bind(slack_ts)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(message) => Ok(message),
            None => Err(self.transition_miss(id).await),
        }
    }

    #[instrument(skip(self, error), fields(message_id = %id))]
    async fn mark_failed(
        &self,
        id: ScheduledMessageId,
        error: &str,
    ) -> Result<ScheduledMessage, RepositoryError> {
        let updated = sqlx::query_as::<_, ScheduledMessage>(&format!(
            r"
            UPDATE scheduled_messages
            SET status = 'failed', error = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('scheduled', 'confirmed')
            RETURNING {COLUMNS}
            "
        ))
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(message) => Ok(message),
            None => Err(self.transition_miss(id).await),
        }
    }

    #[instrument(skip(self), fields(message_id = %id))]
    async fn cancel(&self, id: ScheduledMessageId) -> Result<ScheduledMessage, RepositoryError> {
        let updated = sqlx::query_as::<_, ScheduledMessage>(&format!(
            r"
            UPDATE scheduled_messages
            SET status = 'cancelled', cancelled_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('scheduled', 'confirmed')
            RETURNING {COLUMNS}
            "
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(message) => Ok(message),
            None => Err(self.transition_miss(id).await),
        }
    }

    async fn due_messages(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        let messages = sqlx::query_as::<_, ScheduledMessage>(&format!(
            r"
            SELECT {COLUMNS}
            FROM scheduled_messages
            WHERE status IN ('scheduled', 'confirmed') AND scheduled_time <= $1
            ORDER BY scheduled_time ASC
            LIMIT $2
            "
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        let messages = sqlx::query_as::<_, ScheduledMessage>(&format!(
            r"
            SELECT {COLUMNS}
            FROM scheduled_messages
            WHERE user_id = $1
            ORDER BY scheduled_time DESC
            LIMIT $2
            "
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(status: MessageStatus, scheduled_time: DateTime<Utc>) -> ScheduledMessage {
        let now = Utc::now();
        ScheduledMessage {
            id: ScheduledMessageId::generate(),
            user_id: UserId::parse("user-1").expect("valid id"),
            channel_id: "C123".to_string(),
            message: "standup in 5".to_string(),
            scheduled_time,
            status,
            slack_ts: None,
            error: None,
            sent_at: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_is_due_requires_pending_status() {
        let now = Utc::now();
        let past = now - Duration::minutes(1);

        assert!(message(MessageStatus::Scheduled, past).is_due(now));
        assert!(message(MessageStatus::Confirmed, past).is_due(now));
        assert!(!message(MessageStatus::Sent, past).is_due(now));
        assert!(!message(MessageStatus::Cancelled, past).is_due(now));
        assert!(!message(MessageStatus::Failed, past).is_due(now));
    }

    #[test]
    fn test_is_due_at_exact_time() {
        let now = Utc::now();
        assert!(message(MessageStatus::Scheduled, now).is_due(now));
        assert!(!message(MessageStatus::Scheduled, now + Duration::seconds(1)).is_due(now));
    }

    #[test]
    fn test_serializes_status_lowercase() {
        let json = serde_json::to_value(message(MessageStatus::Confirmed, Utc::now()).status)
            .expect("serialize");
        assert_eq!(json, "confirmed");
    }
}
