//! Status enums for scheduled messages.
//!
//! ```text
//! scheduled -> confirmed
//! scheduled | confirmed -> sent | failed | cancelled
//! ```
//!
//! `sent`, `failed` and `cancelled` are terminal.

use serde::{Deserialize, Serialize};

/// Delivery status of a scheduled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "message_status", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Recorded and waiting for its scheduled time.
    #[default]
    Scheduled,
    /// Acknowledged by the user; still waiting for its scheduled time.
    Confirmed,
    /// Delivered to the chat platform.
    Sent,
    /// Delivery was attempted and failed.
    Failed,
    /// Withdrawn by the user before delivery.
    Cancelled,
}

impl MessageStatus {
    /// Whether a message in this status is still waiting to be delivered.
    #[must_use]
    pub const fn is_deliverable(self) -> bool {
        matches!(self, Self::Scheduled | Self::Confirmed)
    }

    /// Whether no further transitions are allowed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !self.is_deliverable()
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Scheduled, Self::Confirmed) => true,
            (Self::Scheduled | Self::Confirmed, Self::Sent | Self::Failed | Self::Cancelled) => {
                true
            }
            _ => false,
        }
    }

    /// Lowercase wire/database name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Confirmed => "confirmed",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "confirmed" => Ok(Self::Confirmed),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid message status: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [MessageStatus; 5] = [
        MessageStatus::Scheduled,
        MessageStatus::Confirmed,
        MessageStatus::Sent,
        MessageStatus::Failed,
        MessageStatus::Cancelled,
    ];

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(
                    !from.can_transition_to(to),
                    "{from} -> {to} should be rejected"
                );
            }
        }
    }

    #[test]
    fn test_confirm_only_from_scheduled() {
        assert!(MessageStatus::Scheduled.can_transition_to(MessageStatus::Confirmed));
        assert!(!MessageStatus::Confirmed.can_transition_to(MessageStatus::Confirmed));
    }

    #[test]
    fn test_cancel_from_pending_states() {
        assert!(MessageStatus::Scheduled.can_transition_to(MessageStatus::Cancelled));
        assert!(MessageStatus::Confirmed.can_transition_to(MessageStatus::Cancelled));
    }

    #[test]
    fn test_display_matches_from_str() {
        for status in ALL {
            assert_eq!(status.to_string().parse::<MessageStatus>(), Ok(status));
        }
        assert!("pending".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&MessageStatus::Cancelled).expect("serialize");
        assert_eq!(json, "\"cancelled\"");
    }
}
