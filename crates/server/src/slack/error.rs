//! Slack-related errors.

use thiserror::Error;

/// Errors that can occur when interacting with Slack.
#[derive(Debug, Error)]
pub enum SlackError {
    /// No usable response: connection failure, timeout, or non-JSON body.
    #[error("Slack request failed: {0}")]
    Transport(String),

    /// Response was JSON but not the expected shape.
    #[error("Slack response error: {0}")]
    Response(String),

    /// OAuth code exchange failed or returned an incomplete grant.
    #[error("Slack OAuth code exchange failed: {0}")]
    InvalidCode(String),

    /// Slack refused the refresh token.
    #[error("Slack rejected token refresh: {0}")]
    RefreshRejected(String),

    /// The bot could not join the channel after a `not_in_channel` error.
    #[error(
        "Could not join channel {channel} ({reason}). Add the app to the channel manually and try again."
    )]
    ChannelJoin { channel: String, reason: String },

    /// The token lacks a scope the method needs.
    #[error("Slack token is missing scope {needed} (granted: {provided})")]
    InsufficientScope { needed: String, provided: String },

    /// Slack returned `ok: false` with this error code.
    #[error("Slack API error: {code}")]
    PlatformRejected { code: String },

    /// Client could not be constructed.
    #[error("Slack configuration error: {0}")]
    Config(String),
}

impl SlackError {
    /// Slack's error code, if this error carries one.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::PlatformRejected { code } => Some(code),
            Self::InsufficientScope { .. } => Some("missing_scope"),
            _ => None,
        }
    }

    /// Whether the access token itself is no longer usable.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self.code(),
            Some("invalid_auth" | "token_revoked" | "token_expired" | "account_inactive")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_join_message_asks_for_manual_add() {
        let err = SlackError::ChannelJoin {
            channel: "G123".to_string(),
            reason: "method_not_supported_for_channel_type".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("G123"));
        assert!(message.contains("manually"));
    }

    #[test]
    fn test_auth_failure_codes() {
        let revoked = SlackError::PlatformRejected {
            code: "token_revoked".to_string(),
        };
        let archived = SlackError::PlatformRejected {
            code: "is_archived".to_string(),
        };
        assert!(revoked.is_auth_failure());
        assert!(!archived.is_auth_failure());
        assert!(!SlackError::Transport("timeout".to_string()).is_auth_failure());
    }
}
