//! Unified error handling for the HTTP API.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::db::RepositoryError;
use crate::services::TokenError;
use crate::slack::{SlackError, StateError};

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Database operation failed or a state transition was refused.
    #[error("Database error: {0}")]
    Database(#[from] RepositoryError),

    /// Slack API operation failed.
    #[error("Slack error: {0}")]
    Slack(#[from] SlackError),

    /// Credential could not be produced.
    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    /// OAuth callback state was rejected.
    #[error("Invalid OAuth state: {0}")]
    OAuthState(#[from] StateError),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller is not authenticated.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Bad request from client.
    #[error("Bad request: {0}")]
    BadRequest(String),

}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    needed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provided: Option<String>,
}

const INTERNAL_MESSAGE: &str = "Internal server error";

fn slack_status(err: &SlackError) -> (StatusCode, &'static str) {
    match err {
        SlackError::InvalidCode(_) => (StatusCode::BAD_REQUEST, "invalid_code"),
        SlackError::RefreshRejected(_) => (StatusCode::UNAUTHORIZED, "refresh_rejected"),
        SlackError::ChannelJoin { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "channel_join_failed"),
        SlackError::InsufficientScope { .. } => (StatusCode::FORBIDDEN, "insufficient_scope"),
        SlackError::PlatformRejected { .. } => (StatusCode::BAD_GATEWAY, "platform_rejected"),
        SlackError::Transport(_) => (StatusCode::GATEWAY_TIMEOUT, "platform_unavailable"),
        SlackError::Response(_) => (StatusCode::BAD_GATEWAY, "platform_response"),
        SlackError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

fn repository_status(err: &RepositoryError) -> (StatusCode, &'static str) {
    match err {
        RepositoryError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        RepositoryError::InvalidState { .. } => (StatusCode::CONFLICT, "invalid_state"),
        RepositoryError::Database(_) => (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable"),
        RepositoryError::DataCorruption(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl AppError {
    /// HTTP status and stable machine-readable code.
    #[must_use]
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Database(e) | Self::Token(TokenError::Storage(e)) => repository_status(e),
            Self::Slack(e) | Self::Token(TokenError::Slack(e)) => slack_status(e),
            Self::Token(TokenError::NoCredential) => (StatusCode::CONFLICT, "slack_not_connected"),
            Self::Token(TokenError::NoRefreshToken) => (StatusCode::CONFLICT, "no_refresh_token"),
            Self::Token(TokenError::RefreshRejected(_)) => {
                (StatusCode::UNAUTHORIZED, "refresh_rejected")
            }
            Self::OAuthState(_) => (StatusCode::BAD_REQUEST, "invalid_state_param"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        }
    }

    /// Message safe to show to the caller.
    fn public_message(&self) -> String {
        match self {
            Self::Slack(e) | Self::Token(TokenError::Slack(e)) => match e {
                SlackError::ChannelJoin { .. }
                | SlackError::InsufficientScope { .. }
                | SlackError::PlatformRejected { .. }
                | SlackError::InvalidCode(_) => e.to_string(),
                SlackError::Transport(_) | SlackError::Response(_) => {
                    "Slack is unavailable, try again later".to_string()
                }
                _ => INTERNAL_MESSAGE.to_string(),
            },
            Self::Database(e @ (RepositoryError::InvalidState { .. } | RepositoryError::NotFound)) => {
                e.to_string()
            }
            Self::Database(_) | Self::Token(TokenError::Storage(_)) => {
                INTERNAL_MESSAGE.to_string()
            }
            Self::Token(e) => e.to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // Log server errors with Sentry
        if status.is_server_error() {
            let event_id = sentry::capture_error(&self);
            tracing::error!(
                error = %self,
                sentry_event_id = %event_id,
                "Request error"
            );
        } else {
            tracing::debug!(error = %self, code, "Request rejected");
        }

        let (needed, provided) = match &self {
            Self::Slack(SlackError::InsufficientScope { needed, provided })
            | Self::Token(TokenError::Slack(SlackError::InsufficientScope { needed, provided })) => {
                (Some(needed.clone()), Some(provided.clone()))
            }
            _ => (None, None),
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code,
                message: self.public_message(),
                needed,
                provided,
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Set the Sentry user context for the current request.
pub fn set_sentry_user(user_id: &str) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(user_id.to_string()),
            ..Default::default()
        }));
    });
}
