//! Identity extractors.
//!
//! The service sits behind an identity provider that authenticates the web
//! user and forwards their ID in a trusted header (see `IDENTITY_HEADER`).
//! Maintenance endpoints additionally require the admin bearer token.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use secrecy::ExposeSecret;
use slackpost_core::UserId;

use crate::error::{AppError, set_sentry_user};
use crate::state::AppState;

/// The authenticated web user.
///
/// Rejects with 401 if the identity header is missing or not a valid user ID.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub UserId);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header_name = state.config().identity_header.as_str();
        let raw = parts
            .headers
            .get(header_name)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("missing user identity".to_string()))?;

        let user_id = UserId::parse(raw)
            .map_err(|e| AppError::Unauthorized(format!("invalid user identity: {e}")))?;

        tracing::Span::current().record("user_id", user_id.as_str());
        set_sentry_user(user_id.as_str());
        Ok(Self(user_id))
    }
}

/// Marker extractor for requests carrying the admin bearer token.
#[derive(Debug, Clone, Copy)]
pub struct AdminToken;

impl FromRequestParts<AppState> for AdminToken {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| AppError::Unauthorized("admin token required".to_string()))?;

        let expected = state.config().security.admin_api_token.expose_secret();
        if !constant_time_compare(expected, presented.trim()) {
            tracing::warn!("Rejected admin request with wrong token");
            return Err(AppError::Unauthorized("admin token rejected".to_string()));
        }

        Ok(Self)
    }
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }

    result == 0
}
