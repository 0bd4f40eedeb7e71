//! Signed OAuth `state` parameter.
//!
//! The state binds the Slack callback to the user who started the connect
//! flow without server-side session storage:
//!
//! ```text
//! base64url(user_id) "." issued_at "." nonce "." hex(hmac_sha256(secret, first three parts))
//! ```

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use slackpost_core::UserId;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// How long a connect attempt stays valid.
const STATE_TTL_MINUTES: i64 = 10;

/// Reasons a returned state is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("OAuth state is malformed")]
    Malformed,
    #[error("OAuth state signature mismatch")]
    BadSignature,
    #[error("OAuth state expired")]
    Expired,
    #[error("OAuth state signing key rejected")]
    Key,
}

/// Issues and verifies OAuth state values.
#[derive(Clone)]
pub struct OAuthState {
    secret: SecretString,
}

impl std::fmt::Debug for OAuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthState")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl OAuthState {
    #[must_use]
    pub const fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    fn mac(&self) -> Result<HmacSha256, StateError> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| StateError::Key)
    }

    /// Issue a state value for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Key` if the signing key is unusable.
    pub fn issue(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<String, StateError> {
        let nonce = hex::encode(rand::random::<[u8; 12]>());
        let payload = format!(
            "{}.{}.{nonce}",
            URL_SAFE_NO_PAD.encode(user_id.as_str()),
            now.timestamp()
        );

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{payload}.{signature}"))
    }

    /// Verify a state value and return the user it was issued for.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the value is malformed, was not signed with
    /// this secret, or is older than the state TTL.
    pub fn verify(&self, state: &str, now: DateTime<Utc>) -> Result<UserId, StateError> {
        let (payload, signature) = state.rsplit_once('.').ok_or(StateError::Malformed)?;
        let signature = hex::decode(signature).map_err(|_| StateError::Malformed)?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| StateError::BadSignature)?;

        let mut parts = payload.split('.');
        let (Some(user_b64), Some(issued_at), Some(_nonce), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(StateError::Malformed);
        };

        let issued_at = issued_at
            .parse::<i64>()
            .ok()
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .ok_or(StateError::Malformed)?;
        let age = now - issued_at;
        if age > Duration::minutes(STATE_TTL_MINUTES) || age < Duration::minutes(-1) {
            return Err(StateError::Expired);
        }

        let user_bytes = URL_SAFE_NO_PAD
            .decode(user_b64)
            .map_err(|_| StateError::Malformed)?;
        let user = String::from_utf8(user_bytes).map_err(|_| StateError::Malformed)?;
        UserId::parse(&user).map_err(|_| StateError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(secret: &str) -> OAuthState {
        OAuthState::new(SecretString::from(secret.to_string()))
    }

    fn user() -> UserId {
        UserId::parse("auth0|5f1d.a").expect("valid id")
    }

    #[test]
    fn test_issue_then_verify() {
        let signer = signer("state-signing-secret-with-some-length");
        let now = Utc::now();
        let state = signer.issue(&user(), now).expect("issue");

        assert_eq!(signer.verify(&state, now), Ok(user()));
    }

    #[test]
    fn test_rejects_other_secret() {
        let now = Utc::now();
        let state = signer("first-secret").issue(&user(), now).expect("issue");
        assert_eq!(
            signer("second-secret").verify(&state, now),
            Err(StateError::BadSignature)
        );
    }

    #[test]
    fn test_rejects_tampered_user() {
        let signer = signer("state-signing-secret");
        let now = Utc::now();
        let state = signer.issue(&user(), now).expect("issue");
        let forged_user = URL_SAFE_NO_PAD.encode("someone-else");
        let (_, rest) = state.split_once('.').expect("has parts");
        let forged = format!("{forged_user}.{rest}");

        assert_eq!(signer.verify(&forged, now), Err(StateError::BadSignature));
    }

    #[test]
    fn test_rejects_expired_state() {
        let signer = signer("state-signing-secret");
        let issued = Utc::now() - Duration::minutes(STATE_TTL_MINUTES + 1);
        let state = signer.issue(&user(), issued).expect("issue");

        assert_eq!(signer.verify(&state, Utc::now()), Err(StateError::Expired));
    }

    #[test]
    fn test_rejects_garbage() {
        let signer = signer("state-signing-secret");
        assert_eq!(
            signer.verify("no-dots-here", Utc::now()),
            Err(StateError::Malformed)
        );
        assert_eq!(
            signer.verify("a.b.c.zz", Utc::now()),
            Err(StateError::Malformed)
        );
    }
}
