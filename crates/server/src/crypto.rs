//! Envelope encryption for OAuth tokens at rest.
//!
//! Tokens are sealed with ChaCha20-Poly1305 before they reach the database and
//! stored as `enc:v1:{key_id}:{nonce}:{ciphertext}` (URL-safe base64, no padding).
//! The key id lets a future key rotation tell which key sealed a row.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::config::{SecurityConfig, decode_encryption_key};

const ENVELOPE_PREFIX: &str = "enc:v1:";
const NONCE_LENGTH: usize = 12;

/// Errors raised while sealing or opening a token.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
    #[error("token envelope is malformed")]
    MalformedEnvelope,
    #[error("token sealed with unknown key id {0}")]
    UnknownKey(String),
    #[error("token could not be decrypted")]
    Decrypt,
    #[error("token could not be encrypted")]
    Encrypt,
}

/// Seals and opens token strings with a single service key.
#[derive(Clone)]
pub struct TokenCipher {
    key_id: String,
    aead: ChaCha20Poly1305,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("key_id", &self.key_id)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl TokenCipher {
    /// Build a cipher from raw key bytes.
    #[must_use]
    pub fn new(key_id: impl Into<String>, key: &[u8; 32]) -> Self {
        Self {
            key_id: key_id.into(),
            aead: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Build a cipher from the service security configuration.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the configured key is not 32 base64 bytes.
    pub fn from_config(config: &SecurityConfig) -> Result<Self, CryptoError> {
        let key = decode_encryption_key(&config.token_encryption_key)
            .map_err(CryptoError::InvalidKey)?;
        Ok(Self::new(config.token_encryption_key_id.clone(), &key))
    }

    /// Seal a plaintext token into an envelope string.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Encrypt` if the AEAD rejects the input.
    pub fn seal(&self, plaintext: &SecretString) -> Result<String, CryptoError> {
        let nonce_bytes: [u8; NONCE_LENGTH] = rand::random();
        let ciphertext = self
            .aead
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                plaintext.expose_secret().as_bytes(),
            )
            .map_err(|_| CryptoError::Encrypt)?;

        Ok(format!(
            "{ENVELOPE_PREFIX}{}:{}:{}",
            self.key_id,
            URL_SAFE_NO_PAD.encode(nonce_bytes),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    /// Open an envelope string back into the plaintext token.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError` if the envelope is malformed, was sealed with a
    /// different key id, or fails authentication.
    pub fn open(&self, envelope: &str) -> Result<SecretString, CryptoError> {
        let body = envelope
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or(CryptoError::MalformedEnvelope)?;

        let mut parts = body.split(':');
        let (Some(key_id), Some(nonce_b64), Some(ciphertext_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CryptoError::MalformedEnvelope);
        };

        if key_id != self.key_id {
            return Err(CryptoError::UnknownKey(key_id.to_string()));
        }

        let nonce = URL_SAFE_NO_PAD
            .decode(nonce_b64)
            .map_err(|_| CryptoError::MalformedEnvelope)?;
        if nonce.len() != NONCE_LENGTH {
            return Err(CryptoError::MalformedEnvelope);
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ciphertext_b64)
            .map_err(|_| CryptoError::MalformedEnvelope)?;

        let plaintext = self
            .aead
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plaintext)
            .map(SecretString::from)
            .map_err(|_| CryptoError::Decrypt)
    }
}
