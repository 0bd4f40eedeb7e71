//! Server configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `DATABASE_URL` - `PostgreSQL` connection string
//! - `BASE_URL` - Public URL of this service (used for the OAuth redirect default)
//! - `SLACK_CLIENT_ID` - Slack app OAuth client ID
//! - `SLACK_CLIENT_SECRET` - Slack app OAuth client secret
//! - `TOKEN_ENCRYPTION_KEY` - 32-byte key, base64 encoded, sealing tokens at rest
//! - `STATE_SIGNING_SECRET` - OAuth `state` signing secret (min 32 chars, high entropy)
//! - `ADMIN_API_TOKEN` - Bearer token for the token maintenance endpoints
//!
//! ## Optional
//! - `HOST` - Bind address (default: 127.0.0.1)
//! - `PORT` - Listen port (default: 3002)
//! - `SLACK_REDIRECT_URI` - OAuth redirect URI (default: `{BASE_URL}/api/slack/callback`)
//! - `SLACK_API_BASE` - Slack Web API base URL (default: <https://slack.com/api>)
//! - `SLACK_BOT_SCOPES` - Comma-separated bot scopes requested at connect time
//! - `SLACK_HTTP_TIMEOUT_SECS` - Outbound request timeout (default: 10)
//! - `TOKEN_ENCRYPTION_KEY_ID` - Key identifier stamped into sealed tokens (default: v1)
//! - `IDENTITY_HEADER` - Header carrying the authenticated user ID (default: x-authenticated-user)
//! - `DELIVERY_POLL_INTERVAL_SECS` - Delivery scheduler tick (default: 60)
//! - `DELIVERY_CONCURRENCY` - Messages delivered in parallel per tick (default: 8)
//! - `TOKEN_SWEEP_INTERVAL_SECS` - Token sweep period (default: 7200)
//! - `TOKEN_REFRESH_WINDOW_SECS` - On-demand refresh window (default: 300)
//! - `TOKEN_SWEEP_WINDOW_SECS` - Sweep refresh window (default: 14400)
//! - `LOG_FORMAT` - `json` for structured logs, anything else for text
//! - `SENTRY_DSN` - Sentry error tracking DSN

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

const MIN_SIGNING_SECRET_LENGTH: usize = 32;
const MIN_ENTROPY_BITS_PER_CHAR: f64 = 3.3;
const ENCRYPTION_KEY_LENGTH: usize = 32;
const DEFAULT_SLACK_API_BASE: &str = "https://slack.com/api";
const DEFAULT_BOT_SCOPES: &str =
    "chat:write,channels:read,groups:read,channels:join,channels:manage,users:read";

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example",
    "secret",
    "password",
    "xxx",
    "todo",
    "fixme",
    "insert",
    "enter-",
    "put-your",
    "add-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `PostgreSQL` database connection URL (contains password)
    pub database_url: SecretString,
    /// IP address to bind the server to
    pub host: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Public base URL of the service
    pub base_url: String,
    /// Slack app configuration
    pub slack: SlackAppConfig,
    /// Token sealing, OAuth state signing and admin access
    pub security: SecurityConfig,
    /// Background delivery and token sweep timing
    pub scheduler: SchedulerConfig,
    /// Header set by the upstream identity provider
    pub identity_header: String,
    /// Emit JSON logs instead of text
    pub json_logs: bool,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment (e.g., "development", "staging", "production")
    pub sentry_environment: Option<String>,
    /// Sentry error sample rate (0.0 to 1.0)
    pub sentry_sample_rate: f32,
    /// Sentry traces sample rate for performance monitoring (0.0 to 1.0)
    pub sentry_traces_sample_rate: f32,
}

/// Slack app (OAuth v2) configuration.
///
/// Implements `Debug` manually to redact the client secret.
#[derive(Clone)]
pub struct SlackAppConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    /// Must match the redirect URI registered with the Slack app exactly.
    pub redirect_uri: String,
    pub api_base: String,
    pub bot_scopes: Vec<String>,
    pub http_timeout: Duration,
}

impl std::fmt::Debug for SlackAppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackAppConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .field("api_base", &self.api_base)
            .field("bot_scopes", &self.bot_scopes)
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

/// Secrets held by the service itself.
///
/// Implements `Debug` manually to redact every secret.
#[derive(Clone)]
pub struct SecurityConfig {
    /// Raw 32-byte token encryption key.
    pub token_encryption_key: SecretString,
    pub token_encryption_key_id: String,
    pub state_signing_secret: SecretString,
    pub admin_api_token: SecretString,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("token_encryption_key", &"[REDACTED]")
            .field("token_encryption_key_id", &self.token_encryption_key_id)
            .field("state_signing_secret", &"[REDACTED]")
            .field("admin_api_token", &"[REDACTED]")
            .finish()
    }
}

/// Timing for the background loops and token refresh windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    /// Tokens expiring within this window are refreshed on demand.
    pub refresh_window: Duration,
    /// Tokens expiring within this window are refreshed by the sweep.
    pub sweep_window: Duration,
    pub delivery_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(2 * 60 * 60),
            refresh_window: Duration::from_secs(5 * 60),
            sweep_window: Duration::from_secs(4 * 60 * 60),
            delivery_concurrency: 8,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing, invalid, or
    /// if secrets fail validation (placeholder detection, entropy check).
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database_url = get_required_secret("DATABASE_URL")?;
        let host = get_env_or_default("HOST", "127.0.0.1")
            .parse::<IpAddr>()
            .map_err(|e| ConfigError::InvalidEnvVar("HOST".to_string(), e.to_string()))?;
        let port = get_env_or_default("PORT", "3002")
            .parse::<u16>()
            .map_err(|e| ConfigError::InvalidEnvVar("PORT".to_string(), e.to_string()))?;
        let base_url = get_required_env("BASE_URL")?
            .trim_end_matches('/')
            .to_string();

        let slack = SlackAppConfig::from_env(&base_url)?;
        let security = SecurityConfig::from_env()?;
        let scheduler = SchedulerConfig::from_env()?;
        let identity_header =
            get_env_or_default("IDENTITY_HEADER", "x-authenticated-user").to_lowercase();
        axum::http::HeaderName::from_bytes(identity_header.as_bytes()).map_err(|e| {
            ConfigError::InvalidEnvVar("IDENTITY_HEADER".to_string(), e.to_string())
        })?;
        let json_logs = get_optional_env("LOG_FORMAT").is_some_and(|v| v == "json");

        let sentry_dsn = get_optional_env("SENTRY_DSN");
        let sentry_environment = get_optional_env("SENTRY_ENVIRONMENT");
        let sentry_sample_rate = get_optional_env("SENTRY_SAMPLE_RATE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(1.0);
        let sentry_traces_sample_rate = get_optional_env("SENTRY_TRACES_SAMPLE_RATE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.1);

        Ok(Self {
            database_url,
            host,
            port,
            base_url,
            slack,
            security,
            scheduler,
            identity_header,
            json_logs,
            sentry_dsn,
            sentry_environment,
            sentry_sample_rate,
            sentry_traces_sample_rate,
        })
    }

    /// Returns the socket address for binding the server.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl SlackAppConfig {
    fn from_env(base_url: &str) -> Result<Self, ConfigError> {
        let redirect_uri = get_optional_env("SLACK_REDIRECT_URI")
            .unwrap_or_else(|| format!("{base_url}/api/slack/callback"));
        url::Url::parse(&redirect_uri).map_err(|e| {
            ConfigError::InvalidEnvVar("SLACK_REDIRECT_URI".to_string(), e.to_string())
        })?;

        Ok(Self {
            client_id: get_required_env("SLACK_CLIENT_ID")?,
            client_secret: get_validated_secret("SLACK_CLIENT_SECRET")?,
            redirect_uri,
            api_base: get_env_or_default("SLACK_API_BASE", DEFAULT_SLACK_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            bot_scopes: parse_scopes(&get_env_or_default("SLACK_BOT_SCOPES", DEFAULT_BOT_SCOPES)),
            http_timeout: get_duration_secs("SLACK_HTTP_TIMEOUT_SECS", 10)?,
        })
    }
}

impl SecurityConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let token_encryption_key = get_required_secret("TOKEN_ENCRYPTION_KEY")?;
        decode_encryption_key(&token_encryption_key)
            .map_err(|reason| ConfigError::InvalidEnvVar("TOKEN_ENCRYPTION_KEY".to_string(), reason))?;

        let state_signing_secret = get_validated_secret("STATE_SIGNING_SECRET")?;
        validate_signing_secret(&state_signing_secret, "STATE_SIGNING_SECRET")?;

        let admin_api_token = get_validated_secret("ADMIN_API_TOKEN")?;
        validate_signing_secret(&admin_api_token, "ADMIN_API_TOKEN")?;

        let token_encryption_key_id = get_env_or_default("TOKEN_ENCRYPTION_KEY_ID", "v1");
        validate_key_id(&token_encryption_key_id).map_err(|reason| {
            ConfigError::InvalidEnvVar("TOKEN_ENCRYPTION_KEY_ID".to_string(), reason)
        })?;

        Ok(Self {
            token_encryption_key,
            token_encryption_key_id,
            state_signing_secret,
            admin_api_token,
        })
    }
}

impl SchedulerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let delivery_concurrency = get_env_or_default(
            "DELIVERY_CONCURRENCY",
            &defaults.delivery_concurrency.to_string(),
        )
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            ConfigError::InvalidEnvVar(
                "DELIVERY_CONCURRENCY".to_string(),
                "must be a positive integer".to_string(),
            )
        })?;

        Ok(Self {
            poll_interval: get_duration_secs(
                "DELIVERY_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )?,
            sweep_interval: get_duration_secs(
                "TOKEN_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?,
            refresh_window: get_duration_secs(
                "TOKEN_REFRESH_WINDOW_SECS",
                defaults.refresh_window.as_secs(),
            )?,
            sweep_window: get_duration_secs(
                "TOKEN_SWEEP_WINDOW_SECS",
                defaults.sweep_window.as_secs(),
            )?,
            delivery_concurrency,
        })
    }
}

/// Decode the base64 token encryption key into raw key bytes.
///
/// Accepts both URL-safe (unpadded) and standard base64.
///
/// # Errors
///
/// Returns a human-readable reason if the value is not base64 or not 32 bytes.
pub fn decode_encryption_key(
    encoded: &SecretString,
) -> Result<[u8; ENCRYPTION_KEY_LENGTH], String> {
    let trimmed = encoded.expose_secret().trim();
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(trimmed))
        .map_err(|e| format!("invalid base64: {e}"))?;
    <[u8; ENCRYPTION_KEY_LENGTH]>::try_from(bytes.as_slice()).map_err(|_| {
        format!(
            "expected {ENCRYPTION_KEY_LENGTH} bytes, got {}",
            bytes.len()
        )
    })
}

fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get a required environment variable.
fn get_required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Get a required environment variable as a secret.
fn get_required_secret(key: &str) -> Result<SecretString, ConfigError> {
    let value = get_required_env(key)?;
    Ok(SecretString::from(value))
}

/// Get an optional environment variable.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Get an environment variable with a default value.
fn get_env_or_default(key: &str, default: &str) -> String {
    get_optional_env(key).unwrap_or_else(|| default.to_string())
}

/// Get a whole-seconds duration, rejecting zero.
fn get_duration_secs(key: &str, default: u64) -> Result<Duration, ConfigError> {
    parse_duration_secs(key, get_optional_env(key).as_deref(), default)
}

fn parse_duration_secs(key: &str, raw: Option<&str>, default: u64) -> Result<Duration, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Duration::from_secs(default));
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::InvalidEnvVar(
            key.to_string(),
            "must be greater than zero".to_string(),
        )),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(e) => Err(ConfigError::InvalidEnvVar(key.to_string(), e.to_string())),
    }
}

/// Validate that a signing secret meets minimum length requirements.
/// Key IDs are embedded in the `:`-separated token envelope, so only
/// `[A-Za-z0-9_-]` is allowed.
fn validate_key_id(key_id: &str) -> Result<(), String> {
    if key_id.is_empty() {
        return Err("must not be empty".to_string());
    }
    if let Some(c) = key_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(format!("invalid character {c:?}; use letters, digits, '_' or '-'"));
    }
    Ok(())
}

fn validate_signing_secret(secret: &SecretString, var_name: &str) -> Result<(), ConfigError> {
    let value = secret.expose_secret();
    if value.len() < MIN_SIGNING_SECRET_LENGTH {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "must be at least {} characters (got {})",
                MIN_SIGNING_SECRET_LENGTH,
                value.len()
            ),
        ));
    }
    Ok(())
}

/// Calculate Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }

    #[allow(clippy::cast_precision_loss)] // String length will never exceed f64 precision
    let len = s.len() as f64;
    freq.values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)] // Character count will never exceed f64 precision
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Validate that a secret is not a placeholder and has sufficient entropy.
fn validate_secret_strength(secret: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = secret.to_lowercase();

    for pattern in PLACEHOLDER_PATTERNS {
        if lower.contains(pattern) {
            return Err(ConfigError::InsecureSecret(
                var_name.to_string(),
                format!("appears to be a placeholder (contains '{pattern}')"),
            ));
        }
    }

    let entropy = shannon_entropy(secret);
    if entropy < MIN_ENTROPY_BITS_PER_CHAR {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "entropy too low ({entropy:.2} bits/char, need >= {MIN_ENTROPY_BITS_PER_CHAR:.1}). Use a randomly generated secret."
            ),
        ));
    }

    Ok(())
}

/// Load and validate a secret from environment.
fn get_validated_secret(key: &str) -> Result<SecretString, ConfigError> {
    let value = get_required_env(key)?;
    validate_secret_strength(&value, key)?;
    Ok(SecretString::from(value))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_shannon_entropy_empty() {
        assert!((shannon_entropy("") - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shannon_entropy_two_chars() {
        let entropy = shannon_entropy("ab");
        assert!((entropy - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_validate_secret_strength_placeholder() {
        let err = validate_secret_strength("your-client-secret", "TEST_VAR").unwrap_err();
        assert!(matches!(err, ConfigError::InsecureSecret(_, _)));
    }

    #[test]
    fn test_validate_secret_strength_low_entropy() {
        let result = validate_secret_strength("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "TEST_VAR");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_secret_strength_valid() {
        let result = validate_secret_strength("aB3$xY9!mK2@nL5#pQ7&rT0*uW4^zC6", "TEST_VAR");
        assert!(result.is_ok());
    }

    #[test]
    fn test_validate_signing_secret_too_short() {
        let secret = SecretString::from("short");
        assert!(validate_signing_secret(&secret, "STATE_SIGNING_SECRET").is_err());
    }

    #[test]
    fn test_decode_encryption_key_accepts_both_alphabets() {
        let raw = [7u8; 32];
        let url_safe = SecretString::from(URL_SAFE_NO_PAD.encode(raw));
        let standard = SecretString::from(STANDARD.encode(raw));
        assert_eq!(decode_encryption_key(&url_safe).unwrap(), raw);
        assert_eq!(decode_encryption_key(&standard).unwrap(), raw);
    }

    #[test]
    fn test_decode_encryption_key_rejects_wrong_length() {
        let short = SecretString::from(STANDARD.encode([1u8; 16]));
        let reason = decode_encryption_key(&short).unwrap_err();
        assert!(reason.contains("expected 32 bytes"));
    }

    #[test]
    fn test_validate_key_id() {
        assert!(validate_key_id("v1").is_ok());
        assert!(validate_key_id("2026-01_rotated").is_ok());
        assert!(validate_key_id("").is_err());
        let err = validate_key_id("2026:01").expect_err("colon rejected");
        assert!(err.contains("':'"), "{err}");
        assert!(validate_key_id("key id").is_err());
    }

    #[test]
    fn test_parse_duration_secs() {
        assert_eq!(
            parse_duration_secs("X", None, 60).unwrap(),
            Duration::from_secs(60)
        );
        assert_eq!(
            parse_duration_secs("X", Some(" 15 "), 60).unwrap(),
            Duration::from_secs(15)
        );
        assert!(parse_duration_secs("X", Some("0"), 60).is_err());
        assert!(parse_duration_secs("X", Some("soon"), 60).is_err());
    }

    #[test]
    fn test_parse_scopes_skips_blanks() {
        assert_eq!(
            parse_scopes("chat:write, channels:read,,"),
            vec!["chat:write".to_string(), "channels:read".to_string()]
        );
    }

    #[test]
    fn test_scheduler_defaults() {
        let defaults = SchedulerConfig::default();
        assert_eq!(defaults.poll_interval, Duration::from_secs(60));
        assert_eq!(defaults.sweep_interval, Duration::from_secs(7200));
        assert_eq!(defaults.refresh_window, Duration::from_secs(300));
        assert_eq!(defaults.sweep_window, Duration::from_secs(14_400));
    }

    #[test]
    fn test_security_config_debug_redacts_secrets() {
        let config = SecurityConfig {
            token_encryption_key: SecretString::from("key-material-123"),
            token_encryption_key_id: "v7".to_string(),
            state_signing_secret: SecretString::from("state-secret-456"),
            admin_api_token: SecretString::from("admin-token-789"),
        };

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("v7"));
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("key-material-123"));
        assert!(!debug_output.contains("state-secret-456"));
        assert!(!debug_output.contains("admin-token-789"));
    }

    #[test]
    fn test_slack_app_config_debug_redacts_secrets() {
        let config = SlackAppConfig {
            client_id: "123.456".to_string(),
            client_secret: SecretString::from("super_secret_client_secret"),
            redirect_uri: "https://app.test/api/slack/callback".to_string(),
            api_base: DEFAULT_SLACK_API_BASE.to_string(),
            bot_scopes: parse_scopes(DEFAULT_BOT_SCOPES),
            http_timeout: Duration::from_secs(10),
        };

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("123.456"));
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_client_secret"));
    }
}
