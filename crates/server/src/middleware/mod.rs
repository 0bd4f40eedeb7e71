//! HTTP middleware and extractors.
//!
//! # Middleware Order (outermost first)
//!
//! 1. Sentry layers (hub per request, HTTP context)
//! 2. `TraceLayer` (request span with `request_id` and `user_id` fields)
//! 3. Request ID (fills the span field and echoes the header)
//!
//! Authentication is done per handler with the [`CurrentUser`] and
//! [`AdminToken`] extractors.

pub mod identity;
pub mod request_id;

pub use identity::{AdminToken, CurrentUser};
pub use request_id::{REQUEST_ID_HEADER, request_id_middleware};
