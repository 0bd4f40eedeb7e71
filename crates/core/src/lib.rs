//! slackpost core - Shared types library.
//!
//! This crate provides common types used across all slackpost components:
//! - `server` - OAuth connection, message delivery and token lifecycle service
//! - `cli` - Command-line tools for migrations and token maintenance
//!
//! # Architecture
//!
//! The core crate contains only types - no I/O, no database access,
//! no HTTP clients. This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype wrappers for type-safe IDs and the message status machine

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
