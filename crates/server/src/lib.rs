//! slackpost server library.
//!
//! Connects users' Slack workspaces over OAuth, keeps their rotating tokens
//! fresh, and posts scheduled messages on their behalf. Exposed as a library
//! so the CLI and the integration tests share the same code.
//!
//! # Security
//!
//! This crate holds every connected user's Slack token:
//! - Tokens are sealed with ChaCha20-Poly1305 before they reach the database
//! - Token values never appear in logs or `Debug` output

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod services;
pub mod slack;
pub mod state;
pub mod test_support;
