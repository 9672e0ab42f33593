//! Rust client for a realtime push stream.
//!
//! The crate is organized by concern:
//! - `stream`: persistent websocket client with authentication, channel
//!   subscriptions, server-side filters, replay and self-healing reconnects.
//! - `retry`: reconnect backoff and timeout utilities.

/// Reconnect backoff and timeout helpers.
pub mod retry;
/// Realtime push client, protocol types, and connection components.
pub mod stream;
