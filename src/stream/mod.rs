//! Realtime push stream modules.
//!
//! - `client`: public handles and the connection worker that drives the
//!   open/auth/resync/replay lifecycle and reconnects.
//! - `proto`: wire envelope and filter configuration types.
//! - `registry`: channel and filter bookkeeping replayed on every connect.
//! - `transport`: socket seam and the websocket implementation.

/// Auth handshake and token provider types.
pub mod auth;
/// Push client, controller handle, and connection worker.
pub mod client;
/// Inbound frame dispatch.
pub mod dispatch;
/// Keepalive and stall detection.
pub mod liveness;
/// Wire protocol types.
pub mod proto;
/// Subscription registry.
pub mod registry;
/// Replay window policy.
pub mod replay;
pub(crate) mod session;
/// Transport trait and websocket transport.
pub mod transport;
