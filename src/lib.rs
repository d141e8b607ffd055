//! Rust client for realtime messaging sessions.
//!
//! The crate is organized by concern:
//! - `rtm`: session handshake, websocket worker, correlated requests,
//!   presence tracking, and push-event handlers.
//! - `gate`: named, deadline-bounded wait primitive for coordinating with
//!   asynchronous callbacks.

/// Deadline-bounded synchronization helpers.
pub mod gate;
/// Realtime messaging client and session types.
pub mod rtm;
