//! Realtime messaging session modules.
//!
//! - `client`: session-start handshake, socket setup, and the worker that
//!   owns the websocket.
//! - `proxy`: HTTP proxy settings and `CONNECT` tunnelling.
//! - `proto`: wire messages shared with the service.
//! - `correlation`: request identifiers and pending-reply bookkeeping.
//! - `dispatch`: inbound frame routing and handler registries.
//! - `presence`: roster, subscriptions, and manual presence echoes.
//! - `state`: connection lifecycle and shared session state.
//! - `session`: the caller-facing session handle.

/// Handshake, socket setup, and session worker.
pub mod client;
/// Request/reply correlation.
pub mod correlation;
/// Event handlers and inbound routing.
pub mod dispatch;
/// Roster and presence tracking.
pub mod presence;
/// Protocol messages.
pub mod proto;
/// Proxy configuration.
pub mod proxy;
/// Session handle.
pub mod session;
/// Connection state machine and shared state.
pub mod state;

pub use client::{RtmClient, RtmClientError, RtmClientOptions, RtmDefaults};
pub use correlation::{MessageIdentity, MessageSent, PendingReply, RequestError};
pub use dispatch::{EventHandlers, LifecycleEvent, MessageDeleted, MessageEvent};
pub use presence::{PresenceChange, PresenceCounter, PresenceOrigin, User};
pub use proto::{MessageTs, Presence};
pub use proxy::ProxySettings;
pub use session::RtmSession;
pub use state::{ConnectionState, SessionState};
