//! Realtime transport for the chat widget
//!
//! Owns the single realtime connection per widget instance and provides
//! channel-scoped publish/subscribe and presence on top of it:
//! - **Socket**: the raw wire collaborator trait plus an in-process loopback
//!   implementation for tests and local demos
//! - **Channel**: a named pub/sub topic with per-event handler registrations
//!   and ephemeral presence membership
//! - **Provider**: connection state machine, channel cache, publish/presence
//!   entry points, automatic reconnect
//!
//! Publish and presence operations fail fast with
//! [`TransportError::NotConnected`] while the connection is down; queueing
//! outbound messages during an outage is the session controller's job, never
//! the transport's.

pub mod channel;
pub mod provider;
pub mod socket;

pub use channel::{
    Channel, EventHandler, PresenceAction, PresenceEvent, PresenceHandler, PresenceSubscription,
    Subscription,
};
pub use provider::{StateObserver, StateObserverHandle, TransportProvider, DEFAULT_RETRY_BACKOFF};
pub use socket::{Frame, InMemoryHub, InMemorySocket, RealtimeSocket, SocketEvent};

/// Wire event names reserved by the transport for presence bookkeeping.
/// Application events must not reuse the `presence:` prefix.
pub mod events {
    pub const PRESENCE_ENTER: &str = "presence:enter";
    pub const PRESENCE_LEAVE: &str = "presence:leave";
    pub const PRESENCE_UPDATE: &str = "presence:update";
}

/// Transport error type
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Realtime connection is not established")]
    NotConnected,

    #[error("Connection attempt failed: {0}")]
    ConnectFailed(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Socket closed")]
    SocketClosed,
}
