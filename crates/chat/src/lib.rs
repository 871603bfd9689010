//! DeskRelay chat engine
//!
//! The conversation engine behind the embeddable support widget: realtime
//! transport with presence and reconnect handling, per-conversation message
//! encryption, a capability-based plugin pipeline, persisted conversation
//! history, and the session façade tying them together.
//!
//! Hosts construct the pieces explicitly and wire them through
//! [`ChatSession`]; nothing in this crate reaches for global state.

pub mod config;
pub mod crypto;
pub mod events;
pub mod identity;
pub mod plugins;
pub mod session;
pub mod store;
pub mod transport;

pub use config::{ConfigError, WidgetConfig};
pub use crypto::{CryptoError, EncryptionService, DECRYPT_PLACEHOLDER};
pub use events::{SessionEvent, WireMessage, NEW_MESSAGE_EVENT};
pub use identity::client_identity;
pub use plugins::{
    Plugin, PluginContext, PluginError, PluginKind, PluginPipeline, PluginRegistry, UiFragment,
    UiLocation,
};
pub use session::{ChatSession, SessionError, SessionObserver, SessionObserverHandle};
pub use store::{ConversationStore, StoreError};
pub use transport::{TransportError, TransportProvider};
