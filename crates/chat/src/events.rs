//! Chat-level wire events and session notifications
//!
//! Defines the payload published on conversation channels and the
//! notifications the session controller emits to UI observers.

use deskrelay_shared::{ChatMessage, ClientId, ConnectionState};
use serde::{Deserialize, Serialize};

use crate::transport::PresenceEvent;

/// Channel event name carrying message creation. The name predates the chat
/// widget's split from the ticketing surface and is kept for wire
/// compatibility with deployed agents.
pub const NEW_MESSAGE_EVENT: &str = "ticket/new-message";

/// Payload published on a conversation channel for each new message
///
/// For an encrypted conversation the embedded message carries only the
/// cipher envelope; plaintext never crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Client that published the message, used to skip own echoes
    pub sender_client: ClientId,
    pub message: ChatMessage,
}

/// Notification emitted by the session controller to UI observers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A message entered the visible list (optimistic send or delivery)
    MessageAppended(ChatMessage),

    /// A visible message changed (delivery status reconciliation)
    MessageUpdated(ChatMessage),

    /// The realtime connection state transitioned
    ConnectionChanged(ConnectionState),

    /// Presence membership changed on the active conversation's channel
    PresenceChanged(PresenceEvent),

    /// The active conversation's channel was re-subscribed after a reconnect
    Resubscribed { channel: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use deskrelay_shared::ConversationId;

    #[test]
    fn test_wire_message_roundtrip() {
        let wire = WireMessage {
            sender_client: ClientId::generate(),
            message: ChatMessage::outgoing(ConversationId::new(), "hi"),
        };

        let json = serde_json::to_string(&wire).unwrap();
        let back: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sender_client, wire.sender_client);
        assert_eq!(back.message, wire.message);
    }

    #[test]
    fn test_malformed_wire_message_is_an_error() {
        let result: Result<WireMessage, _> =
            serde_json::from_value(serde_json::json!({"unexpected": true}));
        assert!(result.is_err());
    }
}
