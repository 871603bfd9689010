//! Channel handles: named pub/sub topics with presence
//!
//! Channels are constructed lazily by the provider and cached by name; at
//! most one live channel object exists per name per provider instance.

use std::collections::HashMap;
use std::sync::Arc;

use deskrelay_shared::{ClientId, PresenceRecord};
use futures::future::BoxFuture;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::events;

/// Handler invoked for every matching inbound event payload
pub type EventHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler invoked on presence membership changes
pub type PresenceHandler = Arc<dyn Fn(&PresenceEvent) + Send + Sync>;

/// Presence membership change notification
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    pub action: PresenceAction,
    pub record: PresenceRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceAction {
    Enter,
    Leave,
    Update,
}

/// A named realtime topic
///
/// Handler registrations survive reconnects; they are removed only through
/// their [`Subscription`] handle.
pub struct Channel {
    pub name: String,

    /// event name -> ordered handler registrations
    handlers: RwLock<HashMap<String, Vec<(Uuid, EventHandler)>>>,

    /// Ephemeral channel membership, keyed by client id
    presence: RwLock<HashMap<ClientId, PresenceRecord>>,

    presence_subs: RwLock<Vec<(Uuid, PresenceHandler)>>,
}

impl Channel {
    pub(super) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: RwLock::new(HashMap::new()),
            presence: RwLock::new(HashMap::new()),
            presence_subs: RwLock::new(Vec::new()),
        }
    }

    pub(super) async fn add_handler(&self, event: &str, handler: EventHandler) -> Uuid {
        let id = Uuid::new_v4();
        let mut handlers = self.handlers.write().await;
        handlers
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub(super) async fn remove_handler(&self, event: &str, id: Uuid) -> bool {
        let mut handlers = self.handlers.write().await;
        let Some(entries) = handlers.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() < before;
        if entries.is_empty() {
            handlers.remove(event);
        }
        removed
    }

    /// Number of live registrations for one event
    pub async fn handler_count(&self, event: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(event)
            .map(|e| e.len())
            .unwrap_or(0)
    }

    /// Invoke every handler registered for `event`, in registration order.
    ///
    /// The handler table is read-locked for the duration of the dispatch, so
    /// an `unsubscribe` that returns is guaranteed to see no further
    /// callbacks. Handlers must not add or remove registrations on their own
    /// channel inline.
    pub(super) async fn dispatch(&self, event: &str, payload: serde_json::Value) {
        let handlers = self.handlers.read().await;
        if let Some(entries) = handlers.get(event) {
            for (_, handler) in entries {
                handler(payload.clone()).await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Presence
    // -------------------------------------------------------------------------

    /// Current channel membership
    pub async fn presence_members(&self) -> Vec<PresenceRecord> {
        self.presence.read().await.values().cloned().collect()
    }

    pub(super) async fn add_presence_sub(&self, handler: PresenceHandler) -> Uuid {
        let id = Uuid::new_v4();
        self.presence_subs.write().await.push((id, handler));
        id
    }

    pub(super) async fn remove_presence_sub(&self, id: Uuid) -> bool {
        let mut subs = self.presence_subs.write().await;
        let before = subs.len();
        subs.retain(|(sub_id, _)| *sub_id != id);
        subs.len() < before
    }

    /// Apply a presence wire frame to the local membership map and notify
    /// presence subscribers in subscription order.
    pub(super) async fn apply_presence(&self, event: &str, payload: serde_json::Value) {
        let change = match event {
            events::PRESENCE_ENTER | events::PRESENCE_UPDATE => {
                match serde_json::from_value::<PresenceRecord>(payload) {
                    Ok(record) => {
                        let action = if event == events::PRESENCE_ENTER {
                            PresenceAction::Enter
                        } else {
                            PresenceAction::Update
                        };
                        self.presence
                            .write()
                            .await
                            .insert(record.client_id.clone(), record.clone());
                        Some(PresenceEvent { action, record })
                    }
                    Err(e) => {
                        tracing::warn!(channel = %self.name, error = %e, "Malformed presence frame");
                        None
                    }
                }
            }
            events::PRESENCE_LEAVE => {
                match serde_json::from_value::<PresenceLeavePayload>(payload) {
                    Ok(leave) => self
                        .presence
                        .write()
                        .await
                        .remove(&leave.client_id)
                        .map(|record| PresenceEvent {
                            action: PresenceAction::Leave,
                            record,
                        }),
                    Err(e) => {
                        tracing::warn!(channel = %self.name, error = %e, "Malformed presence frame");
                        None
                    }
                }
            }
            _ => None,
        };

        if let Some(event) = change {
            let subs = self.presence_subs.read().await;
            for (_, handler) in subs.iter() {
                handler(&event);
            }
        }
    }
}

/// Wire payload of a presence leave frame
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(super) struct PresenceLeavePayload {
    pub client_id: ClientId,
}

/// Capability to remove exactly one event registration
///
/// After `unsubscribe` returns, no further callbacks fire for the
/// registration it names.
pub struct Subscription {
    channel: Arc<Channel>,
    event: String,
    id: Uuid,
}

impl Subscription {
    pub(super) fn new(channel: Arc<Channel>, event: String, id: Uuid) -> Self {
        Self { channel, event, id }
    }

    pub fn channel_name(&self) -> &str {
        &self.channel.name
    }

    pub async fn unsubscribe(self) {
        self.channel.remove_handler(&self.event, self.id).await;
    }
}

/// Capability to remove one presence registration
pub struct PresenceSubscription {
    channel: Arc<Channel>,
    id: Uuid,
}

impl PresenceSubscription {
    pub(super) fn new(channel: Arc<Channel>, id: Uuid) -> Self {
        Self { channel, id }
    }

    pub async fn unsubscribe(self) {
        self.channel.remove_presence_sub(self.id).await;
    }
}
