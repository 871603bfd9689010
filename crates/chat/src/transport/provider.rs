//! Transport provider: connection state machine and channel cache
//!
//! Exactly one provider (and therefore one realtime connection) exists per
//! widget instance. All conversations share its channel cache; no other
//! component may open a second connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use deskrelay_shared::{ClientId, ConnectionState, PresenceRecord};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::channel::{
    Channel, EventHandler, PresenceHandler, PresenceLeavePayload, PresenceSubscription,
    Subscription,
};
use super::socket::{Frame, RealtimeSocket, SocketEvent};
use super::{events, TransportError};

/// Delay between reconnect attempts while suspended
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Observer invoked synchronously on every connection state transition
pub type StateObserver = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Owns the realtime connection and the channel cache
pub struct TransportProvider {
    shared: Arc<Shared>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    socket: Arc<dyn RealtimeSocket>,
    retry_backoff: Duration,
    state: RwLock<ConnectionState>,
    observers: RwLock<Vec<(Uuid, StateObserver)>>,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    identity: RwLock<Option<ClientId>>,
}

impl TransportProvider {
    pub fn new(socket: Arc<dyn RealtimeSocket>) -> Self {
        Self::with_backoff(socket, DEFAULT_RETRY_BACKOFF)
    }

    pub fn with_backoff(socket: Arc<dyn RealtimeSocket>, retry_backoff: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                socket,
                retry_backoff,
                state: RwLock::new(ConnectionState::Disconnected),
                observers: RwLock::new(Vec::new()),
                channels: RwLock::new(HashMap::new()),
                identity: RwLock::new(None),
            }),
            read_task: Mutex::new(None),
        }
    }

    /// Current connection state (read-only outside the provider)
    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Register a state observer; observers are notified inline at transition
    /// time, in subscription order, with no buffering of stale states.
    pub async fn observe_state(&self, observer: StateObserver) -> StateObserverHandle {
        let id = Uuid::new_v4();
        self.shared.observers.write().await.push((id, observer));
        StateObserverHandle {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    /// Establish the realtime connection
    ///
    /// Transitions connecting -> connected on success, connecting -> failed on
    /// error. Failed is terminal until `connect` is called again.
    pub async fn connect(&self, identity: ClientId) -> Result<(), TransportError> {
        // a second connect replaces the previous read loop
        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
        }

        *self.shared.identity.write().await = Some(identity.clone());
        set_state(&self.shared, ConnectionState::Connecting).await;

        let rx = match self.shared.socket.open(&identity).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(client_id = %identity, error = %e, "Realtime connect failed");
                set_state(&self.shared, ConnectionState::Failed).await;
                return Err(e);
            }
        };

        set_state(&self.shared, ConnectionState::Connected).await;
        tracing::info!(client_id = %identity, "Realtime connection established");

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            read_loop(shared, rx).await;
        });
        *self.read_task.lock().await = Some(task);
        Ok(())
    }

    /// Stop the read loop and mark the connection down. No automatic retry
    /// runs after `close`; a new `connect` call is required.
    pub async fn close(&self) {
        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
            set_state(&self.shared, ConnectionState::Disconnected).await;
        }
    }

    /// Get the channel handle for `name`, constructing it lazily exactly once
    /// per distinct name for the provider's lifetime.
    pub async fn channel(&self, name: &str) -> Arc<Channel> {
        if let Some(channel) = self.shared.channels.read().await.get(name) {
            return Arc::clone(channel);
        }
        let mut channels = self.shared.channels.write().await;
        Arc::clone(
            channels
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Channel::new(name))),
        )
    }

    /// Register `handler` for a named event on a channel
    pub async fn subscribe(
        &self,
        channel_name: &str,
        event: &str,
        handler: EventHandler,
    ) -> Subscription {
        let channel = self.channel(channel_name).await;
        let id = channel.add_handler(event, handler).await;
        tracing::debug!(channel = %channel_name, event = %event, "Subscribed to channel event");
        Subscription::new(channel, event.to_string(), id)
    }

    /// Publish an event on a channel
    ///
    /// Fails immediately with [`TransportError::NotConnected`] while the
    /// connection is down; nothing is queued at this layer.
    pub async fn publish(
        &self,
        channel_name: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        let frame = Frame {
            channel: channel_name.to_string(),
            event: event.to_string(),
            payload,
            sender: self.connected_identity().await?,
        };
        self.shared.socket.send(frame).await
    }

    // -------------------------------------------------------------------------
    // Presence
    // -------------------------------------------------------------------------

    /// Enter presence on a channel
    ///
    /// Membership is propagated as a wire frame; the local membership map is
    /// updated when the frame is reflected back, so presence state follows a
    /// single code path for local and remote clients alike.
    pub async fn presence_enter(
        &self,
        channel_name: &str,
        record: PresenceRecord,
    ) -> Result<(), TransportError> {
        let payload = serde_json::to_value(&record)
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;
        self.publish(channel_name, events::PRESENCE_ENTER, payload)
            .await
    }

    /// Leave presence on a channel
    pub async fn presence_leave(&self, channel_name: &str) -> Result<(), TransportError> {
        let client_id = self.connected_identity().await?;
        let payload = serde_json::to_value(PresenceLeavePayload { client_id })
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;
        self.publish(channel_name, events::PRESENCE_LEAVE, payload)
            .await
    }

    /// Current membership of a channel
    pub async fn presence_get(&self, channel_name: &str) -> Vec<PresenceRecord> {
        self.channel(channel_name).await.presence_members().await
    }

    /// Observe presence membership changes on a channel
    pub async fn presence_subscribe(
        &self,
        channel_name: &str,
        handler: PresenceHandler,
    ) -> PresenceSubscription {
        let channel = self.channel(channel_name).await;
        let id = channel.add_presence_sub(handler).await;
        PresenceSubscription::new(channel, id)
    }

    async fn connected_identity(&self) -> Result<ClientId, TransportError> {
        if *self.shared.state.read().await != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.shared
            .identity
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)
    }
}

/// Disposer for a connection-state observer registration
pub struct StateObserverHandle {
    shared: Arc<Shared>,
    id: Uuid,
}

impl StateObserverHandle {
    pub async fn dispose(self) {
        let mut observers = self.shared.observers.write().await;
        observers.retain(|(id, _)| *id != self.id);
    }
}

/// Transition the connection state and notify observers inline, in
/// subscription order. Repeated sets of the same state are not broadcast.
async fn set_state(shared: &Arc<Shared>, next: ConnectionState) {
    {
        let mut state = shared.state.write().await;
        if *state == next {
            return;
        }
        tracing::info!(from = %state, to = %next, "Connection state transition");
        *state = next;
    }
    let observers = shared.observers.read().await;
    for (_, observer) in observers.iter() {
        observer(next);
    }
}

/// Consume socket events until the wire drops, then retry with backoff.
///
/// disconnected -> connecting (immediate retry); suspended -> connecting
/// (retry after backoff). The loop ends only when the task is aborted.
async fn read_loop(
    shared: Arc<Shared>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<SocketEvent>,
) {
    loop {
        loop {
            match rx.recv().await {
                Some(SocketEvent::Frame(frame)) => dispatch_frame(&shared, frame).await,
                Some(SocketEvent::Dropped) | None => break,
            }
        }

        set_state(&shared, ConnectionState::Disconnected).await;
        let Some(identity) = shared.identity.read().await.clone() else {
            return;
        };

        loop {
            set_state(&shared, ConnectionState::Connecting).await;
            match shared.socket.open(&identity).await {
                Ok(new_rx) => {
                    rx = new_rx;
                    set_state(&shared, ConnectionState::Connected).await;
                    tracing::info!(client_id = %identity, "Realtime connection re-established");
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        client_id = %identity,
                        error = %e,
                        backoff_ms = shared.retry_backoff.as_millis() as u64,
                        "Reconnect attempt failed"
                    );
                    set_state(&shared, ConnectionState::Suspended).await;
                    tokio::time::sleep(shared.retry_backoff).await;
                }
            }
        }
    }
}

/// Route one inbound frame to its cached channel. Frames for channels nobody
/// ever asked for carry no registrations and are dropped.
async fn dispatch_frame(shared: &Arc<Shared>, frame: Frame) {
    let channel = {
        let channels = shared.channels.read().await;
        channels.get(&frame.channel).cloned()
    };
    let Some(channel) = channel else {
        tracing::debug!(channel = %frame.channel, event = %frame.event, "Frame for unknown channel");
        return;
    };

    if frame.event.starts_with("presence:") {
        channel.apply_presence(&frame.event, frame.payload).await;
    } else {
        channel.dispatch(&frame.event, frame.payload).await;
    }
}
