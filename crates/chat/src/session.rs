//! Session controller: the façade the widget UI calls
//!
//! Composes the transport provider, conversation store, and plugin pipeline
//! into the user-visible send/receive flow. All collaborators are injected at
//! construction; there are no ambient singletons.
//!
//! Outbound messages follow the optimistic path: appended as `Sending`,
//! persisted (sealed when the conversation is encrypted), published, then
//! reconciled to `Sent` or `Failed`. Messages submitted while the connection
//! is down are queued and flushed through the publish path in original order
//! when the connection comes back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use deskrelay_shared::{
    conversation_channel, ChatMessage, ClientId, ConnectionState, Conversation, ConversationId,
    MessageId, MessageStatus, PresenceRecord, PresenceStatus, StorageError,
};
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::WidgetConfig;
use crate::crypto::DECRYPT_PLACEHOLDER;
use crate::events::{SessionEvent, WireMessage, NEW_MESSAGE_EVENT};
use crate::identity::client_identity;
use crate::plugins::{PluginContext, PluginPipeline, PluginRegistry, UiFragment, UiLocation};
use crate::store::{ConversationStore, StoreError};
use crate::transport::{
    PresenceSubscription, StateObserverHandle, Subscription, TransportError, TransportProvider,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No active conversation")]
    NoActiveConversation,

    #[error("Message {0} is not in a retryable state")]
    NotRetryable(MessageId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Observer invoked for every session notification
pub type SessionObserver = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// The conversation the widget currently has open
struct ActiveConversation {
    id: ConversationId,
    channel: String,
    subscription: Option<Subscription>,
    presence_sub: Option<PresenceSubscription>,
}

/// One widget instance's conversation session
pub struct ChatSession {
    inner: Arc<SessionInner>,
    state_task: Mutex<Option<JoinHandle<()>>>,
    state_observer: Mutex<Option<StateObserverHandle>>,
}

struct SessionInner {
    config: WidgetConfig,
    transport: Arc<TransportProvider>,
    store: Arc<ConversationStore>,
    pipeline: PluginPipeline,
    identity: RwLock<Option<ClientId>>,
    active: Mutex<Option<ActiveConversation>>,
    /// Sealed messages awaiting publish, FIFO
    queue: Mutex<VecDeque<ChatMessage>>,
    /// Set on any loss of connection; consumed by the next Connected
    /// transition to trigger exactly one re-subscription
    offline_seen: AtomicBool,
    /// Serializes the publish path so messages go out in invocation order
    send_lock: Mutex<()>,
    observers: RwLock<Vec<(Uuid, SessionObserver)>>,
}

impl ChatSession {
    pub fn new(
        config: WidgetConfig,
        transport: Arc<TransportProvider>,
        store: Arc<ConversationStore>,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                transport,
                store,
                pipeline: PluginPipeline::new(registry),
                identity: RwLock::new(None),
                active: Mutex::new(None),
                queue: Mutex::new(VecDeque::new()),
                offline_seen: AtomicBool::new(false),
                send_lock: Mutex::new(()),
                observers: RwLock::new(Vec::new()),
            }),
            state_task: Mutex::new(None),
            state_observer: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &PluginPipeline {
        &self.inner.pipeline
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.inner.store
    }

    /// Register a session observer; the handle removes exactly that
    /// registration.
    pub async fn observe(&self, observer: SessionObserver) -> SessionObserverHandle {
        let id = Uuid::new_v4();
        self.inner.observers.write().await.push((id, observer));
        SessionObserverHandle {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    /// Establish the realtime connection under the persisted client identity
    /// and start watching connection state for reconnect handling.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let identity = client_identity(self.inner.store.storage().as_ref()).await?;
        *self.inner.identity.write().await = Some(identity.clone());

        // state transitions flow through an ordered queue so reconnect work
        // runs outside the transport's notification path
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = self
            .inner
            .transport
            .observe_state(Arc::new(move |state| {
                let _ = tx.send(state);
            }))
            .await;
        *self.state_observer.lock().await = Some(observer);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(state) = rx.recv().await {
                handle_state(&inner, state).await;
            }
        });
        *self.state_task.lock().await = Some(task);

        self.inner.transport.connect(identity).await?;
        Ok(())
    }

    /// Create a conversation and open it
    pub async fn create_conversation(
        &self,
        title: Option<String>,
    ) -> Result<Conversation, SessionError> {
        let conversation = self.inner.store.create_conversation(title).await?;
        self.join_conversation(conversation.id).await?;

        let ctx = self.inner.plugin_ctx(conversation.id);
        self.inner
            .pipeline
            .track_event(
                "conversation_created",
                &serde_json::json!({ "conversation_id": conversation.id }),
                &ctx,
            )
            .await;
        Ok(conversation)
    }

    /// Open a conversation: mark it current, subscribe to its channel, and
    /// enter presence.
    pub async fn join_conversation(&self, id: ConversationId) -> Result<(), SessionError> {
        self.inner.store.set_current(&id).await?;
        let channel = conversation_channel(&self.inner.config.workspace_id, &id);

        let mut active = self.inner.active.lock().await;
        if let Some(previous) = active.take() {
            leave_conversation(&self.inner, previous).await;
        }

        let subscription = subscribe_channel(&self.inner, &channel).await;
        let presence_sub = subscribe_presence(&self.inner, &channel).await;
        *active = Some(ActiveConversation {
            id,
            channel: channel.clone(),
            subscription: Some(subscription),
            presence_sub: Some(presence_sub),
        });
        drop(active);

        enter_presence(&self.inner, &channel).await;
        tracing::info!(conversation_id = %id, channel = %channel, "Joined conversation");
        Ok(())
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.inner.active.lock().await.as_ref().map(|a| a.id)
    }

    /// Message history of the active conversation, decrypted for display
    pub async fn messages(&self) -> Result<Vec<ChatMessage>, SessionError> {
        let id = self
            .active_conversation()
            .await
            .ok_or(SessionError::NoActiveConversation)?;
        Ok(self.inner.store.get_messages(&id).await?)
    }

    /// Send a message in the active conversation
    ///
    /// The returned message reflects the reconciled status: `Sent` on publish
    /// acknowledgment, `Failed` on publish error (kept visible for retry),
    /// `Sending` when queued during an outage.
    pub async fn send_message(&self, text: &str) -> Result<ChatMessage, SessionError> {
        let inner = &self.inner;
        let _order = inner.send_lock.lock().await;

        let conversation_id = inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|a| a.id)
            .ok_or(SessionError::NoActiveConversation)?;
        let ctx = inner.plugin_ctx(conversation_id);

        let content = inner.pipeline.intercept_outgoing(text.to_string(), &ctx).await;
        let message = ChatMessage::outgoing(conversation_id, content);
        inner.emit(&SessionEvent::MessageAppended(message.clone())).await;

        let sealed = inner.store.append_message(&conversation_id, message.clone()).await?;

        let mut result = message;
        if inner.transport.state().await == ConnectionState::Connected {
            // earlier queued sends go out first even if this call won the
            // lock race against the reconnect flush
            flush_queue_locked(inner).await;
            let status = match publish_message(inner, &sealed).await {
                Ok(()) => MessageStatus::Sent,
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        message_id = %result.id,
                        error = %e,
                        "Publish failed; message kept visible for retry"
                    );
                    MessageStatus::Failed
                }
            };
            result.status = status;
            inner
                .store
                .update_message_status(&conversation_id, &result.id, status)
                .await?;
            inner.emit(&SessionEvent::MessageUpdated(result.clone())).await;
        } else {
            inner.queue.lock().await.push_back(sealed);
            tracing::debug!(
                conversation_id = %conversation_id,
                message_id = %result.id,
                "Connection down; message queued for replay"
            );
        }

        inner
            .pipeline
            .track_event(
                "message_sent",
                &serde_json::json!({
                    "conversation_id": conversation_id,
                    "message_id": result.id,
                    "status": result.status,
                }),
                &ctx,
            )
            .await;
        Ok(result)
    }

    /// Re-publish a message that previously failed
    pub async fn retry_message(&self, id: MessageId) -> Result<ChatMessage, SessionError> {
        let inner = &self.inner;
        let _order = inner.send_lock.lock().await;

        let conversation_id = inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|a| a.id)
            .ok_or(SessionError::NoActiveConversation)?;

        let messages = inner.store.get_messages(&conversation_id).await?;
        let message = messages
            .into_iter()
            .find(|m| m.id == id)
            .ok_or(StoreError::UnknownMessage(id))?;
        if message.status != MessageStatus::Failed {
            return Err(SessionError::NotRetryable(id));
        }

        // republish the sealed form; plaintext stays out of the wire copy
        let mut sealed = message.clone();
        if sealed.encrypted {
            sealed.content = String::new();
        }

        publish_message(inner, &sealed).await?;
        let updated = inner
            .store
            .update_message_status(&conversation_id, &id, MessageStatus::Sent)
            .await?;
        inner.emit(&SessionEvent::MessageUpdated(updated.clone())).await;
        Ok(updated)
    }

    /// Handle one inbound wire payload. Invoked by the channel subscription;
    /// public so hosts driving their own socket can feed messages in.
    pub async fn receive_message(&self, wire: WireMessage) {
        self.inner.receive_message(wire).await;
    }

    /// Render fragments contributed by UI extension plugins for one surface
    pub async fn ui_extensions(&self, location: UiLocation) -> Result<Vec<UiFragment>, SessionError> {
        let id = self
            .active_conversation()
            .await
            .ok_or(SessionError::NoActiveConversation)?;
        let ctx = self.inner.plugin_ctx(id);
        Ok(self.inner.pipeline.ui_extensions(location, &ctx).await)
    }

    /// Presence membership of the active conversation's channel
    pub async fn presence(&self) -> Vec<PresenceRecord> {
        let Some(channel) = self
            .inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|a| a.channel.clone())
        else {
            return Vec::new();
        };
        self.inner.transport.presence_get(&channel).await
    }

    /// Tear the session down: detach the state observer, unsubscribe the
    /// active channel, leave presence, and stop the realtime connection.
    /// Idempotent.
    pub async fn close(&self) {
        if let Some(task) = self.state_task.lock().await.take() {
            task.abort();
        }
        if let Some(observer) = self.state_observer.lock().await.take() {
            observer.dispose().await;
        }

        let mut active = self.inner.active.lock().await;
        if let Some(previous) = active.take() {
            leave_conversation(&self.inner, previous).await;
        }
        drop(active);

        self.inner.transport.close().await;
        tracing::info!("Chat session closed");
    }
}

/// Disposer for a session observer registration
pub struct SessionObserverHandle {
    inner: Arc<SessionInner>,
    id: Uuid,
}

impl SessionObserverHandle {
    pub async fn dispose(self) {
        let mut observers = self.inner.observers.write().await;
        observers.retain(|(id, _)| *id != self.id);
    }
}

impl SessionInner {
    fn plugin_ctx(&self, conversation_id: ConversationId) -> PluginContext {
        PluginContext {
            conversation_id,
            workspace_id: self.config.workspace_id,
        }
    }

    async fn emit(&self, event: &SessionEvent) {
        let observers = self.observers.read().await;
        for (_, observer) in observers.iter() {
            observer(event);
        }
    }

    /// Inbound flow: decrypt, transform, observe, persist, notify
    async fn receive_message(&self, wire: WireMessage) {
        if self.identity.read().await.as_ref() == Some(&wire.sender_client) {
            return; // own echo
        }

        let mut message = wire.message;
        let conversation_id = message.conversation_id;
        if self.store.get_conversation(&conversation_id).await.is_none() {
            tracing::warn!(
                conversation_id = %conversation_id,
                "Dropping message for unknown conversation"
            );
            return;
        }
        let ctx = self.plugin_ctx(conversation_id);

        if message.encrypted {
            message.content = match &message.encrypted_content {
                Some(envelope) => match self.store.crypto().decrypt(&conversation_id, envelope).await {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        tracing::warn!(
                            conversation_id = %conversation_id,
                            message_id = %message.id,
                            error = %e,
                            "Inbound message decryption failed; rendering placeholder"
                        );
                        DECRYPT_PLACEHOLDER.to_string()
                    }
                },
                None => DECRYPT_PLACEHOLDER.to_string(),
            };
        }
        message.status = MessageStatus::Delivered;

        let message = self.pipeline.apply_transforms(message, &ctx).await;
        self.pipeline.intercept_incoming(&message, &ctx).await;

        if let Err(e) = self.store.append_message(&conversation_id, message.clone()).await {
            tracing::error!(
                conversation_id = %conversation_id,
                message_id = %message.id,
                error = %e,
                "Failed to persist received message"
            );
        }
        self.emit(&SessionEvent::MessageAppended(message.clone())).await;

        self.pipeline
            .track_event(
                "message_received",
                &serde_json::json!({
                    "conversation_id": conversation_id,
                    "message_id": message.id,
                }),
                &ctx,
            )
            .await;
    }
}

/// React to one connection state transition, in arrival order
async fn handle_state(inner: &Arc<SessionInner>, state: ConnectionState) {
    inner.emit(&SessionEvent::ConnectionChanged(state)).await;
    match state {
        ConnectionState::Disconnected
        | ConnectionState::Suspended
        | ConnectionState::Failed => {
            inner.offline_seen.store(true, Ordering::SeqCst);
        }
        ConnectionState::Connected => {
            // first Connected after an outage: one re-subscription, then the
            // offline queue replays in original order
            if inner.offline_seen.swap(false, Ordering::SeqCst) {
                resubscribe_active(inner).await;
                flush_queue(inner).await;
            }
        }
        ConnectionState::Connecting => {}
    }
}

async fn resubscribe_active(inner: &Arc<SessionInner>) {
    let mut guard = inner.active.lock().await;
    let Some(active) = guard.as_mut() else {
        return;
    };

    if let Some(subscription) = active.subscription.take() {
        subscription.unsubscribe().await;
    }
    active.subscription = Some(subscribe_channel(inner, &active.channel).await);
    let channel = active.channel.clone();
    drop(guard);

    enter_presence(inner, &channel).await;
    inner
        .emit(&SessionEvent::Resubscribed {
            channel: channel.clone(),
        })
        .await;
    tracing::info!(channel = %channel, "Re-subscribed after reconnect");
}

/// Tear down one conversation's registrations and presence entry
async fn leave_conversation(inner: &Arc<SessionInner>, previous: ActiveConversation) {
    if let Some(subscription) = previous.subscription {
        subscription.unsubscribe().await;
    }
    if let Some(presence_sub) = previous.presence_sub {
        presence_sub.unsubscribe().await;
    }
    if let Err(e) = inner.transport.presence_leave(&previous.channel).await {
        tracing::debug!(channel = %previous.channel, error = %e, "Presence leave skipped");
    }
}

/// Forward presence membership changes on a channel to session observers
async fn subscribe_presence(inner: &Arc<SessionInner>, channel: &str) -> PresenceSubscription {
    let weak = Arc::downgrade(inner);
    inner
        .transport
        .presence_subscribe(
            channel,
            Arc::new(move |event| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let event = SessionEvent::PresenceChanged(event.clone());
                tokio::spawn(async move {
                    inner.emit(&event).await;
                });
            }),
        )
        .await
}

async fn subscribe_channel(inner: &Arc<SessionInner>, channel: &str) -> Subscription {
    let weak = Arc::downgrade(inner);
    inner
        .transport
        .subscribe(
            channel,
            NEW_MESSAGE_EVENT,
            Arc::new(move |payload| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    match serde_json::from_value::<WireMessage>(payload) {
                        Ok(wire) => inner.receive_message(wire).await,
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping malformed wire message");
                        }
                    }
                }
                .boxed()
            }),
        )
        .await
}

async fn enter_presence(inner: &Arc<SessionInner>, channel: &str) {
    let Some(client_id) = inner.identity.read().await.clone() else {
        return;
    };
    let record = PresenceRecord {
        client_id,
        name: inner.config.presence_name.clone(),
        status: PresenceStatus::Online,
    };
    if let Err(e) = inner.transport.presence_enter(channel, record).await {
        tracing::debug!(channel = %channel, error = %e, "Presence enter deferred until reconnect");
        inner.offline_seen.store(true, Ordering::SeqCst);
    }
}

/// Publish one sealed message on its conversation channel
async fn publish_message(inner: &SessionInner, sealed: &ChatMessage) -> Result<(), SessionError> {
    let Some(sender_client) = inner.identity.read().await.clone() else {
        return Err(SessionError::Transport(TransportError::NotConnected));
    };
    let channel = conversation_channel(&inner.config.workspace_id, &sealed.conversation_id);
    let wire = WireMessage {
        sender_client,
        message: sealed.clone(),
    };
    let payload = serde_json::to_value(&wire)
        .map_err(|e| TransportError::PublishFailed(e.to_string()))?;
    inner.transport.publish(&channel, NEW_MESSAGE_EVENT, payload).await?;
    Ok(())
}

/// Replay queued sends in original submission order, exactly once each
async fn flush_queue(inner: &Arc<SessionInner>) {
    let _order = inner.send_lock.lock().await;
    flush_queue_locked(inner).await;
}

/// Drain loop behind `flush_queue`; caller must hold `send_lock` so a
/// concurrent `send_message` cannot publish ahead of earlier queued sends
async fn flush_queue_locked(inner: &Arc<SessionInner>) {
    let drained: Vec<ChatMessage> = inner.queue.lock().await.drain(..).collect();
    if drained.is_empty() {
        return;
    }
    tracing::info!(queued = drained.len(), "Flushing offline message queue");

    for sealed in drained {
        let conversation_id = sealed.conversation_id;
        let status = match publish_message(inner, &sealed).await {
            Ok(()) => MessageStatus::Sent,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    message_id = %sealed.id,
                    error = %e,
                    "Replay publish failed"
                );
                MessageStatus::Failed
            }
        };
        match inner
            .store
            .update_message_status(&conversation_id, &sealed.id, status)
            .await
        {
            Ok(updated) => inner.emit(&SessionEvent::MessageUpdated(updated)).await,
            Err(e) => {
                tracing::error!(message_id = %sealed.id, error = %e, "Failed to reconcile replayed message");
            }
        }
    }
}
