//! End-to-end session flows over the in-process loopback wire

use std::sync::{Arc, Mutex};
use std::time::Duration;

use deskrelay_chat::config::WidgetConfig;
use deskrelay_chat::crypto::{EncryptionService, DECRYPT_PLACEHOLDER};
use deskrelay_chat::events::{SessionEvent, WireMessage, NEW_MESSAGE_EVENT};
use deskrelay_chat::plugins::{Plugin, PluginContext, PluginError, PluginRegistry, TransformHook};
use deskrelay_chat::session::ChatSession;
use deskrelay_chat::store::ConversationStore;
use deskrelay_chat::transport::{
    Frame, InMemoryHub, RealtimeSocket, SocketEvent, TransportProvider,
};
use deskrelay_shared::{
    conversation_channel, keys, ChatMessage, ClientId, ConnectionState, ConversationId,
    MemoryStorage, MessageSender, MessageStatus, WorkspaceId,
};

const BACKOFF: Duration = Duration::from_millis(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

struct Harness {
    hub: Arc<InMemoryHub>,
    session: ChatSession,
    storage: Arc<MemoryStorage>,
    crypto: Arc<EncryptionService>,
    workspace_id: WorkspaceId,
    registry: Arc<PluginRegistry>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl Harness {
    async fn new(encrypted: bool) -> Self {
        init_tracing();
        let workspace_id = WorkspaceId::new();
        let hub = InMemoryHub::new();
        let transport = Arc::new(TransportProvider::with_backoff(
            Arc::new(hub.socket()),
            BACKOFF,
        ));
        let storage = Arc::new(MemoryStorage::new());
        let crypto = Arc::new(EncryptionService::new());
        let store = Arc::new(
            ConversationStore::open(
                workspace_id,
                Arc::clone(&storage) as Arc<dyn deskrelay_shared::Storage>,
                Arc::clone(&crypto),
                encrypted,
            )
            .await
            .unwrap(),
        );
        let registry = Arc::new(PluginRegistry::new());
        let config = WidgetConfig::new(workspace_id, "integration-test-key")
            .with_encryption(encrypted)
            .with_presence_name("Visitor");
        let session = ChatSession::new(config, transport, store, Arc::clone(&registry));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        session
            .observe(Arc::new(move |event: &SessionEvent| {
                sink.lock().unwrap().push(event.clone());
            }))
            .await;

        Self {
            hub,
            session,
            storage,
            crypto,
            workspace_id,
            registry,
            events,
        }
    }

    async fn client_id(&self) -> ClientId {
        deskrelay_chat::client_identity(self.storage.as_ref())
            .await
            .unwrap()
    }

    /// Sever the session's wire and make reopen attempts fail until
    /// [`Self::restore_network`].
    async fn cut_network(&self) {
        self.hub.set_refuse_opens(true);
        self.hub.drop_client(&self.client_id().await).await;
        settle().await;
    }

    async fn restore_network(&self) {
        self.hub.set_refuse_opens(false);
        // leave room for a retry cycle plus the reconnect flush
        tokio::time::sleep(BACKOFF * 5).await;
        settle().await;
    }

    /// Deliver a message as if a remote agent published it
    async fn inject_remote(&self, conversation_id: ConversationId, message: ChatMessage) {
        let sender = ClientId::generate();
        let wire = WireMessage {
            sender_client: sender.clone(),
            message,
        };
        self.hub
            .inject(Frame {
                channel: conversation_channel(&self.workspace_id, &conversation_id),
                event: NEW_MESSAGE_EVENT.to_string(),
                payload: serde_json::to_value(&wire).unwrap(),
                sender,
            })
            .await;
        settle().await;
    }

    fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }
}

/// Raw hub peer recording every message frame it sees, used to assert on
/// what actually crossed the wire
struct WireTap {
    frames: Arc<Mutex<Vec<WireMessage>>>,
}

impl WireTap {
    async fn attach(hub: &Arc<InMemoryHub>) -> Self {
        let socket = hub.socket();
        let mut rx = socket.open(&ClientId::generate()).await.unwrap();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        tokio::spawn(async move {
            // keep the socket alive for the hub's peer table
            let _socket = socket;
            while let Some(event) = rx.recv().await {
                if let SocketEvent::Frame(frame) = event {
                    if frame.event == NEW_MESSAGE_EVENT {
                        if let Ok(wire) = serde_json::from_value::<WireMessage>(frame.payload) {
                            sink.lock().unwrap().push(wire);
                        }
                    }
                }
            }
        });
        Self { frames }
    }

    fn messages(&self) -> Vec<WireMessage> {
        self.frames.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn test_offline_queue_replays_in_order_exactly_once() {
    let harness = Harness::new(false).await;
    let tap = WireTap::attach(&harness.hub).await;

    harness.session.connect().await.unwrap();
    harness.session.create_conversation(None).await.unwrap();
    settle().await;

    harness.cut_network().await;

    let queued_ids: Vec<_> = {
        let mut ids = Vec::new();
        for text in ["first", "second", "third"] {
            let message = harness.session.send_message(text).await.unwrap();
            assert_eq!(message.status, MessageStatus::Sending);
            ids.push(message.id);
        }
        ids
    };
    // nothing crossed the wire while offline (the tap sees only the
    // pre-outage traffic, which is none)
    assert!(tap.messages().is_empty());

    harness.restore_network().await;

    let replayed: Vec<_> = tap.messages();
    assert_eq!(
        replayed.iter().map(|w| w.message.id).collect::<Vec<_>>(),
        queued_ids,
        "queued messages must replay in submission order, once each"
    );

    // the store reconciled every replayed message to Sent
    for message in harness.session.messages().await.unwrap() {
        assert_eq!(message.status, MessageStatus::Sent);
    }
}

#[tokio::test]
async fn test_fresh_send_after_reconnect_does_not_overtake_queue() {
    let harness = Harness::new(false).await;
    let tap = WireTap::attach(&harness.hub).await;

    harness.session.connect().await.unwrap();
    harness.session.create_conversation(None).await.unwrap();
    settle().await;

    harness.cut_network().await;
    let queued_first = harness.session.send_message("queued first").await.unwrap();
    let queued_second = harness.session.send_message("queued second").await.unwrap();

    // race the reconnect flush: fire a fresh send the instant Connected is
    // observable, before the replay has had time to drain
    harness.hub.set_refuse_opens(false);
    loop {
        let connected_again = harness
            .events()
            .iter()
            .filter(|e| matches!(e, SessionEvent::ConnectionChanged(ConnectionState::Connected)))
            .count();
        if connected_again >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let fresh = harness.session.send_message("fresh").await.unwrap();
    settle().await;

    assert_eq!(
        tap.messages().iter().map(|w| w.message.id).collect::<Vec<_>>(),
        vec![queued_first.id, queued_second.id, fresh.id],
        "queued sends must cross the wire before any later-invoked send"
    );
}

#[tokio::test]
async fn test_exactly_one_resubscription_per_reconnect() {
    let harness = Harness::new(false).await;
    harness.session.connect().await.unwrap();
    let conversation = harness.session.create_conversation(None).await.unwrap();
    settle().await;

    harness.cut_network().await;
    harness.restore_network().await;

    let resubscribes = harness
        .events()
        .iter()
        .filter(|e| matches!(e, SessionEvent::Resubscribed { .. }))
        .count();
    assert_eq!(resubscribes, 1);

    // a single live handler: a remote message arrives exactly once
    harness
        .inject_remote(
            conversation.id,
            ChatMessage::new(conversation.id, MessageSender::Agent, "still there?"),
        )
        .await;

    let deliveries = harness
        .session
        .messages()
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.content == "still there?")
        .count();
    assert_eq!(deliveries, 1);
}

#[tokio::test]
async fn test_connection_states_surface_to_observers() {
    let harness = Harness::new(false).await;
    harness.session.connect().await.unwrap();
    harness.session.create_conversation(None).await.unwrap();
    settle().await;

    harness.cut_network().await;
    harness.restore_network().await;

    let states: Vec<_> = harness
        .events()
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ConnectionChanged(state) => Some(*state),
            _ => None,
        })
        .collect();
    assert!(states.contains(&ConnectionState::Disconnected));
    assert!(states.contains(&ConnectionState::Suspended));
    assert_eq!(states.last(), Some(&ConnectionState::Connected));
}

#[tokio::test]
async fn test_encrypted_conversation_never_persists_or_publishes_plaintext() {
    let harness = Harness::new(true).await;
    let tap = WireTap::attach(&harness.hub).await;

    harness.session.connect().await.unwrap();
    let conversation = harness.session.create_conversation(None).await.unwrap();
    settle().await;

    let sent = harness.session.send_message("the launch code").await.unwrap();
    assert_eq!(sent.status, MessageStatus::Sent);
    settle().await;

    let persisted = harness
        .storage
        .raw(&keys::conversation(&conversation.id))
        .await
        .unwrap();
    assert!(!persisted.contains("the launch code"));

    let published = tap.messages();
    assert_eq!(published.len(), 1);
    assert!(published[0].message.content.is_empty());
    assert!(published[0].message.encrypted_content.is_some());

    // a fresh store over the same storage and key service decrypts history
    let reopened = ConversationStore::open(
        harness.workspace_id,
        Arc::clone(&harness.storage) as Arc<dyn deskrelay_shared::Storage>,
        Arc::clone(&harness.crypto),
        true,
    )
    .await
    .unwrap();
    let history = reopened.get_messages(&conversation.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "the launch code");
}

#[tokio::test]
async fn test_undecryptable_remote_message_renders_placeholder() {
    let harness = Harness::new(true).await;
    harness.session.connect().await.unwrap();
    let conversation = harness.session.create_conversation(None).await.unwrap();
    settle().await;

    let mut garbled = ChatMessage::new(conversation.id, MessageSender::Agent, "");
    garbled.encrypted = true;
    garbled.encrypted_content = Some(deskrelay_shared::CipherEnvelope {
        ciphertext: "bm90IHJlYWwgY2lwaGVydGV4dA==".to_string(),
        nonce: "AAAAAAAAAAAAAAAA".to_string(),
    });
    harness.inject_remote(conversation.id, garbled).await;

    let messages = harness.session.messages().await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, DECRYPT_PLACEHOLDER);
    assert_eq!(messages[0].status, MessageStatus::Delivered);
}

struct Banner;
impl TransformHook for Banner {
    fn transform(
        &self,
        mut message: ChatMessage,
        _ctx: &PluginContext,
    ) -> Result<ChatMessage, PluginError> {
        message.content = format!("[agent] {}", message.content);
        Ok(message)
    }
}

struct Broken;
impl TransformHook for Broken {
    fn transform(
        &self,
        _message: ChatMessage,
        _ctx: &PluginContext,
    ) -> Result<ChatMessage, PluginError> {
        Err(PluginError::new("transform blew up"))
    }
}

#[tokio::test]
async fn test_failing_plugin_never_blocks_delivery() {
    let harness = Harness::new(false).await;
    assert!(harness.registry.register(Plugin::transform("broken", Arc::new(Broken))).await);
    assert!(harness.registry.register(Plugin::transform("banner", Arc::new(Banner))).await);
    // a second plugin under an existing id is rejected, not overwritten
    assert!(!harness.registry.register(Plugin::transform("banner", Arc::new(Broken))).await);

    harness.session.connect().await.unwrap();
    let conversation = harness.session.create_conversation(None).await.unwrap();
    settle().await;

    harness
        .inject_remote(
            conversation.id,
            ChatMessage::new(conversation.id, MessageSender::Agent, "hello"),
        )
        .await;

    let messages = harness.session.messages().await.unwrap();
    assert_eq!(messages.len(), 1, "failing transform must not drop the message");
    assert_eq!(messages[0].content, "[agent] hello");
}

#[tokio::test]
async fn test_failed_send_is_retryable() {
    let harness = Harness::new(false).await;
    harness.session.connect().await.unwrap();
    harness.session.create_conversation(None).await.unwrap();
    settle().await;

    // publish rejected while the connection stays up: the message lands in
    // Failed and stays visible
    harness.hub.set_refuse_sends(true);
    let failed = harness.session.send_message("lost on the wire").await.unwrap();
    assert_eq!(failed.status, MessageStatus::Failed);

    harness.hub.set_refuse_sends(false);
    let retried = harness.session.retry_message(failed.id).await.unwrap();
    assert_eq!(retried.status, MessageStatus::Sent);
}
