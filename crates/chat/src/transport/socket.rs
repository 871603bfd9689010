//! Raw realtime wire collaborator
//!
//! The provider talks to the network through the [`RealtimeSocket`] trait so
//! the engine never depends on a concrete realtime service SDK. Production
//! hosts supply their own implementation; [`InMemoryHub`] wires widget
//! instances together in-process for tests and local demos.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use deskrelay_shared::ClientId;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use super::TransportError;

/// One frame on the wire: a named event on a named channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub channel: String,
    pub event: String,
    pub payload: serde_json::Value,
    /// Client that published the frame
    pub sender: ClientId,
}

/// Socket-level notification delivered to the provider's read loop
#[derive(Debug)]
pub enum SocketEvent {
    /// An inbound frame to dispatch
    Frame(Frame),
    /// The wire dropped; the provider decides how to recover
    Dropped,
}

/// The raw wire the provider drives
///
/// `open` yields the inbound event stream for one connection attempt; a fresh
/// call after a drop yields a fresh stream. `send` resolves on wire-level
/// acknowledgment.
#[async_trait]
pub trait RealtimeSocket: Send + Sync {
    async fn open(
        &self,
        identity: &ClientId,
    ) -> Result<mpsc::UnboundedReceiver<SocketEvent>, TransportError>;

    async fn send(&self, frame: Frame) -> Result<(), TransportError>;
}

// =============================================================================
// In-process loopback wire
// =============================================================================

/// Hub connecting in-process sockets; every frame sent by any connected peer
/// is reflected to all connected peers, the sender included (subscribers
/// dedupe by `Frame::sender`).
#[derive(Default)]
pub struct InMemoryHub {
    peers: RwLock<HashMap<ClientId, mpsc::UnboundedSender<SocketEvent>>>,
    refuse_opens: AtomicBool,
    refuse_sends: AtomicBool,
}

impl InMemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a socket attached to this hub
    pub fn socket(self: &Arc<Self>) -> InMemorySocket {
        InMemorySocket {
            hub: Arc::clone(self),
            identity: RwLock::new(None),
        }
    }

    /// Make subsequent `open` calls fail, simulating an unreachable service
    pub fn set_refuse_opens(&self, refuse: bool) {
        self.refuse_opens.store(refuse, Ordering::SeqCst);
    }

    /// Make `send` fail while connections stay up, simulating a publish NACK
    pub fn set_refuse_sends(&self, refuse: bool) {
        self.refuse_sends.store(refuse, Ordering::SeqCst);
    }

    /// Sever one peer's connection, simulating a network drop
    pub async fn drop_client(&self, client_id: &ClientId) {
        let mut peers = self.peers.write().await;
        if let Some(tx) = peers.remove(client_id) {
            let _ = tx.send(SocketEvent::Dropped);
        }
    }

    /// Inject a frame as if it arrived from a remote peer
    pub async fn inject(&self, frame: Frame) {
        self.broadcast(frame).await;
    }

    async fn broadcast(&self, frame: Frame) {
        let peers = self.peers.read().await;
        for tx in peers.values() {
            let _ = tx.send(SocketEvent::Frame(frame.clone()));
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

/// Loopback socket for one widget instance
pub struct InMemorySocket {
    hub: Arc<InMemoryHub>,
    identity: RwLock<Option<ClientId>>,
}

#[async_trait]
impl RealtimeSocket for InMemorySocket {
    async fn open(
        &self,
        identity: &ClientId,
    ) -> Result<mpsc::UnboundedReceiver<SocketEvent>, TransportError> {
        if self.hub.refuse_opens.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed(
                "realtime service unreachable".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.hub
            .peers
            .write()
            .await
            .insert(identity.clone(), tx);
        *self.identity.write().await = Some(identity.clone());
        Ok(rx)
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.hub.refuse_sends.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed(
                "publish rejected".to_string(),
            ));
        }
        let connected = match self.identity.read().await.as_ref() {
            Some(id) => self.hub.peers.read().await.contains_key(id),
            None => false,
        };
        if !connected {
            return Err(TransportError::SocketClosed);
        }
        self.hub.broadcast(frame).await;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn frame(sender: &ClientId) -> Frame {
        Frame {
            channel: "workspace:w:c".to_string(),
            event: "test".to_string(),
            payload: serde_json::json!({"n": 1}),
            sender: sender.clone(),
        }
    }

    #[tokio::test]
    async fn test_frames_reach_all_peers() {
        let hub = InMemoryHub::new();
        let a = hub.socket();
        let b = hub.socket();

        let id_a = ClientId::generate();
        let id_b = ClientId::generate();
        let mut rx_a = a.open(&id_a).await.unwrap();
        let mut rx_b = b.open(&id_b).await.unwrap();
        assert_eq!(hub.peer_count().await, 2);

        a.send(frame(&id_a)).await.unwrap();

        assert!(matches!(rx_a.try_recv().unwrap(), SocketEvent::Frame(_)));
        assert!(matches!(rx_b.try_recv().unwrap(), SocketEvent::Frame(_)));
    }

    #[tokio::test]
    async fn test_dropped_peer_gets_notified_and_cannot_send() {
        let hub = InMemoryHub::new();
        let socket = hub.socket();
        let id = ClientId::generate();
        let mut rx = socket.open(&id).await.unwrap();

        hub.drop_client(&id).await;
        assert_eq!(hub.peer_count().await, 0);

        assert!(matches!(rx.try_recv().unwrap(), SocketEvent::Dropped));
        assert!(matches!(
            socket.send(frame(&id)).await,
            Err(TransportError::SocketClosed)
        ));
    }

    #[tokio::test]
    async fn test_refused_open() {
        let hub = InMemoryHub::new();
        let socket = hub.socket();
        hub.set_refuse_opens(true);

        let err = socket.open(&ClientId::generate()).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed(_)));
    }
}
