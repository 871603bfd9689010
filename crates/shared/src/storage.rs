//! Persistent storage collaborator
//!
//! The engine persists conversation state through a small key/value trait so
//! embedding hosts can plug in whatever the platform offers (browser local
//! storage behind WASM, a file in desktop shells). Values are JSON strings;
//! the engine owns the encoding.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{ConversationId, WorkspaceId};

/// Storage keys used by the conversation engine
///
/// Key shapes are part of the external interface; changing them orphans
/// existing widget installs.
pub mod keys {
    use super::*;

    /// Conversation list for a workspace
    pub fn conversations(workspace_id: &WorkspaceId) -> String {
        format!("chat_conversations_{}", workspace_id)
    }

    /// Message record for one conversation
    pub fn conversation(conversation_id: &ConversationId) -> String {
        format!("chat_conversation_{}", conversation_id)
    }

    /// Currently open conversation for a workspace
    pub fn current_conversation(workspace_id: &WorkspaceId) -> String {
        format!("chat_current_conversation_{}", workspace_id)
    }

    /// Per-install realtime client identity
    pub const CLIENT_ID: &str = "chat_client_id";
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage read failed: {0}")]
    Read(String),
    #[error("Storage write failed: {0}")]
    Write(String),
}

/// Key/value storage collaborator
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn put(&self, key: &str, value: String) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory storage used by tests and local demos
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw snapshot of a stored value, for assertions on the persisted form
    pub async fn raw(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
