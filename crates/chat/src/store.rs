//! Conversation and message persistence
//!
//! CRUD over conversations and message history, persisted as JSON through the
//! storage collaborator and keyed by workspace and conversation id. When a
//! conversation is flagged encrypted, content is sealed through the
//! encryption service on the way down and decrypted on the way up; the
//! persisted representation never contains plaintext for an encrypted
//! conversation.

use std::sync::Arc;

use deskrelay_shared::{
    keys, ChatMessage, Conversation, ConversationId, MessageId, MessageSender, MessageStatus,
    Storage, StorageError, WorkspaceId,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::crypto::{CryptoError, EncryptionService, DECRYPT_PLACEHOLDER};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Unknown conversation: {0}")]
    UnknownConversation(ConversationId),

    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),

    #[error("Corrupt record for conversation {0}: {1}")]
    Corrupt(ConversationId, String),

    #[error("Corrupt conversation index: {0}")]
    CorruptIndex(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Persisted shape of one conversation's history
#[derive(Debug, Serialize, Deserialize)]
struct ConversationRecord {
    messages: Vec<ChatMessage>,
    encrypted: bool,
    #[serde(with = "time::serde::rfc3339")]
    last_updated: OffsetDateTime,
}

/// Owns conversation metadata and message history for one workspace
pub struct ConversationStore {
    workspace_id: WorkspaceId,
    storage: Arc<dyn Storage>,
    crypto: Arc<EncryptionService>,
    encryption_enabled: bool,
    conversations: RwLock<Vec<Conversation>>,
}

impl ConversationStore {
    /// Open the store for a workspace, hydrating the conversation list from
    /// storage.
    pub async fn open(
        workspace_id: WorkspaceId,
        storage: Arc<dyn Storage>,
        crypto: Arc<EncryptionService>,
        encryption_enabled: bool,
    ) -> Result<Self, StoreError> {
        let conversations = match storage.get(&keys::conversations(&workspace_id)).await? {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| StoreError::CorruptIndex(e.to_string()))?,
            None => Vec::new(),
        };

        Ok(Self {
            workspace_id,
            storage,
            crypto,
            encryption_enabled,
            conversations: RwLock::new(conversations),
        })
    }

    pub fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    pub fn crypto(&self) -> Arc<EncryptionService> {
        Arc::clone(&self.crypto)
    }

    pub fn encryption_enabled(&self) -> bool {
        self.encryption_enabled
    }

    // -------------------------------------------------------------------------
    // Conversations
    // -------------------------------------------------------------------------

    /// Create a conversation, provisioning an encryption key when
    /// session-wide encryption is enabled.
    pub async fn create_conversation(
        &self,
        title: Option<String>,
    ) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new(title, self.encryption_enabled);
        if self.encryption_enabled {
            self.crypto.setup_conversation(conversation.id).await?;
        }

        self.conversations.write().await.push(conversation.clone());
        self.persist_index().await?;
        self.persist_record(
            &conversation.id,
            &ConversationRecord {
                messages: Vec::new(),
                encrypted: conversation.encrypted,
                last_updated: OffsetDateTime::now_utc(),
            },
        )
        .await?;

        tracing::info!(
            conversation_id = %conversation.id,
            workspace_id = %self.workspace_id,
            encrypted = conversation.encrypted,
            "Conversation created"
        );
        Ok(conversation)
    }

    pub async fn list_conversations(&self) -> Vec<Conversation> {
        self.conversations.read().await.clone()
    }

    pub async fn get_conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.conversations.read().await.iter().find(|c| &c.id == id).cloned()
    }

    /// Currently open conversation for this workspace, if any
    pub async fn current_conversation(&self) -> Result<Option<ConversationId>, StoreError> {
        let Some(raw) = self
            .storage
            .get(&keys::current_conversation(&self.workspace_id))
            .await?
        else {
            return Ok(None);
        };
        match Uuid::parse_str(&raw) {
            Ok(id) => Ok(Some(ConversationId::from(id))),
            Err(e) => {
                tracing::warn!(workspace_id = %self.workspace_id, error = %e, "Discarding corrupt current-conversation key");
                Ok(None)
            }
        }
    }

    /// Mark a conversation current and clear its unread counter
    pub async fn set_current(&self, id: &ConversationId) -> Result<(), StoreError> {
        if self.get_conversation(id).await.is_none() {
            return Err(StoreError::UnknownConversation(*id));
        }
        self.storage
            .put(
                &keys::current_conversation(&self.workspace_id),
                id.to_string(),
            )
            .await?;

        {
            let mut conversations = self.conversations.write().await;
            if let Some(conv) = conversations.iter_mut().find(|c| &c.id == id) {
                conv.unread_count = 0;
            }
        }
        self.persist_index().await
    }

    // -------------------------------------------------------------------------
    // Messages
    // -------------------------------------------------------------------------

    /// Load a conversation's history, decrypting sealed content.
    ///
    /// A message that fails to decrypt comes back with
    /// [`DECRYPT_PLACEHOLDER`] as its content; failures are isolated per
    /// message and never abort the load.
    pub async fn get_messages(
        &self,
        id: &ConversationId,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let record = self.load_record(id).await?;
        let mut messages = record.messages;

        if record.encrypted {
            for message in &mut messages {
                if !message.encrypted {
                    continue;
                }
                message.content = match &message.encrypted_content {
                    Some(envelope) => match self.crypto.decrypt(id, envelope).await {
                        Ok(plaintext) => plaintext,
                        Err(e) => {
                            tracing::warn!(
                                conversation_id = %id,
                                message_id = %message.id,
                                error = %e,
                                "Message decryption failed; rendering placeholder"
                            );
                            DECRYPT_PLACEHOLDER.to_string()
                        }
                    },
                    None => {
                        tracing::warn!(
                            conversation_id = %id,
                            message_id = %message.id,
                            "Encrypted message has no envelope; rendering placeholder"
                        );
                        DECRYPT_PLACEHOLDER.to_string()
                    }
                };
            }
        }

        Ok(messages)
    }

    /// Replace a conversation's history, sealing any message not already
    /// sealed. Idempotent: already-encrypted messages are not re-encrypted,
    /// so ciphertext is stable across repeated saves. Returns the persisted
    /// forms.
    pub async fn save_messages(
        &self,
        id: &ConversationId,
        messages: Vec<ChatMessage>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let conversation = self
            .get_conversation(id)
            .await
            .ok_or(StoreError::UnknownConversation(*id))?;

        let mut sealed = Vec::with_capacity(messages.len());
        for message in messages {
            sealed.push(self.seal(conversation.encrypted, message).await?);
        }

        self.persist_record(
            id,
            &ConversationRecord {
                messages: sealed.clone(),
                encrypted: conversation.encrypted,
                last_updated: OffsetDateTime::now_utc(),
            },
        )
        .await?;
        self.update_summary(id, sealed.last()).await?;
        Ok(sealed)
    }

    /// Append one message to a conversation's history. Returns the persisted
    /// (sealed) form.
    pub async fn append_message(
        &self,
        id: &ConversationId,
        message: ChatMessage,
    ) -> Result<ChatMessage, StoreError> {
        let conversation = self
            .get_conversation(id)
            .await
            .ok_or(StoreError::UnknownConversation(*id))?;

        let sealed = self.seal(conversation.encrypted, message).await?;
        let mut record = self.load_record(id).await?;
        record.messages.push(sealed.clone());
        record.last_updated = OffsetDateTime::now_utc();
        self.persist_record(id, &record).await?;

        if sealed.sender == MessageSender::Agent {
            let mut conversations = self.conversations.write().await;
            if let Some(conv) = conversations.iter_mut().find(|c| &c.id == id) {
                conv.unread_count += 1;
            }
        }
        self.update_summary(id, Some(&sealed)).await?;
        Ok(sealed)
    }

    /// Update one message's delivery status in place
    pub async fn update_message_status(
        &self,
        id: &ConversationId,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> Result<ChatMessage, StoreError> {
        let mut record = self.load_record(id).await?;
        let message = record
            .messages
            .iter_mut()
            .find(|m| &m.id == message_id)
            .ok_or(StoreError::UnknownMessage(*message_id))?;
        message.status = status;
        let updated = message.clone();
        record.last_updated = OffsetDateTime::now_utc();
        self.persist_record(id, &record).await?;
        Ok(updated)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Seal a message for persistence. Plaintext never reaches storage for an
    /// encrypted conversation: unsealed content is encrypted, and the
    /// persisted copy's `content` field is always blanked.
    async fn seal(
        &self,
        conversation_encrypted: bool,
        mut message: ChatMessage,
    ) -> Result<ChatMessage, StoreError> {
        if !conversation_encrypted {
            return Ok(message);
        }
        if !message.encrypted {
            let envelope = self
                .crypto
                .encrypt(&message.conversation_id, &message.content)
                .await?;
            message.encrypted = true;
            message.encrypted_content = Some(envelope);
        }
        message.content = String::new();
        Ok(message)
    }

    async fn load_record(&self, id: &ConversationId) -> Result<ConversationRecord, StoreError> {
        match self.storage.get(&keys::conversation(id)).await? {
            Some(json) => {
                serde_json::from_str(&json).map_err(|e| StoreError::Corrupt(*id, e.to_string()))
            }
            None => {
                let conversation = self
                    .get_conversation(id)
                    .await
                    .ok_or(StoreError::UnknownConversation(*id))?;
                Ok(ConversationRecord {
                    messages: Vec::new(),
                    encrypted: conversation.encrypted,
                    last_updated: OffsetDateTime::now_utc(),
                })
            }
        }
    }

    async fn persist_record(
        &self,
        id: &ConversationId,
        record: &ConversationRecord,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)
            .map_err(|e| StoreError::Corrupt(*id, e.to_string()))?;
        self.storage.put(&keys::conversation(id), json).await?;
        Ok(())
    }

    async fn persist_index(&self) -> Result<(), StoreError> {
        let conversations = self.conversations.read().await;
        let json = serde_json::to_string(&*conversations)
            .map_err(|e| StoreError::CorruptIndex(e.to_string()))?;
        self.storage
            .put(&keys::conversations(&self.workspace_id), json)
            .await?;
        Ok(())
    }

    /// Refresh the owning conversation's summary from the final message.
    /// Encrypted conversations keep no plaintext preview in the index.
    async fn update_summary(
        &self,
        id: &ConversationId,
        last: Option<&ChatMessage>,
    ) -> Result<(), StoreError> {
        {
            let mut conversations = self.conversations.write().await;
            let Some(conv) = conversations.iter_mut().find(|c| &c.id == id) else {
                return Err(StoreError::UnknownConversation(*id));
            };
            match last {
                Some(message) => {
                    conv.last_message = if conv.encrypted {
                        None
                    } else {
                        Some(message.content.clone())
                    };
                    conv.last_message_at = Some(message.created_at);
                }
                None => {
                    conv.last_message = None;
                    conv.last_message_at = None;
                }
            }
        }
        self.persist_index().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use deskrelay_shared::MemoryStorage;

    async fn plain_store(storage: Arc<MemoryStorage>) -> ConversationStore {
        ConversationStore::open(
            WorkspaceId::new(),
            storage,
            Arc::new(EncryptionService::new()),
            false,
        )
        .await
        .unwrap()
    }

    async fn encrypted_store(storage: Arc<MemoryStorage>) -> ConversationStore {
        ConversationStore::open(
            WorkspaceId::new(),
            storage,
            Arc::new(EncryptionService::new()),
            true,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_list_conversations() {
        let storage = Arc::new(MemoryStorage::new());
        let store = plain_store(Arc::clone(&storage)).await;

        let conv = store
            .create_conversation(Some("Billing question".to_string()))
            .await
            .unwrap();
        assert!(!conv.encrypted);

        let listed = store.list_conversations().await;
        assert_eq!(listed, vec![conv.clone()]);

        // the index is persisted
        let raw = storage
            .raw(&keys::conversations(&store.workspace_id()))
            .await
            .unwrap();
        assert!(raw.contains("Billing question"));
    }

    #[tokio::test]
    async fn test_plaintext_save_and_load() {
        let storage = Arc::new(MemoryStorage::new());
        let store = plain_store(storage).await;
        let conv = store.create_conversation(None).await.unwrap();

        let msg = ChatMessage::outgoing(conv.id, "hello");
        store.append_message(&conv.id, msg.clone()).await.unwrap();

        let loaded = store.get_messages(&conv.id).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content, "hello");

        let summary = store.get_conversation(&conv.id).await.unwrap();
        assert_eq!(summary.last_message.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_encrypted_record_contains_no_plaintext() {
        let storage = Arc::new(MemoryStorage::new());
        let store = encrypted_store(Arc::clone(&storage)).await;
        let conv = store.create_conversation(None).await.unwrap();
        assert!(conv.encrypted);

        store
            .append_message(&conv.id, ChatMessage::outgoing(conv.id, "top secret"))
            .await
            .unwrap();

        let raw = storage.raw(&keys::conversation(&conv.id)).await.unwrap();
        assert!(!raw.contains("top secret"));

        // plaintext round-trips through the decrypting read path
        let loaded = store.get_messages(&conv.id).await.unwrap();
        assert_eq!(loaded[0].content, "top secret");
        assert!(loaded[0].encrypted);

        // and the index carries no plaintext preview
        let summary = store.get_conversation(&conv.id).await.unwrap();
        assert_eq!(summary.last_message, None);
    }

    #[tokio::test]
    async fn test_double_save_does_not_reencrypt() {
        let storage = Arc::new(MemoryStorage::new());
        let store = encrypted_store(storage).await;
        let conv = store.create_conversation(None).await.unwrap();

        let sealed = store
            .save_messages(&conv.id, vec![ChatMessage::outgoing(conv.id, "hi")])
            .await
            .unwrap();
        let first_envelope = sealed[0].encrypted_content.clone().unwrap();

        let resealed = store.save_messages(&conv.id, sealed).await.unwrap();
        assert_eq!(
            resealed[0].encrypted_content.clone().unwrap(),
            first_envelope
        );
    }

    #[tokio::test]
    async fn test_decryption_failure_is_isolated_per_message() {
        let storage = Arc::new(MemoryStorage::new());
        let store = encrypted_store(Arc::clone(&storage)).await;
        let conv = store.create_conversation(None).await.unwrap();

        store
            .save_messages(
                &conv.id,
                vec![
                    ChatMessage::outgoing(conv.id, "first"),
                    ChatMessage::outgoing(conv.id, "second"),
                ],
            )
            .await
            .unwrap();

        // corrupt the first message's ciphertext in the persisted record
        let raw = storage.raw(&keys::conversation(&conv.id)).await.unwrap();
        let mut record: serde_json::Value = serde_json::from_str(&raw).unwrap();
        record["messages"][0]["encrypted_content"]["ciphertext"] =
            serde_json::json!("dGFtcGVyZWQ=");
        storage
            .put(&keys::conversation(&conv.id), record.to_string())
            .await
            .unwrap();

        let loaded = store.get_messages(&conv.id).await.unwrap();
        assert_eq!(loaded[0].content, DECRYPT_PLACEHOLDER);
        assert_eq!(loaded[1].content, "second");
    }

    #[tokio::test]
    async fn test_status_update_persists() {
        let storage = Arc::new(MemoryStorage::new());
        let store = plain_store(storage).await;
        let conv = store.create_conversation(None).await.unwrap();

        let msg = store
            .append_message(&conv.id, ChatMessage::outgoing(conv.id, "hi"))
            .await
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Sending);

        store
            .update_message_status(&conv.id, &msg.id, MessageStatus::Sent)
            .await
            .unwrap();
        let loaded = store.get_messages(&conv.id).await.unwrap();
        assert_eq!(loaded[0].status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_current_conversation_and_unread_reset() {
        let storage = Arc::new(MemoryStorage::new());
        let store = plain_store(storage).await;
        let conv = store.create_conversation(None).await.unwrap();

        assert_eq!(store.current_conversation().await.unwrap(), None);

        store
            .append_message(
                &conv.id,
                ChatMessage::new(conv.id, MessageSender::Agent, "hi there"),
            )
            .await
            .unwrap();
        assert_eq!(
            store.get_conversation(&conv.id).await.unwrap().unread_count,
            1
        );

        store.set_current(&conv.id).await.unwrap();
        assert_eq!(store.current_conversation().await.unwrap(), Some(conv.id));
        assert_eq!(
            store.get_conversation(&conv.id).await.unwrap().unread_count,
            0
        );
    }

    #[tokio::test]
    async fn test_unknown_conversation_errors() {
        let storage = Arc::new(MemoryStorage::new());
        let store = plain_store(storage).await;
        let ghost = ConversationId::new();

        assert!(matches!(
            store.get_messages(&ghost).await,
            Err(StoreError::UnknownConversation(_))
        ));
        assert!(matches!(
            store.set_current(&ghost).await,
            Err(StoreError::UnknownConversation(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_hydrates_index() {
        let storage = Arc::new(MemoryStorage::new());
        let crypto = Arc::new(EncryptionService::new());
        let workspace_id = WorkspaceId::new();

        let conv = {
            let store = ConversationStore::open(
                workspace_id,
                Arc::clone(&storage) as Arc<dyn Storage>,
                Arc::clone(&crypto),
                false,
            )
            .await
            .unwrap();
            store.create_conversation(Some("persisted".to_string())).await.unwrap()
        };

        let reopened = ConversationStore::open(
            workspace_id,
            storage,
            crypto,
            false,
        )
        .await
        .unwrap();
        assert_eq!(reopened.list_conversations().await, vec![conv]);
    }
}
