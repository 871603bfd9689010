//! Per-conversation message encryption
//!
//! One AES-256-GCM key per encrypted conversation. Keys are generated here,
//! stored here, and never leave this service in plaintext form; the rest of
//! the engine requests en/decryption by conversation id and holds no key
//! material beyond the call stack of a single operation.

use std::collections::HashMap;

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use deskrelay_shared::{CipherEnvelope, ConversationId};
use rand::RngCore;
use tokio::sync::RwLock;

/// Rendered in place of message content that cannot be decrypted. The raw
/// failed bytes are never shown.
pub const DECRYPT_PLACEHOLDER: &str = "[unable to decrypt]";

/// AES-256-GCM nonce length in bytes
const NONCE_LEN: usize = 12;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Conversation already has an encryption key")]
    KeyExists,
    #[error("No encryption key for conversation")]
    NoKey,
    #[error("Encryption failed")]
    Encryption,
    #[error("Decryption failed")]
    Decryption,
    #[error("Invalid encryption key")]
    InvalidKey,
}

// =============================================================================
// Encryption Service
// =============================================================================

/// Symmetric key lifecycle plus message-level encryption
#[derive(Default)]
pub struct EncryptionService {
    keys: RwLock<HashMap<ConversationId, [u8; 32]>>,
}

impl EncryptionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate and store a fresh key for a conversation
    ///
    /// Fails with [`CryptoError::KeyExists`] if one is already present; an
    /// existing key is never silently overwritten.
    pub async fn setup_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), CryptoError> {
        let mut keys = self.keys.write().await;
        if keys.contains_key(&conversation_id) {
            return Err(CryptoError::KeyExists);
        }

        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        keys.insert(conversation_id, key);

        tracing::debug!(conversation_id = %conversation_id, "Conversation encryption key provisioned");
        Ok(())
    }

    /// Whether a key exists for a conversation. Keys are never regenerated
    /// implicitly.
    pub async fn has_key(&self, conversation_id: &ConversationId) -> bool {
        self.keys.read().await.contains_key(conversation_id)
    }

    /// Encrypt plaintext under a conversation's key
    ///
    /// A fresh random 96-bit nonce is drawn per message. Never returns
    /// partial output.
    pub async fn encrypt(
        &self,
        conversation_id: &ConversationId,
        plaintext: &str,
    ) -> Result<CipherEnvelope, CryptoError> {
        let key = self.key_for(conversation_id).await?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::InvalidKey)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encryption)?;

        Ok(CipherEnvelope {
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce_bytes),
        })
    }

    /// Decrypt an envelope under a conversation's key
    ///
    /// Fails with [`CryptoError::Decryption`] on tamper or key mismatch;
    /// callers must render [`DECRYPT_PLACEHOLDER`], never the failed bytes.
    pub async fn decrypt(
        &self,
        conversation_id: &ConversationId,
        envelope: &CipherEnvelope,
    ) -> Result<String, CryptoError> {
        let key = self.key_for(conversation_id).await?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::InvalidKey)?;

        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|_| CryptoError::Decryption)?;
        let nonce_bytes = BASE64
            .decode(&envelope.nonce)
            .map_err(|_| CryptoError::Decryption)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CryptoError::Decryption);
        }

        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| CryptoError::Decryption)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption)
    }

    async fn key_for(&self, conversation_id: &ConversationId) -> Result<[u8; 32], CryptoError> {
        self.keys
            .read()
            .await
            .get(conversation_id)
            .copied()
            .ok_or(CryptoError::NoKey)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_setup_rejects_second_key() {
        let crypto = EncryptionService::new();
        let conv = ConversationId::new();

        crypto.setup_conversation(conv).await.unwrap();
        assert!(matches!(
            crypto.setup_conversation(conv).await,
            Err(CryptoError::KeyExists)
        ));
        assert!(crypto.has_key(&conv).await);
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_roundtrip() {
        let crypto = EncryptionService::new();
        let conv = ConversationId::new();
        crypto.setup_conversation(conv).await.unwrap();

        for plaintext in ["hello", "", "emoji ✨ and ünïcode"] {
            let envelope = crypto.encrypt(&conv, plaintext).await.unwrap();
            assert!(BASE64.decode(&envelope.ciphertext).is_ok());
            let decrypted = crypto.decrypt(&conv, &envelope).await.unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[tokio::test]
    async fn test_decrypt_with_wrong_key_fails() {
        let crypto = EncryptionService::new();
        let conv_a = ConversationId::new();
        let conv_b = ConversationId::new();
        crypto.setup_conversation(conv_a).await.unwrap();
        crypto.setup_conversation(conv_b).await.unwrap();

        let envelope = crypto.encrypt(&conv_a, "secret").await.unwrap();
        assert!(matches!(
            crypto.decrypt(&conv_b, &envelope).await,
            Err(CryptoError::Decryption)
        ));
    }

    #[tokio::test]
    async fn test_decrypt_tampered_ciphertext_fails() {
        let crypto = EncryptionService::new();
        let conv = ConversationId::new();
        crypto.setup_conversation(conv).await.unwrap();

        let mut envelope = crypto.encrypt(&conv, "secret").await.unwrap();
        let mut raw = BASE64.decode(&envelope.ciphertext).unwrap();
        raw[0] ^= 0xff;
        envelope.ciphertext = BASE64.encode(raw);

        assert!(matches!(
            crypto.decrypt(&conv, &envelope).await,
            Err(CryptoError::Decryption)
        ));
    }

    #[tokio::test]
    async fn test_missing_key_is_an_error_not_a_regeneration() {
        let crypto = EncryptionService::new();
        let conv = ConversationId::new();

        assert!(matches!(
            crypto.encrypt(&conv, "x").await,
            Err(CryptoError::NoKey)
        ));
        assert!(!crypto.has_key(&conv).await);
    }

    #[tokio::test]
    async fn test_nonces_are_unique_per_message() {
        let crypto = EncryptionService::new();
        let conv = ConversationId::new();
        crypto.setup_conversation(conv).await.unwrap();

        let a = crypto.encrypt(&conv, "same").await.unwrap();
        let b = crypto.encrypt(&conv, "same").await.unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}
