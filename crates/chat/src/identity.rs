//! Per-install realtime client identity
//!
//! A UUID generated once, persisted through the storage collaborator, and
//! reused as the realtime client id across sessions.

use deskrelay_shared::{keys, ClientId, Storage, StorageError};
use uuid::Uuid;

/// Load the persisted client identity, generating and persisting a fresh one
/// on first run (or when the stored value is malformed).
pub async fn client_identity(storage: &dyn Storage) -> Result<ClientId, StorageError> {
    if let Some(existing) = storage.get(keys::CLIENT_ID).await? {
        if Uuid::parse_str(&existing).is_ok() {
            return Ok(ClientId(existing));
        }
        tracing::warn!("Stored client identity is malformed; regenerating");
    }

    let identity = ClientId::generate();
    storage.put(keys::CLIENT_ID, identity.0.clone()).await?;
    tracing::info!(client_id = %identity, "Generated realtime client identity");
    Ok(identity)
}
