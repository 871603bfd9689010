//! Plugin registry
//!
//! Explicitly constructed and dependency-injected; there is no ambient
//! singleton, so tests create isolated registries. Registration order is the
//! stable execution-order contract for every pipeline.

use deskrelay_shared::PluginId;
use tokio::sync::RwLock;

use super::{Plugin, PluginKind};

/// Holds registered plugins in registration order
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<Vec<Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Returns false (without modifying the registry) when
    /// the id is already taken; a duplicate never overwrites the original.
    pub async fn register(&self, plugin: Plugin) -> bool {
        let mut plugins = self.plugins.write().await;
        if plugins.iter().any(|p| p.id == plugin.id) {
            tracing::warn!(plugin_id = %plugin.id, "Rejected duplicate plugin registration");
            return false;
        }
        tracing::debug!(plugin_id = %plugin.id, kind = ?plugin.kind(), "Plugin registered");
        plugins.push(plugin);
        true
    }

    /// Remove a plugin by id. Returns false when absent.
    pub async fn unregister(&self, id: &PluginId) -> bool {
        let mut plugins = self.plugins.write().await;
        let before = plugins.len();
        plugins.retain(|p| &p.id != id);
        plugins.len() < before
    }

    pub async fn get_by_id(&self, id: &PluginId) -> Option<Plugin> {
        self.plugins.read().await.iter().find(|p| &p.id == id).cloned()
    }

    /// All plugins of one capability variant, in registration order — the
    /// only defined ordering; pipelines must not reorder.
    pub async fn get_by_kind(&self, kind: PluginKind) -> Vec<Plugin> {
        self.plugins
            .read()
            .await
            .iter()
            .filter(|p| p.kind() == kind)
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<Plugin> {
        self.plugins.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.plugins.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.plugins.read().await.is_empty()
    }
}
