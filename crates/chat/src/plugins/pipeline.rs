//! Ordered, fault-isolated hook execution
//!
//! Every pipeline walks the full registration-ordered set for its capability.
//! A failing hook is logged and skipped for that invocation — its output is
//! discarded and the chain continues from the last good value. One
//! misbehaving plugin must never block message delivery for a tenant.

use std::sync::Arc;

use deskrelay_shared::ChatMessage;

use super::{PluginBehavior, PluginContext, PluginKind, PluginRegistry, UiFragment, UiLocation};

/// Executes plugin chains over a shared registry
#[derive(Clone)]
pub struct PluginPipeline {
    registry: Arc<PluginRegistry>,
}

impl PluginPipeline {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Pipe a message through every Transform plugin sequentially, each
    /// consuming the previous plugin's output.
    pub async fn apply_transforms(
        &self,
        message: ChatMessage,
        ctx: &PluginContext,
    ) -> ChatMessage {
        let mut current = message;
        for plugin in self.registry.get_by_kind(PluginKind::Transform).await {
            let PluginBehavior::Transform(hook) = &plugin.behavior else {
                continue;
            };
            match hook.transform(current.clone(), ctx) {
                Ok(next) => current = next,
                Err(e) => {
                    tracing::warn!(
                        plugin_id = %plugin.id,
                        conversation_id = %ctx.conversation_id,
                        error = %e,
                        "Transform plugin failed; skipping"
                    );
                }
            }
        }
        current
    }

    /// Chain outgoing content through every Intercept plugin's `before_send`.
    pub async fn intercept_outgoing(&self, content: String, ctx: &PluginContext) -> String {
        let mut current = content;
        for plugin in self.registry.get_by_kind(PluginKind::Intercept).await {
            let PluginBehavior::Intercept(hook) = &plugin.behavior else {
                continue;
            };
            match hook.before_send(current.clone(), ctx) {
                Ok(next) => current = next,
                Err(e) => {
                    tracing::warn!(
                        plugin_id = %plugin.id,
                        conversation_id = %ctx.conversation_id,
                        error = %e,
                        "Intercept plugin failed in before_send; skipping"
                    );
                }
            }
        }
        current
    }

    /// Fire `after_receive` on every Intercept plugin. Observational: no
    /// return value is consumed and errors never reach the caller.
    pub async fn intercept_incoming(&self, message: &ChatMessage, ctx: &PluginContext) {
        for plugin in self.registry.get_by_kind(PluginKind::Intercept).await {
            let PluginBehavior::Intercept(hook) = &plugin.behavior else {
                continue;
            };
            if let Err(e) = hook.after_receive(message, ctx) {
                tracing::warn!(
                    plugin_id = %plugin.id,
                    conversation_id = %ctx.conversation_id,
                    error = %e,
                    "Intercept plugin failed in after_receive"
                );
            }
        }
    }

    /// Collect non-null render outputs for one widget surface. A failing
    /// plugin contributes nothing.
    pub async fn ui_extensions(&self, location: UiLocation, ctx: &PluginContext) -> Vec<UiFragment> {
        let mut fragments = Vec::new();
        for plugin in self.registry.get_by_kind(PluginKind::UiExtension).await {
            let PluginBehavior::UiExtension(hook) = &plugin.behavior else {
                continue;
            };
            match hook.render(location, ctx) {
                Ok(Some(content)) => fragments.push(UiFragment {
                    plugin_id: plugin.id.clone(),
                    location,
                    content,
                }),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        plugin_id = %plugin.id,
                        location = ?location,
                        error = %e,
                        "UI extension plugin failed; skipping"
                    );
                }
            }
        }
        fragments
    }

    /// Fan an analytics event out to every Analytics plugin, fire-and-forget.
    pub async fn track_event(&self, name: &str, data: &serde_json::Value, ctx: &PluginContext) {
        for plugin in self.registry.get_by_kind(PluginKind::Analytics).await {
            let PluginBehavior::Analytics(hook) = &plugin.behavior else {
                continue;
            };
            if let Err(e) = hook.track(name, data, ctx) {
                tracing::warn!(
                    plugin_id = %plugin.id,
                    event = %name,
                    error = %e,
                    "Analytics plugin failed"
                );
            }
        }
    }
}
