//! Behavior plugins over the message flow
//!
//! Independent modules (moderation, formatting, telemetry, UI injection)
//! observe and transform messages without the core knowing their
//! implementation. Four capability variants exist as a tagged union:
//! - **Transform**: rewrite inbound messages (sentiment tagging, markup)
//! - **Intercept**: hook outgoing content before send and observe received
//!   messages
//! - **UiExtension**: contribute render fragments to widget surfaces
//! - **Analytics**: receive fire-and-forget event fanout
//!
//! Fault isolation is the core safety property: a failing plugin is logged
//! and skipped for that invocation, never allowed to block message delivery
//! or reach the end user.

pub mod pipeline;
pub mod registry;

pub use pipeline::PluginPipeline;
pub use registry::PluginRegistry;

use std::sync::Arc;

use deskrelay_shared::{ChatMessage, ConversationId, PluginId, WorkspaceId};

/// Raised by a plugin hook; caught at the pipeline boundary
#[derive(Debug, thiserror::Error)]
#[error("Plugin execution failed: {0}")]
pub struct PluginError(pub String);

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The only ambient data a plugin hook may rely on. Plugins must not reach
/// into the transport or storage directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginContext {
    pub conversation_id: ConversationId,
    pub workspace_id: WorkspaceId,
}

/// Widget surface a UI extension renders into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UiLocation {
    Header,
    Footer,
    Sidebar,
    MessageActions,
}

/// Render output contributed by a UI extension plugin
#[derive(Debug, Clone, PartialEq)]
pub struct UiFragment {
    pub plugin_id: PluginId,
    pub location: UiLocation,
    pub content: serde_json::Value,
}

// =============================================================================
// Hook Traits
// =============================================================================

/// Rewrites a message in the inbound pipeline
pub trait TransformHook: Send + Sync {
    fn transform(
        &self,
        message: ChatMessage,
        ctx: &PluginContext,
    ) -> Result<ChatMessage, PluginError>;
}

/// Hooks around the send/receive boundary
pub trait InterceptHook: Send + Sync {
    /// Rewrite outgoing content before it is persisted or published
    fn before_send(&self, content: String, ctx: &PluginContext) -> Result<String, PluginError>;

    /// Observe a received message; the return value is not consumed
    fn after_receive(&self, message: &ChatMessage, ctx: &PluginContext)
        -> Result<(), PluginError>;
}

/// Contributes render output to one widget surface
pub trait UiExtensionHook: Send + Sync {
    fn render(
        &self,
        location: UiLocation,
        ctx: &PluginContext,
    ) -> Result<Option<serde_json::Value>, PluginError>;
}

/// Receives analytics event fanout
pub trait AnalyticsHook: Send + Sync {
    fn track(
        &self,
        name: &str,
        data: &serde_json::Value,
        ctx: &PluginContext,
    ) -> Result<(), PluginError>;
}

// =============================================================================
// Tagged Plugin Union
// =============================================================================

/// Capability discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    Transform,
    Intercept,
    UiExtension,
    Analytics,
}

/// One registered plugin: unique id plus one capability variant
#[derive(Clone)]
pub struct Plugin {
    pub id: PluginId,
    pub behavior: PluginBehavior,
}

#[derive(Clone)]
pub enum PluginBehavior {
    Transform(Arc<dyn TransformHook>),
    Intercept(Arc<dyn InterceptHook>),
    UiExtension(Arc<dyn UiExtensionHook>),
    Analytics(Arc<dyn AnalyticsHook>),
}

impl Plugin {
    pub fn transform(id: impl Into<PluginId>, hook: Arc<dyn TransformHook>) -> Self {
        Self {
            id: id.into(),
            behavior: PluginBehavior::Transform(hook),
        }
    }

    pub fn intercept(id: impl Into<PluginId>, hook: Arc<dyn InterceptHook>) -> Self {
        Self {
            id: id.into(),
            behavior: PluginBehavior::Intercept(hook),
        }
    }

    pub fn ui_extension(id: impl Into<PluginId>, hook: Arc<dyn UiExtensionHook>) -> Self {
        Self {
            id: id.into(),
            behavior: PluginBehavior::UiExtension(hook),
        }
    }

    pub fn analytics(id: impl Into<PluginId>, hook: Arc<dyn AnalyticsHook>) -> Self {
        Self {
            id: id.into(),
            behavior: PluginBehavior::Analytics(hook),
        }
    }

    pub fn kind(&self) -> PluginKind {
        match &self.behavior {
            PluginBehavior::Transform(_) => PluginKind::Transform,
            PluginBehavior::Intercept(_) => PluginKind::Intercept,
            PluginBehavior::UiExtension(_) => PluginKind::UiExtension,
            PluginBehavior::Analytics(_) => PluginKind::Analytics,
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .finish()
    }
}
