//! Widget configuration

use std::env;
use std::time::Duration;

use deskrelay_shared::WorkspaceId;
use uuid::Uuid;

use crate::transport::DEFAULT_RETRY_BACKOFF;

/// Configuration for one embedded widget instance
#[derive(Debug, Clone)]
pub struct WidgetConfig {
    /// Tenant scope for every channel name and persisted record
    pub workspace_id: WorkspaceId,

    /// Tenant API key (host-side auth concern, carried for the socket
    /// implementation to present)
    pub api_key: String,

    /// Provision a per-conversation encryption key for every new conversation
    pub encryption_enabled: bool,

    /// Delay between reconnect attempts while suspended
    pub reconnect_backoff: Duration,

    /// Display name entered into channel presence
    pub presence_name: Option<String>,
}

impl WidgetConfig {
    pub fn new(workspace_id: WorkspaceId, api_key: impl Into<String>) -> Self {
        Self {
            workspace_id,
            api_key: api_key.into(),
            encryption_enabled: false,
            reconnect_backoff: DEFAULT_RETRY_BACKOFF,
            presence_name: None,
        }
    }

    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.encryption_enabled = enabled;
        self
    }

    pub fn with_presence_name(mut self, name: impl Into<String>) -> Self {
        self.presence_name = Some(name.into());
        self
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // .env files are a dev convenience; absence is fine
        dotenvy::dotenv().ok();

        let workspace_id = env::var("DESKRELAY_WORKSPACE_ID")
            .map_err(|_| ConfigError::Missing("DESKRELAY_WORKSPACE_ID"))?;
        let workspace_id = Uuid::parse_str(&workspace_id)
            .map_err(|_| ConfigError::Invalid("DESKRELAY_WORKSPACE_ID"))?;

        let api_key = env::var("DESKRELAY_API_KEY")
            .map_err(|_| ConfigError::Missing("DESKRELAY_API_KEY"))?;
        if api_key.len() < 16 {
            return Err(ConfigError::WeakSecret(
                "DESKRELAY_API_KEY must be at least 16 characters",
            ));
        }

        let encryption_enabled = env::var("DESKRELAY_ENCRYPTION")
            .map(|v| matches!(v.as_str(), "1" | "true" | "on"))
            .unwrap_or(false);

        let reconnect_backoff = env::var("DESKRELAY_RECONNECT_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RETRY_BACKOFF);

        Ok(Self {
            workspace_id: WorkspaceId::from(workspace_id),
            api_key,
            encryption_enabled,
            reconnect_backoff,
            presence_name: env::var("DESKRELAY_PRESENCE_NAME").ok(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("{0}")]
    WeakSecret(&'static str),
}
