//! Ambient data handed to skill handlers.

use serde::{Deserialize, Serialize};

/// Read-only context for one invocation, exposed to plugin code as
/// `kiln.context` and passed to skill handlers alongside the query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Conversation or session the call belongs to.
    pub session_id: String,
    /// End user, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Channel the request arrived on (`cli`, `discord`, ...).
    pub channel: String,
    /// Free-form host configuration for the plugin.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl ExecutionContext {
    /// Context for a one-off CLI invocation.
    #[must_use]
    pub fn cli() -> Self {
        Self {
            session_id: format!("cli-{}", std::process::id()),
            user_id: None,
            channel: "cli".into(),
            config: serde_json::Map::new(),
        }
    }
}
