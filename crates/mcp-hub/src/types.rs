use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::ServerCatalog;

/// MCP tool metadata from server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

impl McpTool {
    /// Names listed under the schema's `required` key.
    pub fn required_arguments(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(|required| required.as_array())
            .map(|names| names.iter().filter_map(|name| name.as_str()).collect())
            .unwrap_or_default()
    }
}

/// A concrete resource advertised by a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResource {
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A parameterised resource URI advertised by a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResourceTemplate {
    pub uri_template: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Result of calling an MCP tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpCallResult {
    pub content: Vec<McpContentItem>,
    #[serde(default)]
    pub is_error: bool,
}

impl McpCallResult {
    /// Flatten the content items into display text.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|item| match item {
                McpContentItem::Text { text } => text.clone(),
                McpContentItem::Image { data, mime_type } => {
                    format!("[Image: {} ({} bytes)]", mime_type, data.len())
                }
                McpContentItem::Resource { resource } => match &resource.text {
                    Some(text) => format!("[Resource {}]: {}", resource.uri, text),
                    None => format!("[Resource {}]", resource.uri),
                },
                McpContentItem::Other => "[Unsupported content]".to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum McpContentItem {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(rename = "resource")]
    Resource { resource: McpResourceContents },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResourceContents {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// Result of reading a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceResult {
    pub contents: Vec<McpResourceContents>,
}

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Connecting => write!(f, "connecting"),
            ServerStatus::Connected => write!(f, "connected"),
            ServerStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Mutable state of one server connection.
///
/// Status only moves forward: connecting -> connected -> disconnected, or
/// connecting -> disconnected. A fresh connection attempt starts a new state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerState {
    pub name: String,
    pub status: ServerStatus,
    /// Append-only error log
    pub errors: Vec<String>,
    #[serde(flatten)]
    pub catalog: ServerCatalog,
    pub disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl ServerState {
    pub fn connecting(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ServerStatus::Connecting,
            errors: Vec::new(),
            catalog: ServerCatalog::default(),
            disabled: false,
            connected_at: None,
            disconnected_at: None,
        }
    }

    pub fn disabled(name: impl Into<String>) -> Self {
        let mut state = Self::connecting(name);
        state.status = ServerStatus::Disconnected;
        state.disabled = true;
        state
    }

    /// The error log as one block of text.
    pub fn error_text(&self) -> String {
        self.errors.join("\n")
    }

    pub(crate) fn append_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Returns false when the state was already disconnected.
    pub(crate) fn mark_disconnected(&mut self) -> bool {
        if self.status == ServerStatus::Disconnected {
            return false;
        }
        self.status = ServerStatus::Disconnected;
        self.disconnected_at = Some(Utc::now());
        true
    }

    /// Only a connecting state can become connected.
    pub(crate) fn mark_connected(&mut self, catalog: ServerCatalog) -> bool {
        if self.status != ServerStatus::Connecting {
            return false;
        }
        self.status = ServerStatus::Connected;
        self.errors.clear();
        self.catalog = catalog;
        self.connected_at = Some(Utc::now());
        true
    }
}
