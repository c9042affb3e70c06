pub mod sse;
pub mod stdio;

pub use sse::SseTransport;
pub use stdio::StdioTransport;

use std::sync::Arc;

use crate::config::{ServerConfig, SseConfig, StdioConfig, TransportConfig};
use crate::error::{McpError, Result};
use crate::protocol::McpTransport;

/// Notification hooks a transport fires from its background tasks.
pub trait TransportObserver: Send + Sync {
    /// The channel failed.
    fn on_error(&self, error: &McpError);
    /// The channel ended, possibly cleanly.
    fn on_close(&self);
}

/// Observer that ignores every notification.
pub struct NoopObserver;

impl TransportObserver for NoopObserver {
    fn on_error(&self, _error: &McpError) {}
    fn on_close(&self) {}
}

/// Build the transport described by `config` without opening it.
pub fn build_transport(
    name: &str,
    config: &ServerConfig,
    observer: Arc<dyn TransportObserver>,
) -> Result<Arc<dyn McpTransport>> {
    match &config.transport {
        TransportConfig::Stdio(stdio) => {
            let transport = build_stdio_transport(name, stdio, observer)?;
            Ok(Arc::new(transport))
        }
        TransportConfig::Sse(sse) => {
            let transport = build_sse_transport(name, sse, config, observer)?;
            Ok(Arc::new(transport))
        }
    }
}

pub fn build_stdio_transport(
    name: &str,
    config: &StdioConfig,
    observer: Arc<dyn TransportObserver>,
) -> Result<StdioTransport> {
    let command = config
        .command
        .as_deref()
        .map(str::trim)
        .filter(|command| !command.is_empty())
        .ok_or_else(|| {
            McpError::Configuration(format!("MCP server '{}' has no command", name))
        })?;

    Ok(StdioTransport::new(
        name,
        command.to_string(),
        config.clone(),
        observer,
    ))
}

pub fn build_sse_transport(
    name: &str,
    config: &SseConfig,
    server: &ServerConfig,
    observer: Arc<dyn TransportObserver>,
) -> Result<SseTransport> {
    let url = config
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| McpError::Configuration(format!("MCP server '{}' has no url", name)))?;

    let url = reqwest::Url::parse(url).map_err(|e| {
        McpError::Configuration(format!("MCP server '{}' has an invalid url: {}", name, e))
    })?;

    SseTransport::new(name, url, config.clone(), server.request_timeout(), observer)
}
