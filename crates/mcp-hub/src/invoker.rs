use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{McpError, Result};
use crate::protocol::McpClient;
use crate::registry::{Connection, ConnectionRegistry};
use crate::types::{McpCallResult, ReadResourceResult, ServerStatus};

/// Executes tool calls and resource reads against live connections.
pub struct ToolInvoker {
    registry: Arc<ConnectionRegistry>,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Call `tool_name` on `server_name`, bounded by the server's timeout.
    ///
    /// A transport fault demotes the connection to disconnected before the
    /// error is returned.
    pub async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: Option<Value>,
    ) -> Result<McpCallResult> {
        let connection = self.lookup(server_name)?;
        if connection.status() != ServerStatus::Connected {
            return Err(McpError::NotConnected(server_name.to_string()));
        }
        let client = ready_client(&connection)?;
        let timeout = connection.config().request_timeout();

        debug!(
            "Calling tool '{}' on MCP server '{}' (timeout {:?})",
            tool_name, server_name, timeout
        );

        let outcome = match tokio::time::timeout(timeout, client.call_tool(tool_name, arguments))
            .await
        {
            Ok(result) => result.and_then(parse_call_result),
            Err(_) => Err(McpError::Timeout(format!(
                "Tool '{}' on '{}' did not answer within {:?}",
                tool_name, server_name, timeout
            ))),
        };

        outcome.map_err(|e| demote_on_fault(&connection, ServerStatus::Connected, e))
    }

    /// Read `uri` from `server_name`.
    ///
    /// Only existence and the disabled flag are checked up front; a
    /// disconnected server fails inside the client. A transport fault
    /// demotes the server only if it was connected when the read started,
    /// so a read racing a handshake cannot abort it.
    pub async fn read_resource(&self, server_name: &str, uri: &str) -> Result<ReadResourceResult> {
        let connection = self.lookup(server_name)?;
        let client = ready_client(&connection)?;
        let dispatched_as = connection.status();

        debug!("Reading resource '{}' from MCP server '{}'", uri, server_name);
        let outcome = client.read_resource(uri).await.and_then(|value| {
            serde_json::from_value::<ReadResourceResult>(value)
                .map_err(|e| McpError::InvalidResult(format!("Bad resources/read result: {}", e)))
        });

        outcome.map_err(|e| demote_on_fault(&connection, dispatched_as, e))
    }

    fn lookup(&self, server_name: &str) -> Result<Arc<Connection>> {
        let connection = self
            .registry
            .find(server_name)
            .ok_or_else(|| McpError::ServerNotFound(server_name.to_string()))?;

        if connection.is_disabled() {
            return Err(McpError::ServerDisabled(server_name.to_string()));
        }
        Ok(connection)
    }
}

fn ready_client(connection: &Connection) -> Result<Arc<dyn McpClient>> {
    connection
        .client()
        .ok_or_else(|| McpError::NotConnected(connection.name().to_string()))
}

fn parse_call_result(value: Value) -> Result<McpCallResult> {
    if !value.get("content").is_some_and(Value::is_array) {
        return Err(McpError::InvalidResult(
            "tools/call result has no content array".to_string(),
        ));
    }
    serde_json::from_value(value)
        .map_err(|e| McpError::InvalidResult(format!("Bad tools/call result: {}", e)))
}

fn demote_on_fault(
    connection: &Connection,
    dispatched_as: ServerStatus,
    error: McpError,
) -> McpError {
    if dispatched_as == ServerStatus::Connected && error.is_transport_fault() {
        let mut state = connection.shared_state().write();
        state.append_error(error.to_string());
        if state.mark_disconnected() {
            warn!(
                "MCP server '{}' marked disconnected after: {}",
                connection.name(),
                error
            );
        }
    }
    error
}
