use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{McpError, Result};

/// Protocol revision sent in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const CLIENT_NAME: &str = "mcp-hub";

const JSONRPC_VERSION: &str = "2.0";

/// A request (with id) or notification (without) on its way to a server.
#[derive(Debug, Serialize)]
pub struct Outbound<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl<'a> Outbound<'a> {
    pub fn request(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: Some(id),
            method,
            params,
        }
    }

    pub fn notification(method: &'a str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method,
            params: None,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Error object of a JSON-RPC reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RpcError {
    pub const METHOD_NOT_FOUND: i64 = -32601;
}

impl From<RpcError> for McpError {
    fn from(e: RpcError) -> Self {
        McpError::Protocol(format!("{}: {}", e.code, e.message))
    }
}

/// Anything a server can send us.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to one of our requests
    Response {
        id: u64,
        outcome: std::result::Result<Value, RpcError>,
    },
    /// Server-initiated request; must be answered with the same id
    Request { id: Value, method: String },
    Notification { method: String },
}

#[derive(Deserialize)]
struct RawInbound {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawInbound = serde_json::from_str(text)?;

        match (raw.method, raw.id) {
            (Some(method), Some(id)) if !id.is_null() => Ok(Inbound::Request { id, method }),
            (Some(method), _) => Ok(Inbound::Notification { method }),
            (None, Some(id)) => {
                let id = id.as_u64().ok_or_else(|| {
                    McpError::Protocol(format!("response id {} is not one of ours", id))
                })?;
                let outcome = match raw.error {
                    Some(error) => Err(error),
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Ok(Inbound::Response { id, outcome })
            }
            (None, None) => Err(McpError::Protocol(
                "message has neither method nor id".to_string(),
            )),
        }
    }
}

/// Successful reply to a server-initiated request.
pub fn reply_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

pub fn reply_error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message.into() },
    })
}

/// Parameters of our `initialize` request. We offer no client capabilities.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// What the server said about itself during the handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpInitializeResult {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: ServerInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl McpInitializeResult {
    /// Whether the server listed `capability` (e.g. "resources").
    pub fn advertises(&self, capability: &str) -> bool {
        self.capabilities
            .get(capability)
            .is_some_and(|value| !value.is_null())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_has_no_id() {
        let text = Outbound::notification("notifications/initialized")
            .encode()
            .unwrap();
        assert_eq!(
            text,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#
        );
    }

    #[test]
    fn classifies_inbound_messages() {
        assert_eq!(
            Inbound::parse(r#"{"jsonrpc":"2.0","id":7,"result":{"tools":[]}}"#).unwrap(),
            Inbound::Response {
                id: 7,
                outcome: Ok(json!({"tools": []}))
            }
        );
        assert_eq!(
            Inbound::parse(r#"{"jsonrpc":"2.0","id":"srv-1","method":"ping"}"#).unwrap(),
            Inbound::Request {
                id: json!("srv-1"),
                method: "ping".to_string()
            }
        );
        assert_eq!(
            Inbound::parse(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#)
                .unwrap(),
            Inbound::Notification {
                method: "notifications/tools/list_changed".to_string()
            }
        );
    }

    #[test]
    fn error_reply_keeps_code() {
        let inbound = Inbound::parse(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        let Inbound::Response { outcome, .. } = inbound else {
            panic!("expected a response");
        };
        let err = outcome.unwrap_err();
        assert_eq!(err.code, RpcError::METHOD_NOT_FOUND);
        assert_eq!(
            McpError::from(err).to_string(),
            "Protocol error: -32601: Method not found"
        );
    }

    #[test]
    fn foreign_response_id_is_rejected() {
        assert!(Inbound::parse(r#"{"jsonrpc":"2.0","id":"abc","result":{}}"#).is_err());
        assert!(Inbound::parse(r#"{"jsonrpc":"2.0"}"#).is_err());
    }

    #[test]
    fn capability_lookup() {
        let init: McpInitializeResult = serde_json::from_value(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}, "resources": null},
            "serverInfo": {"name": "gget", "version": "0.1"}
        }))
        .unwrap();
        assert!(init.advertises("tools"));
        assert!(!init.advertises("resources"));
        assert!(!init.advertises("prompts"));
    }
}
