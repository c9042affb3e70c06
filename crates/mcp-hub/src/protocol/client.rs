use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{McpError, Result};
use crate::protocol::models::*;
use crate::types::{McpResource, McpResourceTemplate, McpTool};

/// Upper bound on pages fetched by one list call.
const MAX_LIST_PAGES: usize = 64;

/// Transport trait for MCP communication
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Open the channel (spawn the process, subscribe to the stream).
    async fn connect(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    async fn send(&self, message: String) -> Result<()>;
    /// Next inbound message; `None` once the channel has closed.
    async fn receive(&self) -> Option<String>;
    fn is_connected(&self) -> bool;

    /// Captured diagnostic output, such as a child's stderr.
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// Client-side view of one MCP server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait McpClient: Send + Sync {
    /// Open the transport and perform the protocol handshake.
    async fn initialize(&self) -> Result<McpInitializeResult>;
    async fn list_tools(&self) -> Result<Vec<McpTool>>;
    async fn list_resources(&self) -> Result<Vec<McpResource>>;
    async fn list_resource_templates(&self) -> Result<Vec<McpResourceTemplate>>;
    /// Raw `tools/call` result; shape checking is left to the caller.
    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value>;
    /// Raw `resources/read` result.
    async fn read_resource(&self, uri: &str) -> Result<Value>;
    async fn ping(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

type PendingRequests = DashMap<u64, oneshot::Sender<Result<Value>>>;

/// JSON-RPC client speaking MCP over any [`McpTransport`].
pub struct McpProtocolClient {
    server_name: String,
    transport: Arc<dyn McpTransport>,
    request_timeout: Duration,
    next_id: AtomicU64,
    pending: Arc<PendingRequests>,
    closed: Arc<AtomicBool>,
    reader: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl McpProtocolClient {
    pub fn new(
        server_name: impl Into<String>,
        transport: Arc<dyn McpTransport>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            transport,
            request_timeout,
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
            reader: parking_lot::Mutex::new(None),
        }
    }

    fn start_reader(&self) {
        let transport = self.transport.clone();
        let pending = self.pending.clone();
        let server_name = self.server_name.clone();
        let closed = self.closed.clone();
        closed.store(false, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            while let Some(message) = transport.receive().await {
                if let Err(e) = Self::handle_message(&message, &pending, transport.as_ref()).await
                {
                    warn!("MCP server '{}' sent an unusable message: {}", server_name, e);
                }
            }
            debug!("MCP server '{}' channel closed", server_name);
            closed.store(true, Ordering::SeqCst);
            Self::fail_pending(&pending);
        });

        if let Some(previous) = self.reader.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn handle_message(
        message: &str,
        pending: &PendingRequests,
        transport: &dyn McpTransport,
    ) -> Result<()> {
        match Inbound::parse(message)? {
            Inbound::Response { id, outcome } => match pending.remove(&id) {
                Some((_, sender)) => {
                    let _ = sender.send(outcome.map_err(McpError::from));
                }
                None => debug!("Dropping response to unknown request {}", id),
            },
            Inbound::Request { id, method } => {
                Self::answer_server_request(&method, id, transport).await?
            }
            Inbound::Notification { method } => debug!("MCP notification: {}", method),
        }
        Ok(())
    }

    /// We only answer `ping`; everything else is refused.
    async fn answer_server_request(
        method: &str,
        id: Value,
        transport: &dyn McpTransport,
    ) -> Result<()> {
        let reply = match method {
            "ping" => reply_result(id, json!({})),
            other => reply_error(
                id,
                RpcError::METHOD_NOT_FOUND,
                format!("Method not supported: {}", other),
            ),
        };
        transport.send(reply.to_string()).await
    }

    fn fail_pending(pending: &PendingRequests) {
        let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, sender)) = pending.remove(&id) {
                let _ = sender.send(Err(McpError::Disconnected));
            }
        }
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Outbound::request(id, method, params).encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if self.closed.load(Ordering::SeqCst) {
            self.pending.remove(&id);
            return Err(McpError::Disconnected);
        }

        if let Err(e) = self.transport.send(request).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::Disconnected),
            Err(_) => {
                self.pending.remove(&id);
                Err(McpError::Timeout(format!(
                    "{} request {} timed out after {:?}",
                    method, id, self.request_timeout
                )))
            }
        }
    }

    async fn list_paginated<T: DeserializeOwned>(&self, method: &str, key: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|cursor| json!({ "cursor": cursor }));
            let mut result = self.send_request(method, params).await?;

            let page = result.get_mut(key).map(Value::take).ok_or_else(|| {
                McpError::InvalidResult(format!("{} result is missing '{}'", method, key))
            })?;
            items.extend(serde_json::from_value::<Vec<T>>(page)?);

            match result.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => return Ok(items),
            }
        }

        warn!(
            "MCP server '{}' kept paginating {}; stopping after {} pages",
            self.server_name, method, MAX_LIST_PAGES
        );
        Ok(items)
    }
}

#[async_trait]
impl McpClient for McpProtocolClient {
    async fn initialize(&self) -> Result<McpInitializeResult> {
        self.transport.connect().await?;
        self.start_reader();

        let result = self
            .send_request("initialize", Some(initialize_params()))
            .await?;
        let result: McpInitializeResult = serde_json::from_value(result)?;

        let initialized = Outbound::notification("notifications/initialized").encode()?;
        self.transport.send(initialized).await?;

        Ok(result)
    }

    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        self.list_paginated("tools/list", "tools").await
    }

    async fn list_resources(&self) -> Result<Vec<McpResource>> {
        self.list_paginated("resources/list", "resources").await
    }

    async fn list_resource_templates(&self) -> Result<Vec<McpResourceTemplate>> {
        self.list_paginated("resources/templates/list", "resourceTemplates")
            .await
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value> {
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.send_request("tools/call", Some(params)).await
    }

    async fn read_resource(&self, uri: &str) -> Result<Value> {
        self.send_request("resources/read", Some(json!({ "uri": uri })))
            .await
    }

    async fn ping(&self) -> Result<()> {
        self.send_request("ping", None).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }
        self.closed.store(true, Ordering::SeqCst);
        Self::fail_pending(&self.pending);
        self.transport.close().await
    }
}
