#![allow(dead_code)]

use async_trait::async_trait;
use mcp_hub::{
    build_transport, Connector, ConnectionHandles, McpClient, McpError,
    McpInitializeResult, McpResource, McpResourceTemplate, McpTool, McpTransport, Result,
    ServerConfig, TransportObserver,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn stdio(command: &str) -> ServerConfig {
    ServerConfig::stdio(command, vec![])
}

/// How a fake server behaves.
#[derive(Clone, Default)]
pub struct ServerScript {
    pub tools: Vec<&'static str>,
    pub resources: Vec<&'static str>,
    pub fail_initialize: Option<McpError>,
    pub call_error: Option<McpError>,
    pub call_result: Option<Value>,
    pub call_delay: Option<Duration>,
    pub init_delay: Option<Duration>,
    /// Error for `read_resource`; falls back to `call_error`.
    pub read_error: Option<McpError>,
    pub stderr: Option<&'static str>,
}

impl ServerScript {
    pub fn with_tools(tools: &[&'static str]) -> Self {
        Self {
            tools: tools.to_vec(),
            ..Default::default()
        }
    }
}

pub struct FakeTransport {
    pub closes: AtomicUsize,
    stderr: Option<&'static str>,
}

#[async_trait]
impl McpTransport for FakeTransport {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, _message: String) -> Result<()> {
        Ok(())
    }

    async fn receive(&self) -> Option<String> {
        None
    }

    fn is_connected(&self) -> bool {
        self.closes.load(Ordering::SeqCst) == 0
    }

    fn diagnostics(&self) -> Option<String> {
        self.stderr.map(str::to_string)
    }
}

pub struct FakeClient {
    script: ServerScript,
    pub calls: AtomicUsize,
    pub closes: AtomicUsize,
}

impl FakeClient {
    pub fn closed(&self) -> bool {
        self.closes.load(Ordering::SeqCst) > 0
    }
}

#[async_trait]
impl McpClient for FakeClient {
    async fn initialize(&self) -> Result<McpInitializeResult> {
        if let Some(delay) = self.script.init_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.script.fail_initialize {
            return Err(err.clone());
        }
        Ok(serde_json::from_value(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "fake", "version": "1.0.0"}
        }))?)
    }

    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        Ok(self
            .script
            .tools
            .iter()
            .map(|name| McpTool {
                name: name.to_string(),
                description: format!("{} tool", name),
                input_schema: json!({"type": "object"}),
            })
            .collect())
    }

    async fn list_resources(&self) -> Result<Vec<McpResource>> {
        if self.script.resources.is_empty() {
            return Err(McpError::Protocol("Method not found".to_string()));
        }
        Ok(self
            .script
            .resources
            .iter()
            .map(|uri| McpResource {
                uri: uri.to_string(),
                name: uri.to_string(),
                description: None,
                mime_type: Some("text/plain".to_string()),
            })
            .collect())
    }

    async fn list_resource_templates(&self) -> Result<Vec<McpResourceTemplate>> {
        Ok(Vec::new())
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.script.call_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.script.call_error {
            return Err(err.clone());
        }
        Ok(self.script.call_result.clone().unwrap_or_else(|| {
            json!({
                "content": [{"type": "text", "text": format!("{} {}", name, arguments.unwrap_or(Value::Null))}]
            })
        }))
    }

    async fn read_resource(&self, uri: &str) -> Result<Value> {
        if let Some(err) = self.script.read_error.as_ref().or(self.script.call_error.as_ref()) {
            return Err(err.clone());
        }
        Ok(json!({"contents": [{"uri": uri, "text": format!("contents of {}", uri)}]}))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out fakes and recording what it opened.
#[derive(Default)]
pub struct FakeConnector {
    scripts: Mutex<HashMap<String, ServerScript>>,
    opens: Mutex<HashMap<String, usize>>,
    observers: Mutex<HashMap<String, Vec<Arc<dyn TransportObserver>>>>,
    clients: Mutex<HashMap<String, Vec<Arc<FakeClient>>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, name: &str, script: ServerScript) {
        self.scripts.lock().insert(name.to_string(), script);
    }

    pub fn opens(&self, name: &str) -> usize {
        self.opens.lock().get(name).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> usize {
        self.opens.lock().values().sum()
    }

    /// Observers handed to each transport opened for `name`, oldest first.
    pub fn observers(&self, name: &str) -> Vec<Arc<dyn TransportObserver>> {
        self.observers.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn clients(&self, name: &str) -> Vec<Arc<FakeClient>> {
        self.clients.lock().get(name).cloned().unwrap_or_default()
    }
}

impl Connector for FakeConnector {
    fn open(
        &self,
        name: &str,
        config: &ServerConfig,
        observer: Arc<dyn TransportObserver>,
    ) -> Result<ConnectionHandles> {
        // Same validation as the real connector; nothing is spawned until connect.
        build_transport(name, config, observer.clone())?;

        let script = self.scripts.lock().get(name).cloned().unwrap_or_default();
        let transport = Arc::new(FakeTransport {
            closes: AtomicUsize::new(0),
            stderr: script.stderr,
        });
        let client = Arc::new(FakeClient {
            script,
            calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });

        *self.opens.lock().entry(name.to_string()).or_default() += 1;
        self.observers
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(observer);
        self.clients
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(client.clone());

        Ok(ConnectionHandles { transport, client })
    }
}
