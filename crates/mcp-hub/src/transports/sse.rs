use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Url};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::SseConfig;
use crate::error::{McpError, Result};
use crate::protocol::McpTransport;
use crate::transports::TransportObserver;

/// How long `connect` waits for the server to announce its POST endpoint.
const ENDPOINT_WAIT: Duration = Duration::from_secs(5);

/// Channel over a server-sent event stream, with requests POSTed back.
pub struct SseTransport {
    name: String,
    url: Url,
    headers: HeaderMap,
    request_timeout: Duration,
    client: Client,
    observer: Arc<dyn TransportObserver>,
    connected: Arc<AtomicBool>,
    inbound: Mutex<Option<mpsc::Receiver<String>>>,
    endpoint: parking_lot::RwLock<Option<Url>>,
    stream_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SseTransport {
    pub fn new(
        name: impl Into<String>,
        url: Url,
        config: SseConfig,
        request_timeout: Duration,
        observer: Arc<dyn TransportObserver>,
    ) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| McpError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            url,
            headers: build_headers(&config)?,
            request_timeout,
            client,
            observer,
            connected: Arc::new(AtomicBool::new(false)),
            inbound: Mutex::new(None),
            endpoint: parking_lot::RwLock::new(None),
            stream_task: parking_lot::Mutex::new(None),
        })
    }

    /// Where requests are POSTed: the announced endpoint, or `<base>/message`.
    pub fn endpoint_url(&self) -> Result<Url> {
        if let Some(endpoint) = self.endpoint.read().clone() {
            return Ok(endpoint);
        }

        let base = self.url.as_str().trim_end_matches('/');
        let base = base.strip_suffix("/sse").unwrap_or(base);
        Url::parse(&format!("{}/message", base))
            .map_err(|e| McpError::Configuration(format!("Invalid message url: {}", e)))
    }
}

fn build_headers(config: &SseConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McpError::Configuration(format!("Invalid header name: {}", e)))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| McpError::Configuration(format!("Invalid header value: {}", e)))?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

/// A 4xx means the server is up and refused this message; only 5xx and
/// other statuses count as a broken channel.
fn post_rejected(status: reqwest::StatusCode, body: &str) -> McpError {
    let detail = format!("POST failed: {} - {}", status, body);
    if status.is_client_error() {
        McpError::Protocol(detail)
    } else {
        McpError::Transport(detail)
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn connect(&self) -> Result<()> {
        info!("Connecting to MCP SSE endpoint: {}", self.url);

        // A reqwest timeout would also cut off the long-lived body, so only
        // the wait for response headers is bounded here.
        let request = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send();
        let response = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| {
                McpError::Connection(format!("Timed out connecting to {}", self.url))
            })??;

        if !response.status().is_success() {
            return Err(McpError::Connection(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let (message_tx, message_rx) = mpsc::channel(256);
        let (endpoint_tx, mut endpoint_rx) = watch::channel::<Option<Url>>(None);
        let name = self.name.clone();
        let base = self.url.clone();
        let observer = self.observer.clone();
        let connected = self.connected.clone();
        self.connected.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            let mut stream = response.bytes_stream().eventsource();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) if event.event == "endpoint" => match base.join(event.data.trim()) {
                        Ok(endpoint) => {
                            debug!("MCP server '{}' announced endpoint {}", name, endpoint);
                            let _ = endpoint_tx.send(Some(endpoint));
                        }
                        Err(e) => warn!("MCP server '{}' sent a bad endpoint: {}", name, e),
                    },
                    Ok(event) if event.event == "message" || event.event.is_empty() => {
                        if message_tx.send(event.data).await.is_err() {
                            return;
                        }
                    }
                    Ok(event) => debug!("Ignoring SSE event '{}'", event.event),
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        let err = McpError::Transport(format!("SSE stream error: {}", e));
                        warn!("MCP server '{}': {}", name, err);
                        observer.on_error(&err);
                        return;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            info!("SSE stream ended for MCP server '{}'", name);
            observer.on_close();
        });

        *self.inbound.lock().await = Some(message_rx);
        if let Some(previous) = self.stream_task.lock().replace(handle) {
            previous.abort();
        }

        match tokio::time::timeout(ENDPOINT_WAIT, endpoint_rx.wait_for(Option::is_some)).await {
            Ok(Ok(endpoint)) => {
                *self.endpoint.write() = endpoint.clone();
            }
            _ => debug!(
                "MCP server '{}' announced no endpoint, posting to {}",
                self.name,
                self.endpoint_url()?
            ),
        }

        info!("MCP SSE transport '{}' connected", self.name);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!("Disconnecting MCP SSE transport '{}'", self.name);
        self.connected.store(false, Ordering::SeqCst);

        if let Some(handle) = self.stream_task.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    async fn send(&self, message: String) -> Result<()> {
        if !self.is_connected() {
            return Err(McpError::Disconnected);
        }

        let post_url = self.endpoint_url()?;
        let response = self
            .client
            .post(post_url.clone())
            .headers(self.headers.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(message)
            .timeout(self.request_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(post_rejected(status, &body));
        }

        debug!("Sent message via POST to {}", post_url);
        Ok(())
    }

    async fn receive(&self) -> Option<String> {
        let mut inbound = self.inbound.lock().await;
        inbound.as_mut()?.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
