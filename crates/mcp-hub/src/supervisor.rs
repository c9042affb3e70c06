use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::catalog::{CatalogBuilder, ServerCatalog};
use crate::cleanup::CleanupQueue;
use crate::config::ServerConfig;
use crate::error::{McpError, Result};
use crate::protocol::McpProtocolClient;
use crate::registry::{Connection, ConnectionHandles, ConnectionRegistry, SharedState};
use crate::snapshot::ProviderSnapshot;
use crate::transports::{build_transport, TransportObserver};
use crate::types::ServerState;

/// Opens the transport and client handles for one server.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        name: &str,
        config: &ServerConfig,
        observer: Arc<dyn TransportObserver>,
    ) -> Result<ConnectionHandles>;
}

/// Real connector: stdio or SSE transport plus the JSON-RPC client.
pub struct TransportConnector;

impl Connector for TransportConnector {
    fn open(
        &self,
        name: &str,
        config: &ServerConfig,
        observer: Arc<dyn TransportObserver>,
    ) -> Result<ConnectionHandles> {
        let transport = build_transport(name, config, observer)?;
        let client = McpProtocolClient::new(name, transport.clone(), config.request_timeout());
        Ok(ConnectionHandles {
            transport,
            client: Arc::new(client),
        })
    }
}

/// Transport hooks writing into one connection's state.
///
/// Bound to the state cell of a single connection attempt, so a late
/// notification from a replaced transport cannot touch its successor.
pub struct StateHooks {
    name: String,
    state: SharedState,
}

impl StateHooks {
    pub fn new(name: impl Into<String>, state: SharedState) -> Self {
        Self {
            name: name.into(),
            state,
        }
    }
}

impl TransportObserver for StateHooks {
    fn on_error(&self, error: &McpError) {
        warn!("MCP server '{}' transport error: {}", self.name, error);
        let mut state = self.state.write();
        state.append_error(error.to_string());
        state.mark_disconnected();
    }

    fn on_close(&self) {
        if self.state.write().mark_disconnected() {
            info!("MCP server '{}' transport closed", self.name);
        }
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub connected: Vec<String>,
    pub reconnected: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    /// Server name and error text for each failed connect
    pub failed: Vec<(String, String)>,
}

impl ReconcileReport {
    /// True when the pass took no connect or teardown action.
    pub fn is_noop(&self) -> bool {
        self.connected.is_empty()
            && self.reconnected.is_empty()
            && self.removed.is_empty()
            && self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Connect,
    Reconnect,
}

/// Keeps the registry in line with the desired server configuration.
pub struct ConnectionSupervisor {
    registry: Arc<ConnectionRegistry>,
    connector: Arc<dyn Connector>,
    cleanup: Arc<CleanupQueue>,
    snapshot: RwLock<Arc<ProviderSnapshot>>,
}

impl ConnectionSupervisor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        connector: Arc<dyn Connector>,
        cleanup: Arc<CleanupQueue>,
    ) -> Self {
        Self {
            registry,
            connector,
            cleanup,
            snapshot: RwLock::new(Arc::new(ProviderSnapshot::default())),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The last snapshot built.
    pub fn snapshot(&self) -> Arc<ProviderSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn rebuild_snapshot(&self) -> Arc<ProviderSnapshot> {
        let snapshot = Arc::new(ProviderSnapshot::from_registry(&self.registry));
        *self.snapshot.write() = snapshot.clone();
        snapshot
    }

    /// Bring the registry in line with `desired`.
    ///
    /// Removed servers are torn down; new and changed ones are (re)connected
    /// concurrently. A failed connect is logged and reported without
    /// affecting the others.
    pub async fn reconcile(&self, desired: &BTreeMap<String, ServerConfig>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for name in self.registry.names() {
            if !desired.contains_key(&name) {
                self.teardown(&name);
                report.removed.push(name);
            }
        }

        let mut tasks = Vec::new();
        for (name, config) in desired {
            let action = match self.registry.find(name) {
                None => Action::Connect,
                Some(existing) if existing.fingerprint() != config.fingerprint() => {
                    Action::Reconnect
                }
                Some(_) => {
                    report.unchanged.push(name.clone());
                    continue;
                }
            };

            tasks.push(async move {
                if action == Action::Reconnect {
                    self.teardown(name);
                }
                (name, action, self.connect(name, config).await)
            });
        }

        for (name, action, result) in join_all(tasks).await {
            match (result, action) {
                (Ok(()), Action::Connect) => report.connected.push(name.clone()),
                (Ok(()), Action::Reconnect) => report.reconnected.push(name.clone()),
                (Err(e), _) => {
                    error!("Failed to connect to MCP server '{}': {}", name, e);
                    report.failed.push((name.clone(), e.to_string()));
                }
            }
        }

        self.rebuild_snapshot();
        info!(
            "MCP reconcile: {} connected, {} reconnected, {} removed, {} unchanged, {} failed",
            report.connected.len(),
            report.reconnected.len(),
            report.removed.len(),
            report.unchanged.len(),
            report.failed.len()
        );
        report
    }

    /// Open, handshake and catalog one server.
    ///
    /// On failure the entry stays registered as disconnected with the error
    /// appended, and the error is returned.
    pub async fn connect(&self, name: &str, config: &ServerConfig) -> Result<()> {
        if config.disabled {
            debug!("MCP server '{}' is disabled", name);
            let state = Arc::new(RwLock::new(ServerState::disabled(name)));
            self.install(Connection::new(name, config.clone(), None, state));
            return Ok(());
        }

        let state: SharedState = Arc::new(RwLock::new(ServerState::connecting(name)));
        let hooks = Arc::new(StateHooks::new(name, state.clone()));

        let handles = match self.connector.open(name, config, hooks) {
            Ok(handles) => handles,
            Err(e) => {
                {
                    let mut state = state.write();
                    state.append_error(e.to_string());
                    state.mark_disconnected();
                }
                self.install(Connection::new(name, config.clone(), None, state));
                return Err(e);
            }
        };

        self.install(Connection::new(
            name,
            config.clone(),
            Some(handles.clone()),
            state.clone(),
        ));

        let err = match self.handshake(name, config, &handles).await {
            Ok(catalog) => {
                let tools = catalog.tools.len();
                if state.write().mark_connected(catalog) {
                    info!("MCP server '{}' connected with {} tools", name, tools);
                    return Ok(());
                }
                McpError::Connection(format!("MCP server '{}' closed during startup", name))
            }
            Err(e) => e,
        };

        {
            let mut state = state.write();
            state.append_error(err.to_string());
            if let Some(diagnostics) = handles.transport.diagnostics() {
                state.append_error(format!("stderr: {}", diagnostics));
            }
            state.mark_disconnected();
        }
        if let Some(connection) = self.registry.find(name) {
            if Arc::ptr_eq(connection.shared_state(), &state) {
                self.release(&connection);
            }
        }
        Err(err)
    }

    async fn handshake(
        &self,
        name: &str,
        config: &ServerConfig,
        handles: &ConnectionHandles,
    ) -> Result<ServerCatalog> {
        let init = handles.client.initialize().await?;
        info!(
            "MCP server '{}' initialized: {} v{} (protocol {})",
            name, init.server_info.name, init.server_info.version, init.protocol_version
        );
        if !init.advertises("tools") {
            debug!("MCP server '{}' does not advertise tools", name);
        }
        CatalogBuilder::fetch(name, handles.client.as_ref(), &config.tool_filter()).await
    }

    /// Reconnect `name` with its stored configuration.
    ///
    /// Unlike [`reconcile`](Self::reconcile), failures are returned.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let config = self
            .registry
            .find(name)
            .map(|connection| connection.config().clone())
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;

        info!("Restarting MCP server '{}'", name);
        self.teardown(name);
        let result = self.connect(name, &config).await;
        self.rebuild_snapshot();
        result
    }

    /// Remove `name` from the registry at once and release its handles in
    /// the background. Returns false when there was no such entry.
    pub fn teardown(&self, name: &str) -> bool {
        let Some(connection) = self.registry.remove(name) else {
            return false;
        };

        connection.shared_state().write().mark_disconnected();
        self.release(&connection);
        info!("MCP server '{}' removed", name);
        true
    }

    /// Tear down every connection and wait for the releases to finish.
    pub async fn shutdown(&self, timeout: std::time::Duration) {
        for name in self.registry.names() {
            self.teardown(&name);
        }
        self.rebuild_snapshot();
        if !self.cleanup.wait_idle(timeout).await {
            warn!("Some MCP servers were still shutting down after {:?}", timeout);
        }
        self.cleanup.shutdown(timeout).await;
    }

    fn install(&self, connection: Connection) {
        if let Some(displaced) = self.registry.upsert(connection) {
            warn!(
                "MCP server '{}' was replaced while still registered",
                displaced.name()
            );
            self.release(&displaced);
        }
    }

    fn release(&self, connection: &Connection) {
        if let Some(handles) = connection.take_handles() {
            self.cleanup.submit(connection.name(), handles);
        }
    }
}
