use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cleanup::{
    CleanupQueue, DEFAULT_CLEANUP_CAPACITY, DEFAULT_CLEANUP_WORKERS, DEFAULT_RELEASE_TIMEOUT,
};
use crate::config::{McpSettings, ServerConfig};
use crate::error::Result;
use crate::invoker::ToolInvoker;
use crate::registry::ConnectionRegistry;
use crate::selection::{
    build_selection_prompt, CatalogValidator, SelectionModel, SelectionOutcome, SelectionRetry,
    SelectionValidator, ToolSelection,
};
use crate::snapshot::ProviderSnapshot;
use crate::supervisor::{Connector, ConnectionSupervisor, ReconcileReport, TransportConnector};
use crate::types::{McpCallResult, ReadResourceResult, ServerState};

/// How long `dispose` waits for background releases.
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Result of executing a validated selection.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Tool {
        server_name: String,
        tool_name: String,
        result: McpCallResult,
    },
    Resource {
        server_name: String,
        uri: String,
        result: ReadResourceResult,
    },
    NoTool { rationale: Option<String> },
}

/// The dispatch surface over all configured MCP servers.
pub struct McpHub {
    supervisor: ConnectionSupervisor,
    invoker: ToolInvoker,
    validator: Arc<dyn SelectionValidator>,
}

impl McpHub {
    /// Hub with real stdio/SSE connections.
    ///
    /// # Panics
    ///
    /// Spawns the cleanup workers, so it panics outside a tokio runtime.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self::with_connector(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(TransportConnector),
        )
    }

    /// # Panics
    ///
    /// Outside a tokio runtime, like [`new`](Self::new).
    pub fn with_connector(registry: Arc<ConnectionRegistry>, connector: Arc<dyn Connector>) -> Self {
        let cleanup = Arc::new(CleanupQueue::new(
            DEFAULT_CLEANUP_WORKERS,
            DEFAULT_CLEANUP_CAPACITY,
            DEFAULT_RELEASE_TIMEOUT,
        ));
        Self {
            supervisor: ConnectionSupervisor::new(registry.clone(), connector, cleanup),
            invoker: ToolInvoker::new(registry),
            validator: Arc::new(CatalogValidator),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn SelectionValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.supervisor.registry()
    }

    /// Apply new settings from both namespaces.
    pub async fn update_settings(&self, settings: &McpSettings) -> ReconcileReport {
        self.reconcile(&settings.resolve()).await
    }

    pub async fn reconcile(&self, desired: &BTreeMap<String, ServerConfig>) -> ReconcileReport {
        self.supervisor.reconcile(desired).await
    }

    /// State of every enabled server.
    pub fn get_servers(&self) -> Vec<ServerState> {
        self.registry().list()
    }

    pub fn get_provider_data(&self) -> Arc<ProviderSnapshot> {
        self.supervisor.snapshot()
    }

    pub async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: Option<Value>,
    ) -> Result<McpCallResult> {
        let result = self.invoker.call_tool(server_name, tool_name, arguments).await;
        self.refresh_after(&result);
        result
    }

    pub async fn read_resource(&self, server_name: &str, uri: &str) -> Result<ReadResourceResult> {
        let result = self.invoker.read_resource(server_name, uri).await;
        self.refresh_after(&result);
        result
    }

    pub async fn restart_connection(&self, server_name: &str) -> Result<()> {
        self.supervisor.restart(server_name).await
    }

    /// Ask `model` to choose a tool for `request`, with one corrective retry.
    pub async fn select_tool(
        &self,
        model: &dyn SelectionModel,
        request: &str,
        fallback_message: &str,
    ) -> SelectionOutcome {
        let snapshot = self.get_provider_data();
        let prompt = build_selection_prompt(request, &snapshot);

        let response = match model.complete(&prompt).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Tool selection request failed: {}", e);
                return SelectionOutcome::Fallback {
                    message: fallback_message.to_string(),
                    reason: e.to_string(),
                };
            }
        };

        SelectionRetry::new(model, self.validator.as_ref(), fallback_message)
            .run(&response, &snapshot)
            .await
    }

    /// Run a validated selection against its server.
    pub async fn execute_selection(&self, selection: &ToolSelection) -> Result<DispatchOutcome> {
        match selection {
            ToolSelection::Tool {
                server_name,
                tool_name,
                arguments,
                ..
            } => {
                let result = self
                    .call_tool(server_name, tool_name, Some(Value::Object(arguments.clone())))
                    .await?;
                Ok(DispatchOutcome::Tool {
                    server_name: server_name.clone(),
                    tool_name: tool_name.clone(),
                    result,
                })
            }
            ToolSelection::Resource {
                server_name, uri, ..
            } => {
                let result = self.read_resource(server_name, uri).await?;
                Ok(DispatchOutcome::Resource {
                    server_name: server_name.clone(),
                    uri: uri.clone(),
                    result,
                })
            }
            ToolSelection::NoToolAvailable { rationale } => Ok(DispatchOutcome::NoTool {
                rationale: rationale.clone(),
            }),
        }
    }

    /// Tear down every connection and drain background releases.
    pub async fn dispose(&self) {
        info!("Disposing MCP hub with {} servers", self.registry().len());
        self.supervisor.shutdown(DISPOSE_TIMEOUT).await;
    }

    fn refresh_after<T>(&self, result: &Result<T>) {
        if matches!(result, Err(e) if e.is_transport_fault()) {
            self.supervisor.rebuild_snapshot();
        }
    }
}
