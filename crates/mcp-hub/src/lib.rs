//! MCP (Model Context Protocol) connection hub
//!
//! This crate keeps a set of MCP tool servers (stdio subprocesses or SSE
//! endpoints) connected according to configuration, builds their tool
//! catalogs, dispatches tool calls and resource reads, and validates
//! model-produced tool selections with a single corrective retry.

pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transports;
pub mod types;

pub mod hub;
pub mod invoker;
pub mod selection;
pub mod snapshot;
pub mod supervisor;

pub use catalog::{render_summary, CatalogBuilder, ServerCatalog, ToolFilter};
pub use cleanup::CleanupQueue;
pub use config::*;
pub use error::{McpError, Result};
pub use hub::{DispatchOutcome, McpHub};
pub use invoker::ToolInvoker;
pub use protocol::*;
pub use registry::{Connection, ConnectionHandles, ConnectionRegistry, SharedState};
pub use selection::{
    CatalogValidator, RetryState, SelectionError, SelectionModel, SelectionOutcome,
    SelectionRetry, SelectionValidator, ToolSelection,
};
pub use snapshot::ProviderSnapshot;
pub use supervisor::{
    ConnectionSupervisor, Connector, ReconcileReport, StateHooks, TransportConnector,
};
pub use transports::*;
pub use types::*;
