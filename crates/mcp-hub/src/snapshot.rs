use serde::Serialize;
use std::collections::BTreeMap;

use crate::catalog::{render_summary, ServerCatalog};
use crate::registry::ConnectionRegistry;
use crate::types::ServerStatus;

/// Read-mostly view of every connected server's filtered catalog, used to
/// build prompts and to validate model selections.
///
/// Advisory only: invocation always goes back to the live connection.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSnapshot {
    pub servers: BTreeMap<String, ServerCatalog>,
    /// Enabled servers that are not usable right now
    pub unavailable: BTreeMap<String, ServerStatus>,
    pub summary: String,
}

impl ProviderSnapshot {
    pub fn from_registry(registry: &ConnectionRegistry) -> Self {
        let mut servers = BTreeMap::new();
        let mut unavailable = BTreeMap::new();

        for state in registry.list() {
            if state.status == ServerStatus::Connected {
                servers.insert(state.name, state.catalog);
            } else {
                unavailable.insert(state.name, state.status);
            }
        }

        let summary = render(&servers, &unavailable);
        Self {
            servers,
            unavailable,
            summary,
        }
    }

    pub fn catalog(&self, server: &str) -> Option<&ServerCatalog> {
        self.servers.get(server)
    }

    pub fn server_names(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }

    pub fn tool_count(&self) -> usize {
        self.servers.values().map(|catalog| catalog.tools.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

fn render(
    servers: &BTreeMap<String, ServerCatalog>,
    unavailable: &BTreeMap<String, ServerStatus>,
) -> String {
    let mut summary = if servers.is_empty() {
        "No MCP servers are connected.".to_string()
    } else {
        render_summary(servers)
    };

    if !unavailable.is_empty() {
        let names = unavailable
            .iter()
            .map(|(name, status)| format!("{} ({})", name, status))
            .collect::<Vec<_>>()
            .join(", ");
        summary.push_str("\n\nUnavailable servers: ");
        summary.push_str(&names);
    }

    summary
}
