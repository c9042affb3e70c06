use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::protocol::{McpClient, McpTransport};
use crate::types::{ServerState, ServerStatus};

/// State cell shared between a connection and its transport hooks.
pub type SharedState = Arc<RwLock<ServerState>>;

/// The live handles behind a connection.
#[derive(Clone)]
pub struct ConnectionHandles {
    pub transport: Arc<dyn McpTransport>,
    pub client: Arc<dyn McpClient>,
}

/// One named server connection.
///
/// Disabled or never-opened entries carry no handles.
pub struct Connection {
    name: String,
    generation: Uuid,
    config: ServerConfig,
    fingerprint: String,
    handles: Option<ConnectionHandles>,
    released: AtomicBool,
    state: SharedState,
}

impl Connection {
    pub fn new(
        name: impl Into<String>,
        config: ServerConfig,
        handles: Option<ConnectionHandles>,
        state: SharedState,
    ) -> Self {
        let fingerprint = config.fingerprint();
        Self {
            name: name.into(),
            generation: Uuid::new_v4(),
            config,
            fingerprint,
            handles,
            released: AtomicBool::new(false),
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique per connection attempt; a reconnect gets a new one.
    pub fn generation(&self) -> Uuid {
        self.generation
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn client(&self) -> Option<Arc<dyn McpClient>> {
        self.handles.as_ref().map(|handles| handles.client.clone())
    }

    /// The handles to release, handed out once.
    pub(crate) fn take_handles(&self) -> Option<ConnectionHandles> {
        if self.released.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.handles.clone()
    }

    pub(crate) fn shared_state(&self) -> &SharedState {
        &self.state
    }

    /// Copy of the current state.
    pub fn state(&self) -> ServerState {
        self.state.read().clone()
    }

    pub fn status(&self) -> ServerStatus {
        self.state.read().status
    }

    pub fn is_disabled(&self) -> bool {
        self.state.read().disabled
    }
}

/// In-memory collection of named connections, at most one per name.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<Vec<Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// States of all enabled connections, in insertion order.
    pub fn list(&self) -> Vec<ServerState> {
        self.connections
            .read()
            .iter()
            .map(|connection| connection.state())
            .filter(|state| !state.disabled)
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .find(|connection| connection.name == name)
            .cloned()
    }

    /// Insert `connection`, removing any entry with the same name first.
    ///
    /// Returns the displaced entry so its handles can be released.
    pub fn upsert(&self, connection: Connection) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write();
        let index = connections
            .iter()
            .position(|existing| existing.name == connection.name);
        let displaced = index.map(|index| connections.remove(index));
        connections.push(Arc::new(connection));
        displaced
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write();
        let index = connections
            .iter()
            .position(|connection| connection.name == name);
        index.map(|index| connections.remove(index))
    }

    pub fn names(&self) -> Vec<String> {
        self.connections
            .read()
            .iter()
            .map(|connection| connection.name.clone())
            .collect()
    }

    /// Every entry, disabled ones included.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().clone()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, state: ServerState) -> Connection {
        Connection::new(
            name,
            ServerConfig::stdio("x", vec![]),
            None,
            Arc::new(RwLock::new(state)),
        )
    }

    #[test]
    fn upsert_replaces_entry_with_same_name() {
        let registry = ConnectionRegistry::new();
        assert!(registry
            .upsert(entry("a", ServerState::connecting("a")))
            .is_none());
        let first = registry.find("a").unwrap().generation();

        let displaced = registry
            .upsert(entry("a", ServerState::connecting("a")))
            .unwrap();
        assert_eq!(displaced.generation(), first);
        assert_eq!(registry.len(), 1);
        assert_ne!(registry.find("a").unwrap().generation(), first);
    }

    #[test]
    fn list_excludes_disabled_entries() {
        let registry = ConnectionRegistry::new();
        registry.upsert(entry("on", ServerState::connecting("on")));
        registry.upsert(entry("off", ServerState::disabled("off")));

        let names: Vec<_> = registry.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["on".to_string()]);
        assert_eq!(registry.names().len(), 2);
        assert!(registry.find("off").unwrap().is_disabled());
    }

    #[test]
    fn remove_returns_entry_once() {
        let registry = ConnectionRegistry::new();
        registry.upsert(entry("a", ServerState::connecting("a")));
        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(registry.is_empty());
    }
}
