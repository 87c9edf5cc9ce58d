//! Scope records kept by clients and servers.

use crate::schema::{SyncSchema, SyncSetup};
use crate::types::ScopeId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A client's view of one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientScopeInfo {
    /// The client's scope id, stamped into rows the server receives from it.
    pub id: ScopeId,
    /// Scope name.
    pub name: String,
    /// Resolved schema, once known.
    pub schema: Option<SyncSchema>,
    /// Setup the schema was resolved from.
    pub setup: Option<SyncSetup>,
    /// Client timestamp at the start of the last successful sync.
    pub last_sync_timestamp: Option<u64>,
    /// Server timestamp the last successful sync downloaded up to.
    pub last_server_sync_timestamp: Option<u64>,
    /// Wall-clock millis of the last successful sync.
    pub last_sync: Option<u64>,
    /// Duration of the last successful sync in millis.
    pub last_sync_duration_ms: u64,
}

impl ClientScopeInfo {
    /// Creates a scope that has never synchronized.
    pub fn new(id: ScopeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            schema: None,
            setup: None,
            last_sync_timestamp: None,
            last_server_sync_timestamp: None,
            last_sync: None,
            last_sync_duration_ms: 0,
        }
    }

    /// True until the first successful synchronization.
    pub fn is_new(&self) -> bool {
        self.last_sync.is_none()
    }
}

/// The server's definition of one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerScopeInfo {
    /// Scope name.
    pub name: String,
    /// Resolved schema.
    pub schema: SyncSchema,
    /// Setup the schema was resolved from.
    pub setup: SyncSetup,
    /// Schema fingerprint.
    pub version: String,
    /// Tombstones at or below this timestamp have been purged.
    pub last_cleanup_timestamp: u64,
}

/// The server's record of one client's syncs in one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHistoryScopeInfo {
    /// Client scope id.
    pub id: ScopeId,
    /// Scope name.
    pub name: String,
    /// Server timestamp the client last downloaded up to.
    pub last_sync_timestamp: u64,
    /// Wall-clock millis of the last sync.
    pub last_sync: u64,
    /// Duration of the last sync in millis.
    pub last_sync_duration_ms: u64,
}

/// Scope records of one replica.
#[derive(Debug, Default)]
pub struct ScopeStore {
    clients: RwLock<BTreeMap<String, ClientScopeInfo>>,
    servers: RwLock<BTreeMap<String, ServerScopeInfo>>,
    histories: RwLock<BTreeMap<(String, ScopeId), ServerHistoryScopeInfo>>,
}

impl ScopeStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the client scope `name`.
    pub fn client(&self, name: &str) -> Option<ClientScopeInfo> {
        self.clients.read().get(name).cloned()
    }

    /// Inserts or replaces a client scope.
    pub fn save_client(&self, info: ClientScopeInfo) {
        self.clients.write().insert(info.name.clone(), info);
    }

    /// Removes a client scope.
    pub fn remove_client(&self, name: &str) -> Option<ClientScopeInfo> {
        self.clients.write().remove(name)
    }

    /// Returns the server scope `name`.
    pub fn server(&self, name: &str) -> Option<ServerScopeInfo> {
        self.servers.read().get(name).cloned()
    }

    /// Inserts or replaces a server scope.
    pub fn save_server(&self, info: ServerScopeInfo) {
        self.servers.write().insert(info.name.clone(), info);
    }

    /// All server scopes.
    pub fn servers(&self) -> Vec<ServerScopeInfo> {
        self.servers.read().values().cloned().collect()
    }

    /// Removes a server scope and its client histories.
    pub fn remove_server(&self, name: &str) -> Option<ServerScopeInfo> {
        self.histories.write().retain(|(scope, _), _| scope != name);
        self.servers.write().remove(name)
    }

    /// Returns a client's history in scope `name`.
    pub fn history(&self, name: &str, client: ScopeId) -> Option<ServerHistoryScopeInfo> {
        self.histories
            .read()
            .get(&(name.to_string(), client))
            .cloned()
    }

    /// Inserts or replaces a client history.
    pub fn save_history(&self, info: ServerHistoryScopeInfo) {
        self.histories
            .write()
            .insert((info.name.clone(), info.id), info);
    }

    /// All client histories of scope `name`.
    pub fn histories(&self, name: &str) -> Vec<ServerHistoryScopeInfo> {
        self.histories
            .read()
            .values()
            .filter(|h| h.name == name)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(name: &str, id: ScopeId, ts: u64) -> ServerHistoryScopeInfo {
        ServerHistoryScopeInfo {
            id,
            name: name.into(),
            last_sync_timestamp: ts,
            last_sync: 0,
            last_sync_duration_ms: 0,
        }
    }

    #[test]
    fn client_scope_lifecycle() {
        let store = ScopeStore::new();
        let info = ClientScopeInfo::new(ScopeId::new(), "default");
        assert!(info.is_new());
        store.save_client(info.clone());
        assert_eq!(store.client("default"), Some(info));
        assert!(store.remove_client("default").is_some());
        assert!(store.client("default").is_none());
    }

    #[test]
    fn histories_are_per_scope() {
        let store = ScopeStore::new();
        let client = ScopeId::new();
        store.save_history(history("a", client, 3));
        store.save_history(history("b", client, 4));
        store.save_history(history("a", ScopeId::new(), 5));
        assert_eq!(store.histories("a").len(), 2);
        assert_eq!(store.history("b", client).unwrap().last_sync_timestamp, 4);

        store.save_server(ServerScopeInfo {
            name: "a".into(),
            schema: SyncSchema::default(),
            setup: SyncSetup::default(),
            version: String::new(),
            last_cleanup_timestamp: 0,
        });
        store.remove_server("a");
        assert!(store.histories("a").is_empty());
        assert_eq!(store.histories("b").len(), 1);
    }
}
