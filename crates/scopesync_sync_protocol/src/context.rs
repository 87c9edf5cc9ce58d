//! Sync context carried by every payload.

use crate::headers::SessionId;
use scopesync_core::ScopeId;
use serde::{Deserialize, Serialize};

/// Kind of synchronization the client performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncType {
    /// Exchange changes since the last sync.
    #[default]
    Normal,
    /// Drop local rows of the scope and download everything.
    Reinitialize,
    /// Upload local changes, then reinitialize.
    ReinitializeWithUpload,
}

impl SyncType {
    /// Returns true if the client uploads its changes.
    pub fn uploads(&self) -> bool {
        !matches!(self, SyncType::Reinitialize)
    }

    /// Returns true if the client discards its rows before downloading.
    pub fn reinitializes(&self) -> bool {
        !matches!(self, SyncType::Normal)
    }
}

/// Running counters of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounters {
    /// Rows uploaded by the client.
    pub rows_uploaded: u64,
    /// Uploaded rows the server wrote.
    pub rows_applied_on_server: u64,
    /// Conflicts detected on the server.
    pub server_conflicts: u64,
    /// Rows the server failed to write.
    pub server_failed: u64,
    /// Rows the server selected for download.
    pub rows_selected: u64,
    /// Rows served to the client so far.
    pub rows_downloaded: u64,
}

/// Context shared by request and response payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncContext {
    /// Session id; must match the request headers.
    pub session_id: SessionId,
    /// Scope name; must match the request headers.
    pub scope_name: String,
    /// The client's scope id.
    pub client_id: ScopeId,
    /// Kind of synchronization.
    pub sync_type: SyncType,
    /// Counters as known by the sender.
    pub counters: SyncCounters,
}

impl SyncContext {
    /// Creates a context with zero counters.
    pub fn new(session_id: SessionId, scope_name: impl Into<String>, client_id: ScopeId) -> Self {
        Self {
            session_id,
            scope_name: scope_name.into(),
            client_id,
            sync_type: SyncType::Normal,
            counters: SyncCounters::default(),
        }
    }

    /// Sets the sync type.
    #[must_use]
    pub fn with_sync_type(mut self, sync_type: SyncType) -> Self {
        self.sync_type = sync_type;
        self
    }
}
