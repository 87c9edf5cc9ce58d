//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::session_store::{MemorySessionStore, SessionStore};
use scopesync_core::{Replica, ScopeId, ServerScopeInfo, SyncSchema, SyncSetup};
use scopesync_sync_protocol::{
    payload_hash, RequestHeaders, Serializer, ServerOperation, SyncRequest, SyncResponse,
};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Encoded reply to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    /// HTTP-equivalent status.
    pub status: u16,
    /// Encoded [`SyncResponse`].
    pub body: Vec<u8>,
    /// SHA-256 hex digest of `body`.
    pub hash: String,
}

impl ServerResponse {
    fn new(status: u16, body: Vec<u8>) -> Self {
        let hash = payload_hash(&body);
        Self { status, body, hash }
    }

    /// Returns true for a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The sync server.
///
/// Owns the server replica, the registered scopes and the session store.
/// Transports hand every request to [`SyncServer::handle_request`] (or
/// [`SyncServer::handle_raw`] when headers are still name/value pairs) and
/// send back the returned status and body.
///
/// # Example
///
/// ```
/// use scopesync_core::{
///     ColumnDescriptor, ColumnType, Replica, ReplicaConfig, SyncSetup, TableDescriptor,
/// };
/// use scopesync_sync_server::{ServerConfig, SyncServer};
/// use std::sync::Arc;
///
/// let replica = Arc::new(Replica::in_memory(ReplicaConfig::new("server")).unwrap());
/// replica
///     .create_table(TableDescriptor::new(
///         "items",
///         vec![
///             ColumnDescriptor::new("id", ColumnType::Integer),
///             ColumnDescriptor::new("name", ColumnType::Text),
///         ],
///         vec!["id".to_string()],
///     ))
///     .unwrap();
///
/// let server = SyncServer::new(ServerConfig::default(), replica);
/// server.register_scope("default", &SyncSetup::new(["items"])).unwrap();
/// assert_eq!(server.session_count(), 0);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a server with an in-memory session store.
    pub fn new(config: ServerConfig, replica: Arc<Replica>) -> Self {
        let sessions = Arc::new(MemorySessionStore::new(config.session_ttl));
        Self::with_session_store(config, replica, sessions)
    }

    /// Creates a server over an existing session store.
    pub fn with_session_store(
        config: ServerConfig,
        replica: Arc<Replica>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let context = Arc::new(HandlerContext::new(config, replica, sessions));
        let handler = RequestHandler::new(Arc::clone(&context));
        Self { handler, context }
    }

    /// Registers (or re-registers) a scope over the replica's tables and
    /// provisions tracking for them.
    ///
    /// # Errors
    ///
    /// Returns schema errors if the setup names unknown tables or columns.
    pub fn register_scope(&self, name: &str, setup: &SyncSetup) -> ServerResult<ServerScopeInfo> {
        let replica = &self.context.replica;
        let schema = setup.resolve(&replica.schema())?;
        replica.provision(&schema)?;
        let version = schema.fingerprint()?;
        let last_cleanup_timestamp = replica
            .scopes()
            .server(name)
            .map_or(0, |existing| existing.last_cleanup_timestamp);
        let info = ServerScopeInfo {
            name: name.to_string(),
            schema,
            setup: setup.clone(),
            version,
            last_cleanup_timestamp,
        };
        replica.scopes().save_server(info.clone());
        tracing::info!(scope = name, version = %info.version, "registered scope");
        Ok(info)
    }

    /// Handles an encoded request body.
    ///
    /// Failures are encoded as [`SyncResponse::Error`] with the error's
    /// status; this method never fails.
    pub fn handle_request(&self, headers: &RequestHeaders, body: &[u8]) -> ServerResponse {
        let result = self.handler.handle_bytes(headers, body);
        self.respond(headers.serializer, result)
    }

    /// Handles a request whose headers are still raw name/value pairs.
    ///
    /// Header errors are answered in CBOR, since the serializer is unknown.
    pub fn handle_raw(&self, pairs: &[(&str, &str)], body: &[u8]) -> ServerResponse {
        match RequestHeaders::from_pairs(pairs.iter().copied()) {
            Ok(headers) => self.handle_request(&headers, body),
            Err(e) => self.respond(Serializer::default(), Err(e.into())),
        }
    }

    /// Handles a decoded request.
    ///
    /// # Errors
    ///
    /// Returns the step's error instead of encoding it.
    pub fn handle(
        &self,
        headers: &RequestHeaders,
        request: SyncRequest,
    ) -> ServerResult<SyncResponse> {
        self.handler.handle(headers, request)
    }

    fn respond(
        &self,
        serializer: Serializer,
        result: ServerResult<SyncResponse>,
    ) -> ServerResponse {
        let (status, response) = match result {
            Ok(response) => (200, response),
            Err(e) => {
                if e.is_server_error() {
                    tracing::error!(code = ?e.code(), error = %e, "request failed");
                } else {
                    tracing::warn!(code = ?e.code(), error = %e, "request rejected");
                }
                let body = e.to_response(self.context.config.verbose_errors);
                (e.status_code(), SyncResponse::Error(body))
            }
        };
        match serializer.encode(&response) {
            Ok(body) => ServerResponse::new(status, body),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode response");
                ServerResponse::new(500, Vec::new())
            }
        }
    }

    /// Materializes every row of `scope` into a snapshot served by
    /// `GetSnapshot`. Returns the number of parts.
    ///
    /// # Errors
    ///
    /// Returns `UnknownScope` or replica errors.
    pub fn create_snapshot(&self, scope: &str) -> ServerResult<u32> {
        let info = self.context.scope(scope)?;
        let replica = &self.context.replica;
        let timestamp = replica.local_timestamp()?;
        let selection = replica.select_all_rows(&info.schema)?;
        let batch =
            replica.build_batch(selection, self.context.config.max_rows_per_part, timestamp)?;
        let parts = batch.part_count();
        tracing::info!(scope, timestamp, parts, rows = batch.row_count(), "created snapshot");
        self.context.store_snapshot(scope, batch);
        Ok(parts)
    }

    /// Sets the operation `client` receives on its next `GetOperation`.
    /// Delivered operations other than `Normal` are cleared at `EndSession`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownScope` if the scope is not registered.
    pub fn set_operation(
        &self,
        scope: &str,
        client: ScopeId,
        operation: ServerOperation,
    ) -> ServerResult<()> {
        self.context.scope(scope)?;
        self.context.set_operation(scope, client, operation);
        Ok(())
    }

    /// Purges tombstones of `scope`'s tables that every client has already
    /// downloaded.
    ///
    /// Scopes sharing a table with `scope` are affected too. The bound is the
    /// lowest `last_sync_timestamp` among the client histories of all those
    /// scopes, and it is raised into each one's `last_cleanup_timestamp` so
    /// their lagging clients are flagged outdated. Returns the number of
    /// tracking rows purged, zero when no client has synced.
    ///
    /// # Errors
    ///
    /// Returns `UnknownScope` if the scope is not registered.
    pub fn delete_metadata(&self, scope: &str) -> ServerResult<usize> {
        let info = self.context.scope(scope)?;
        let replica = &self.context.replica;
        let tables: BTreeSet<&str> = info.schema.tables.iter().map(|t| t.name.as_str()).collect();
        let affected: Vec<ServerScopeInfo> = replica
            .scopes()
            .servers()
            .into_iter()
            .filter(|other| {
                other
                    .schema
                    .tables
                    .iter()
                    .any(|t| tables.contains(t.name.as_str()))
            })
            .collect();
        let Some(older_than) = affected
            .iter()
            .flat_map(|other| replica.scopes().histories(&other.name))
            .map(|h| h.last_sync_timestamp)
            .min()
        else {
            return Ok(0);
        };
        if older_than <= info.last_cleanup_timestamp {
            return Ok(0);
        }
        let purged = replica.delete_metadata(&info.schema, older_than)?;
        for mut other in affected {
            if other.last_cleanup_timestamp < older_than {
                other.last_cleanup_timestamp = older_than;
                replica.scopes().save_server(other);
            }
        }
        Ok(purged)
    }

    /// Unregisters `scope` and drops tracking of the tables no other scope
    /// uses. Data rows stay.
    ///
    /// # Errors
    ///
    /// Returns `UnknownScope` if the scope is not registered.
    pub fn deprovision_scope(&self, scope: &str) -> ServerResult<()> {
        let info = self.context.scope(scope)?;
        let replica = &self.context.replica;
        replica.scopes().remove_server(scope);
        let shared: BTreeSet<String> = replica
            .scopes()
            .servers()
            .into_iter()
            .flat_map(|other| other.schema.tables.into_iter().map(|t| t.name))
            .collect();
        let orphaned = info
            .schema
            .tables
            .into_iter()
            .filter(|t| !shared.contains(&t.name))
            .collect();
        replica.deprovision(&SyncSchema::new(orphaned));
        self.context.forget_scope(scope);
        tracing::info!(scope, "deprovisioned scope");
        Ok(())
    }

    /// Removes expired sessions and their staged batches. Returns how many
    /// were removed.
    pub fn evict_expired_sessions(&self) -> usize {
        let mut expired = self.context.sessions.evict_expired();
        for session in &mut expired {
            tracing::info!(
                session_id = %session.id,
                scope = %session.scope_name,
                "session expired"
            );
            session.release_batches();
        }
        expired.len()
    }

    /// Spawns a task that evicts expired sessions every
    /// `reaper_interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_session_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = Arc::downgrade(self);
        let period = self.context.config.reaper_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(server) = server.upgrade() else {
                    break;
                };
                let evicted = server.evict_expired_sessions();
                if evicted > 0 {
                    tracing::debug!(evicted, "session reaper pass");
                }
            }
        })
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.context.sessions.len()
    }

    /// The server replica.
    pub fn replica(&self) -> &Arc<Replica> {
        &self.context.replica
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("replica", &self.context.replica)
            .field("sessions", &self.context.sessions.len())
            .finish()
    }
}
