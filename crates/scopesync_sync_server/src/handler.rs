//! Step handlers.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::session::{Session, SessionState};
use crate::session_store::SessionStore;
use crate::snapshot::Snapshot;
use parking_lot::RwLock;
use scopesync_core::{
    now_millis, ApplyContext, ApplyRole, BatchAssembler, BatchInfo, ReceiveOutcome, Replica,
    ScopeId, ServerHistoryScopeInfo, ServerScopeInfo,
};
use scopesync_sync_protocol::{
    verify_hash, ChangesPart, ChangesProgress, ContextMessage, EndSessionRequest,
    EnsureSchemaResponse, EnsureScopesRequest, EnsureScopesResponse, EstimatedChangesRequest,
    EstimatedChangesResponse, GetChangesRequest, GetOperationResponse, ProtocolError,
    RemoteTimestampResponse, RequestHeaders, ScopeSummary, SendChangesRequest,
    SendChangesResponse, ServerBatchInfo, ServerOperation, SummaryResponse, SyncRequest,
    SyncResponse, SyncStep, STEP_HEADER,
};
use std::collections::HashMap;
use std::sync::Arc;

/// State shared by every request.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// The server replica.
    pub replica: Arc<Replica>,
    /// Session storage.
    pub sessions: Arc<dyn SessionStore>,
    /// Pending operations per (scope, client).
    operations: RwLock<HashMap<(String, ScopeId), ServerOperation>>,
    /// Current snapshot per scope.
    snapshots: RwLock<HashMap<String, Arc<Snapshot>>>,
}

impl HandlerContext {
    /// Creates a handler context.
    pub fn new(
        config: ServerConfig,
        replica: Arc<Replica>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config,
            replica,
            sessions,
            operations: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Looks up a registered scope.
    ///
    /// # Errors
    ///
    /// Returns `UnknownScope` if no scope has that name.
    pub fn scope(&self, name: &str) -> ServerResult<ServerScopeInfo> {
        self.replica
            .scopes()
            .server(name)
            .ok_or_else(|| ServerError::UnknownScope(name.to_string()))
    }

    /// Sets the operation handed to `client` on its next `GetOperation`.
    pub fn set_operation(&self, scope: &str, client: ScopeId, operation: ServerOperation) {
        let key = (scope.to_string(), client);
        let mut operations = self.operations.write();
        if operation == ServerOperation::Normal {
            operations.remove(&key);
        } else {
            operations.insert(key, operation);
        }
    }

    /// Operation pending for `client`.
    pub fn operation(&self, scope: &str, client: ScopeId) -> ServerOperation {
        self.operations
            .read()
            .get(&(scope.to_string(), client))
            .copied()
            .unwrap_or_default()
    }

    /// Makes `batch` the snapshot new downloads of `scope` start from.
    /// Sessions already streaming the previous one keep it.
    pub fn store_snapshot(&self, scope: &str, batch: BatchInfo) {
        self.snapshots
            .write()
            .insert(scope.to_string(), Snapshot::new(batch));
    }

    /// Drops the snapshot and pending operations of `scope`.
    pub fn forget_scope(&self, scope: &str) {
        self.operations.write().retain(|(name, _), _| name != scope);
        self.snapshots.write().remove(scope);
    }

    /// Current snapshot of `scope`, if one was created.
    pub fn snapshot(&self, scope: &str) -> Option<Arc<Snapshot>> {
        self.snapshots.read().get(scope).cloned()
    }
}

/// Dispatches decoded requests to step handlers.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Verifies and decodes `body`, then handles it.
    ///
    /// # Errors
    ///
    /// Returns protocol errors for hash and decoding failures, and any error
    /// of [`RequestHandler::handle`].
    pub fn handle_bytes(
        &self,
        headers: &RequestHeaders,
        body: &[u8],
    ) -> ServerResult<SyncResponse> {
        match &headers.hash {
            Some(hash) => verify_hash(body, hash)?,
            None if self.context.config.require_hash => return Err(ServerError::HashRequired),
            None => {}
        }
        let request = SyncRequest::decode(headers.step, headers.serializer, body)?;
        self.handle(headers, request)
    }

    /// Handles one request.
    ///
    /// The session is read, a copy is mutated by the step handler and the
    /// copy is stored only if the step succeeds.
    ///
    /// # Errors
    ///
    /// Returns `SessionMismatch`, `UnknownScope`, `SessionLost` or
    /// `StepOutOfSequence` for requests that do not fit the session, and
    /// replica errors raised by the step.
    pub fn handle(
        &self,
        headers: &RequestHeaders,
        request: SyncRequest,
    ) -> ServerResult<SyncResponse> {
        let step = request.step();
        if step != headers.step {
            return Err(ProtocolError::InvalidHeader {
                name: STEP_HEADER,
                value: headers.step.to_code().to_string(),
            }
            .into());
        }
        let context = request.context();
        if context.session_id != headers.session_id {
            return Err(ServerError::SessionMismatch(format!(
                "payload session {} differs from header session {}",
                context.session_id, headers.session_id
            )));
        }
        if context.scope_name != headers.scope_name {
            return Err(ServerError::SessionMismatch(format!(
                "payload scope {} differs from header scope {}",
                context.scope_name, headers.scope_name
            )));
        }
        let scope = self.context.scope(&headers.scope_name)?;

        let session = match self.context.sessions.get(&headers.session_id) {
            Some(session) => session,
            None if step.opens_session() => {
                tracing::debug!(
                    session_id = %headers.session_id,
                    scope = %headers.scope_name,
                    "opening session"
                );
                Session::new(headers.session_id, &headers.scope_name, context.client_id)
            }
            None => return Err(ServerError::SessionLost(headers.session_id)),
        };
        if session.scope_name != headers.scope_name || session.client_id != context.client_id {
            return Err(ServerError::SessionMismatch(format!(
                "session {} belongs to another scope or client",
                session.id
            )));
        }
        session.check_step(step)?;

        tracing::debug!(
            session_id = %session.id,
            scope = %session.scope_name,
            step = %step,
            state = %session.state,
            "handling step"
        );

        let mut working = session;
        working.sync_type = context.sync_type;
        let mut spent = Vec::new();
        let response = match request {
            SyncRequest::EnsureScopes(r) => self.ensure_scopes(&mut working, &scope, r),
            SyncRequest::EnsureSchema(_) => Ok(SyncResponse::EnsureSchema(EnsureSchemaResponse {
                context: working.context(),
                scope,
            })),
            SyncRequest::GetOperation(_) => Ok(self.get_operation(&mut working)),
            SyncRequest::GetSnapshot(r) => self.get_snapshot(&mut working, r),
            SyncRequest::SendChangesInProgress(r) => {
                self.send_changes(&mut working, &scope, r, &mut spent)
            }
            SyncRequest::GetMoreChanges(r) => self.get_more_changes(&mut working, r),
            SyncRequest::GetChangesInProgress(_) => Ok(Self::changes_in_progress(&working)),
            SyncRequest::SendEndDownloadChanges(_) => Ok(Self::end_download(&mut working)),
            SyncRequest::GetSummary(_) => Ok(SyncResponse::Summary(SummaryResponse {
                context: working.context(),
                state: working.state.name().to_string(),
            })),
            SyncRequest::GetEstimatedChangesCount(r) => self.estimate(&working, &scope, r),
            SyncRequest::GetRemoteClientTimestamp(_) => {
                Ok(SyncResponse::RemoteTimestamp(RemoteTimestampResponse {
                    context: working.context(),
                    timestamp: self.context.replica.local_timestamp()?,
                }))
            }
            SyncRequest::EndSession(r) => Ok(self.end_session(&mut working, r)),
        }?;

        if working.state == SessionState::Ended {
            self.context.sessions.remove(&working.id);
        } else {
            self.context.sessions.put(working);
        }
        // The stored session no longer refers to these.
        for mut batch in spent {
            if let Err(e) = batch.clear() {
                tracing::warn!(batch_id = batch.id(), error = %e, "failed to clear applied batch");
            }
        }
        Ok(response)
    }

    fn ensure_scopes(
        &self,
        session: &mut Session,
        scope: &ServerScopeInfo,
        request: EnsureScopesRequest,
    ) -> ServerResult<SyncResponse> {
        let is_outdated = request
            .last_server_sync_timestamp
            .is_some_and(|ts| ts < scope.last_cleanup_timestamp);
        if is_outdated {
            tracing::warn!(
                session_id = %session.id,
                scope = %scope.name,
                client = %session.client_id,
                "client scope is outdated"
            );
        }
        session.transition(SessionState::EnsuringScope);
        Ok(SyncResponse::EnsureScopes(EnsureScopesResponse {
            context: session.context(),
            scope: ScopeSummary {
                server_scope_id: self.context.replica.id(),
                version: scope.version.clone(),
                last_cleanup_timestamp: scope.last_cleanup_timestamp,
                is_outdated,
            },
        }))
    }

    fn get_operation(&self, session: &mut Session) -> SyncResponse {
        let operation = self
            .context
            .operation(&session.scope_name, session.client_id);
        session.delivered_operation = Some(operation);
        SyncResponse::Operation(GetOperationResponse {
            context: session.context(),
            operation,
        })
    }

    fn get_snapshot(
        &self,
        session: &mut Session,
        request: GetChangesRequest,
    ) -> ServerResult<SyncResponse> {
        if session.snapshot.is_none() {
            session.snapshot = self.context.snapshot(&session.scope_name);
        }
        let Some(snapshot) = session.snapshot.as_ref() else {
            return Ok(SyncResponse::Changes(ChangesPart {
                context: session.context(),
                batch_index: request.batch_index,
                batch_count: 0,
                is_last_batch: true,
                table: String::new(),
                rows: Vec::new(),
                remote_timestamp: 0,
            }));
        };
        let part = snapshot.batch().part(request.batch_index)?;
        Ok(SyncResponse::Changes(ChangesPart {
            context: session.context(),
            batch_index: part.index,
            batch_count: snapshot.batch().part_count(),
            is_last_batch: part.is_last,
            table: part.table,
            rows: part.rows,
            remote_timestamp: snapshot.timestamp(),
        }))
    }

    fn send_changes(
        &self,
        session: &mut Session,
        scope: &ServerScopeInfo,
        request: SendChangesRequest,
        spent: &mut Vec<BatchInfo>,
    ) -> ServerResult<SyncResponse> {
        if session.state == SessionState::SendingServerChanges {
            // Only a retransmit of the terminal part is valid here.
            return match &session.upload_response {
                Some(cached)
                    if request.is_last_batch && cached.batch_index == request.batch_index =>
                {
                    tracing::debug!(
                        session_id = %session.id,
                        batch_index = request.batch_index,
                        "replaying response to last uploaded part"
                    );
                    Ok(SyncResponse::SendChanges(cached.clone()))
                }
                _ => Err(ServerError::StepOutOfSequence {
                    step: SyncStep::SendChangesInProgress,
                    state: session.state,
                }),
            };
        }

        let replica = &self.context.replica;
        let assembler = session.inbound.get_or_insert_with(|| {
            BatchAssembler::new(replica.new_batch(replica.current_timestamp()))
        });
        let row_count = request.rows.len() as u64;
        if assembler.receive(request.to_part())? == ReceiveOutcome::Accepted {
            session.counters.rows_uploaded += row_count;
        }
        session.transition(SessionState::ReceivingClientChanges);

        let complete = session
            .inbound
            .as_ref()
            .is_some_and(BatchAssembler::is_complete);
        if !complete {
            let response = SendChangesResponse {
                context: session.context(),
                batch_index: request.batch_index,
                server_batch: None,
            };
            session.upload_response = Some(response.clone());
            return Ok(SyncResponse::SendChanges(response));
        }

        session.transition(SessionState::ApplyingAndSelecting);
        let remote_timestamp = replica.local_timestamp()?;
        let since = request.last_server_sync_timestamp.unwrap_or(0);
        let policy = self.context.config.conflict_policy;
        let ctx = ApplyContext {
            sender: session.client_id,
            client_min_timestamp: since,
            force_write: false,
            role: ApplyRole::Server,
            resolver: &policy,
        };
        let applied = match session.inbound.take() {
            Some(assembler) => {
                let inbound = assembler.into_batch();
                let stats = replica.apply_batch(&scope.schema, &inbound, &ctx)?;
                spent.push(inbound);
                stats
            }
            None => Default::default(),
        };
        session.counters.rows_applied_on_server += applied.total_applied();
        session.counters.server_conflicts += applied.total_conflicts();
        session.counters.server_failed += applied.total_failed();

        let selection = if session.sync_type.reinitializes() {
            replica.select_all_rows(&scope.schema)?
        } else {
            replica.select_changes(&scope.schema, since, session.client_id)?
        };
        let outbound = replica.build_batch(
            selection,
            self.context.config.max_rows_per_part,
            remote_timestamp,
        )?;
        session.counters.rows_selected = outbound.row_count();

        tracing::info!(
            session_id = %session.id,
            scope = %session.scope_name,
            uploaded = session.counters.rows_uploaded,
            applied = applied.total_applied(),
            conflicts = applied.total_conflicts(),
            selected = outbound.row_count(),
            parts = outbound.part_count(),
            remote_timestamp,
            "applied upload and selected download"
        );

        let server_batch = ServerBatchInfo {
            remote_timestamp,
            batch_count: outbound.part_count(),
            row_count: outbound.row_count(),
            applied,
        };
        session.outbound = Some(outbound);
        session.remote_timestamp = Some(remote_timestamp);
        session.last_served_index = None;
        session.transition(SessionState::SendingServerChanges);

        let response = SendChangesResponse {
            context: session.context(),
            batch_index: request.batch_index,
            server_batch: Some(server_batch),
        };
        session.upload_response = Some(response.clone());
        Ok(SyncResponse::SendChanges(response))
    }

    fn get_more_changes(
        &self,
        session: &mut Session,
        request: GetChangesRequest,
    ) -> ServerResult<SyncResponse> {
        let Some(outbound) = &session.outbound else {
            return Err(ServerError::StepOutOfSequence {
                step: SyncStep::GetMoreChanges,
                state: session.state,
            });
        };
        let part = outbound.part(request.batch_index)?;
        let batch_count = outbound.part_count();
        let remote_timestamp = outbound.timestamp();
        if session
            .last_served_index
            .map_or(true, |served| part.index > served)
        {
            session.counters.rows_downloaded += part.rows.len() as u64;
            session.last_served_index = Some(part.index);
        }
        tracing::debug!(
            session_id = %session.id,
            batch_index = part.index,
            batch_count,
            rows = part.rows.len(),
            "serving download part"
        );
        Ok(SyncResponse::Changes(ChangesPart {
            context: session.context(),
            batch_index: part.index,
            batch_count,
            is_last_batch: part.is_last,
            table: part.table,
            rows: part.rows,
            remote_timestamp,
        }))
    }

    fn changes_in_progress(session: &Session) -> SyncResponse {
        SyncResponse::Progress(ChangesProgress {
            context: session.context(),
            batch_count: session.outbound.as_ref().map_or(0, BatchInfo::part_count),
            next_index: session.last_served_index.map_or(0, |i| i + 1),
            remote_timestamp: session.remote_timestamp,
        })
    }

    fn end_download(session: &mut Session) -> SyncResponse {
        if let Some(mut outbound) = session.outbound.take() {
            if let Err(e) = outbound.clear() {
                tracing::warn!(
                    session_id = %session.id,
                    error = %e,
                    "failed to clear outbound batch"
                );
            }
        }
        SyncResponse::Ack(ContextMessage {
            context: session.context(),
        })
    }

    fn estimate(
        &self,
        session: &Session,
        scope: &ServerScopeInfo,
        request: EstimatedChangesRequest,
    ) -> ServerResult<SyncResponse> {
        let count = self.context.replica.estimate_changes(
            &scope.schema,
            request.last_server_sync_timestamp.unwrap_or(0),
            session.client_id,
        )?;
        Ok(SyncResponse::EstimatedChanges(EstimatedChangesResponse {
            context: session.context(),
            count,
        }))
    }

    fn end_session(&self, session: &mut Session, request: EndSessionRequest) -> SyncResponse {
        let scopes = self.context.replica.scopes();
        let previous = scopes.history(&session.scope_name, session.client_id);
        let last_sync_timestamp = request
            .remote_timestamp
            .or(session.remote_timestamp)
            .or(previous.map(|h| h.last_sync_timestamp))
            .unwrap_or(0);
        scopes.save_history(ServerHistoryScopeInfo {
            id: session.client_id,
            name: session.scope_name.clone(),
            last_sync_timestamp,
            last_sync: now_millis(),
            last_sync_duration_ms: request.duration_ms,
        });

        if session
            .delivered_operation
            .is_some_and(|op| op != ServerOperation::Normal)
        {
            self.context
                .set_operation(&session.scope_name, session.client_id, ServerOperation::Normal);
        }
        session.release_batches();

        tracing::info!(
            session_id = %session.id,
            scope = %session.scope_name,
            client = %session.client_id,
            uploaded = session.counters.rows_uploaded,
            downloaded = session.counters.rows_downloaded,
            server_conflicts = session.counters.server_conflicts,
            client_applied = request.client_applied.total_applied(),
            client_conflicts = request.client_applied.total_conflicts(),
            elapsed_ms = session.started_at.elapsed().as_millis() as u64,
            "session ended"
        );
        session.transition(SessionState::Ended);
        SyncResponse::Ack(ContextMessage {
            context: session.context(),
        })
    }
}
