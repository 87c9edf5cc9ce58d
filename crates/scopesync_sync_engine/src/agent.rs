//! Client half of a synchronization.
//!
//! A [`SyncAgent`] drives one exchange from `EnsureScopes` to `EndSession`:
//!
//! 1. agree on the scope and schema, provisioning tracking locally
//! 2. pick up the operation the server has queued for this client
//! 3. optionally bootstrap from a server snapshot
//! 4. upload local changes as a batch of parts
//! 5. download the server's batch and apply it
//! 6. end the session and persist the new high-water timestamps
//!
//! Only a completed exchange updates the client scope record, so a failed
//! synchronization can always be repeated.

use crate::config::{OutdatedAction, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use parking_lot::RwLock;
use scopesync_core::{
    now_millis, ApplyContext, ApplyRole, ApplyStats, BatchAssembler, BatchInfo, ClientScopeInfo,
    ReceiveOutcome, Replica, ScopeId, SyncSchema, TableChangesSelected,
};
use scopesync_sync_protocol::{
    ChangesPart, ContextMessage, EndSessionRequest, EnsureScopesRequest, EstimatedChangesRequest,
    GetChangesRequest, ProtocolError, ScopeSummary, SendChangesRequest, ServerBatchInfo,
    ServerOperation, SessionId, SyncContext, SyncRequest, SyncResponse, SyncStep, SyncType,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The current state of a sync agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Not syncing.
    Idle,
    /// Agreeing on scope, schema and operation.
    EnsuringScope,
    /// Downloading and applying a server snapshot.
    ApplyingSnapshot,
    /// Sending local changes.
    Uploading,
    /// Receiving and applying server changes.
    Downloading,
    /// Closing the session.
    Ending,
    /// The last synchronization completed.
    Synced,
    /// The last synchronization failed.
    Error,
    /// Waiting before a retry.
    RetryWait,
}

impl AgentState {
    /// Returns true while an exchange is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AgentState::EnsuringScope
                | AgentState::ApplyingSnapshot
                | AgentState::Uploading
                | AgentState::Downloading
                | AgentState::Ending
        )
    }
}

/// Cumulative statistics across synchronizations.
#[derive(Debug, Clone, Default)]
pub struct AgentStats {
    /// Synchronizations that completed.
    pub cycles_completed: u64,
    /// Synchronizations that failed.
    pub cycles_failed: u64,
    /// Rows sent to the server.
    pub rows_uploaded: u64,
    /// Rows received from the server.
    pub rows_downloaded: u64,
    /// Conflicts on either side.
    pub conflicts: u64,
    /// Requests re-sent and synchronizations restarted.
    pub retries: u64,
    /// When the last synchronization completed.
    pub last_sync_time: Option<Instant>,
    /// Message of the last failure.
    pub last_error: Option<String>,
}

/// Result summary of one synchronization.
///
/// A failed synchronization carries the counters gathered so far inside
/// [`SyncError::Aborted`].
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    /// Scope name.
    pub scope_name: String,
    /// Session of the exchange.
    pub session_id: Option<SessionId>,
    /// Effective kind of synchronization.
    pub sync_type: SyncType,
    /// Scope id the server stamps into the rows it sends.
    pub server_scope_id: Option<ScopeId>,
    /// Rows applied from a server snapshot.
    pub snapshot_rows: u64,
    /// Rows uploaded.
    pub rows_uploaded: u64,
    /// Upload rows per table.
    pub upload_selected: Vec<TableChangesSelected>,
    /// Outcome of applying the upload on the server.
    pub upload_applied: ApplyStats,
    /// Rows downloaded.
    pub rows_downloaded: u64,
    /// Download rows per table.
    pub download_selected: Vec<TableChangesSelected>,
    /// Outcome of applying downloaded and snapshot rows locally.
    pub download_applied: ApplyStats,
    /// Server timestamp the download is consistent with.
    pub remote_timestamp: Option<u64>,
    /// Client timestamp taken before the upload was selected.
    pub local_timestamp: Option<u64>,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl SyncSummary {
    /// Conflicts detected on either side.
    pub fn total_conflicts(&self) -> u64 {
        self.upload_applied.total_conflicts() + self.download_applied.total_conflicts()
    }
}

/// State of one exchange.
struct Run {
    scope: ClientScopeInfo,
    context: SyncContext,
    summary: SyncSummary,
    last_step: Option<SyncStep>,
}

impl Run {
    fn message(&self) -> ContextMessage {
        ContextMessage {
            context: self.context.clone(),
        }
    }

    fn set_sync_type(&mut self, sync_type: SyncType) {
        self.context.sync_type = sync_type;
        self.summary.sync_type = sync_type;
    }
}

fn unexpected(step: SyncStep) -> SyncError {
    ProtocolError::UnexpectedResponse { step }.into()
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Synchronizes one scope of a local replica with a server.
pub struct SyncAgent<T: SyncTransport> {
    replica: Arc<Replica>,
    config: SyncConfig,
    transport: T,
    state: RwLock<AgentState>,
    stats: RwLock<AgentStats>,
    running: AtomicBool,
    cancelled: AtomicBool,
}

impl<T: SyncTransport> SyncAgent<T> {
    /// Creates an agent for `config.scope_name`.
    pub fn new(replica: Arc<Replica>, config: SyncConfig, transport: T) -> Self {
        Self {
            replica,
            config,
            transport,
            state: RwLock::new(AgentState::Idle),
            stats: RwLock::new(AgentStats::default()),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> AgentState {
        *self.state.read()
    }

    /// Gets the cumulative stats.
    pub fn stats(&self) -> AgentStats {
        self.stats.read().clone()
    }

    /// The agent's configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The local replica.
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The persisted client scope record, once a synchronization completed.
    pub fn scope_info(&self) -> Option<ClientScopeInfo> {
        self.replica.scopes().client(&self.config.scope_name)
    }

    /// Cancels the running synchronization before its next request.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Resets the cancelled flag.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: AgentState) {
        *self.state.write() = state;
    }

    /// Performs a normal synchronization.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Aborted`] with the last completed step and the
    /// counters gathered so far.
    pub fn synchronize(&self) -> SyncResult<SyncSummary> {
        self.synchronize_as(SyncType::Normal)
    }

    /// Performs a synchronization of the given kind.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if another synchronization is in flight and
    /// [`SyncError::Aborted`] if this one fails.
    pub fn synchronize_as(&self, sync_type: SyncType) -> SyncResult<SyncSummary> {
        self.exclusive(|| self.cycle(sync_type))
    }

    /// Performs a normal synchronization, restarting it after transient
    /// failures and lost sessions.
    ///
    /// # Errors
    ///
    /// Returns the last failure once the retry budget is spent or a
    /// non-retryable error occurs.
    pub fn sync_with_retry(&self) -> SyncResult<SyncSummary> {
        self.exclusive(|| {
            let retry = &self.config.retry;
            let mut attempt = 0;
            loop {
                match self.cycle(SyncType::Normal) {
                    Ok(summary) => return Ok(summary),
                    Err(e)
                        if (e.is_retryable() || e.requires_restart())
                            && attempt + 1 < retry.max_attempts =>
                    {
                        attempt += 1;
                        self.set_state(AgentState::RetryWait);
                        self.stats.write().retries += 1;
                        let delay = retry.delay_for_attempt(attempt);
                        tracing::warn!(
                            scope = %self.config.scope_name,
                            attempt,
                            delay_ms = millis(delay),
                            error = %e,
                            "restarting synchronization"
                        );
                        std::thread::sleep(delay);
                        self.check_cancelled()?;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }

    /// Asks the server how many rows it would send on the next
    /// synchronization, without creating a batch.
    ///
    /// # Errors
    ///
    /// Returns transport and server errors.
    pub fn estimate_pending_changes(&self) -> SyncResult<u64> {
        self.exclusive(|| {
            let mut run = self.begin(SyncType::Normal);
            self.ensure_scopes(&mut run)?;
            let request = SyncRequest::GetEstimatedChangesCount(EstimatedChangesRequest {
                context: run.context.clone(),
                last_server_sync_timestamp: run.scope.last_server_sync_timestamp,
            });
            let result = match self.send(&mut run, request) {
                Ok(SyncResponse::EstimatedChanges(response)) => Ok(response.count),
                Ok(_) => Err(unexpected(SyncStep::GetEstimatedChangesCount)),
                Err(e) => Err(e),
            };
            self.abandon(&mut run);
            result
        })
    }

    /// Fetches a fresh server logical timestamp.
    ///
    /// # Errors
    ///
    /// Returns transport and server errors.
    pub fn remote_timestamp(&self) -> SyncResult<u64> {
        self.exclusive(|| {
            let mut run = self.begin(SyncType::Normal);
            self.ensure_scopes(&mut run)?;
            let request = SyncRequest::GetRemoteClientTimestamp(run.message());
            let result = match self.send(&mut run, request) {
                Ok(SyncResponse::RemoteTimestamp(response)) => Ok(response.timestamp),
                Ok(_) => Err(unexpected(SyncStep::GetRemoteClientTimestamp)),
                Err(e) => Err(e),
            };
            self.abandon(&mut run);
            result
        })
    }

    /// Forgets this client's scope and drops tracking of its tables.
    ///
    /// Data rows stay. The next synchronization runs as a new client.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` while a synchronization is in flight.
    pub fn deprovision(&self) -> SyncResult<()> {
        self.exclusive(|| {
            let name = &self.config.scope_name;
            if let Some(info) = self.replica.scopes().remove_client(name) {
                if let Some(schema) = &info.schema {
                    self.replica.deprovision(schema);
                }
                tracing::info!(scope = %name, "deprovisioned client scope");
            }
            Ok(())
        })
    }

    fn exclusive<R>(&self, f: impl FnOnce() -> SyncResult<R>) -> SyncResult<R> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyRunning);
        }
        self.reset_cancel();
        let result = f();
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn begin(&self, sync_type: SyncType) -> Run {
        let name = &self.config.scope_name;
        let scope = self
            .replica
            .scopes()
            .client(name)
            .unwrap_or_else(|| ClientScopeInfo::new(self.replica.id(), name.clone()));
        let session_id = SessionId::new();
        let context =
            SyncContext::new(session_id, name.clone(), scope.id).with_sync_type(sync_type);
        Run {
            scope,
            context,
            summary: SyncSummary {
                scope_name: name.clone(),
                session_id: Some(session_id),
                sync_type,
                ..SyncSummary::default()
            },
            last_step: None,
        }
    }

    fn cycle(&self, sync_type: SyncType) -> SyncResult<SyncSummary> {
        let start = Instant::now();
        let mut run = self.begin(sync_type);
        tracing::info!(
            scope = %self.config.scope_name,
            session_id = %run.context.session_id,
            sync_type = ?sync_type,
            "synchronization started"
        );

        let result = self.exchange(&mut run, start);
        run.summary.duration = start.elapsed();
        match result {
            Ok(()) => {
                self.set_state(AgentState::Synced);
                {
                    let mut stats = self.stats.write();
                    stats.cycles_completed += 1;
                    stats.rows_uploaded += run.summary.rows_uploaded;
                    stats.rows_downloaded +=
                        run.summary.rows_downloaded + run.summary.snapshot_rows;
                    stats.conflicts += run.summary.total_conflicts();
                    stats.last_sync_time = Some(Instant::now());
                    stats.last_error = None;
                }
                tracing::info!(
                    scope = %self.config.scope_name,
                    session_id = %run.context.session_id,
                    uploaded = run.summary.rows_uploaded,
                    downloaded = run.summary.rows_downloaded,
                    snapshot_rows = run.summary.snapshot_rows,
                    conflicts = run.summary.total_conflicts(),
                    elapsed_ms = millis(run.summary.duration),
                    "synchronization completed"
                );
                Ok(run.summary)
            }
            Err(e) => {
                self.set_state(AgentState::Error);
                {
                    let mut stats = self.stats.write();
                    stats.cycles_failed += 1;
                    stats.last_error = Some(e.to_string());
                }
                tracing::warn!(
                    scope = %self.config.scope_name,
                    session_id = %run.context.session_id,
                    step = run.last_step.map_or("start", SyncStep::name),
                    error = %e,
                    "synchronization failed"
                );
                Err(SyncError::Aborted {
                    step: run.last_step,
                    summary: Box::new(run.summary),
                    source: Box::new(e),
                })
            }
        }
    }

    fn exchange(&self, run: &mut Run, start: Instant) -> SyncResult<()> {
        self.set_state(AgentState::EnsuringScope);
        let server = self.ensure_scopes(run)?;
        let server_id = server.server_scope_id;
        run.summary.server_scope_id = Some(server_id);
        if server.is_outdated {
            match self.config.on_outdated {
                OutdatedAction::Reinitialize => {
                    tracing::warn!(
                        scope = %self.config.scope_name,
                        last_cleanup = server.last_cleanup_timestamp,
                        "scope is outdated, reinitializing"
                    );
                    run.set_sync_type(SyncType::Reinitialize);
                }
                OutdatedAction::Fail => {
                    self.abandon(run);
                    return Err(SyncError::OutdatedScope {
                        scope: self.config.scope_name.clone(),
                    });
                }
            }
        }
        let schema = self.ensure_schema(run, &server.version)?;
        self.apply_operation(run)?;

        let bootstrap = run.scope.is_new() || run.context.sync_type == SyncType::Reinitialize;
        if self.config.use_snapshots && bootstrap {
            self.set_state(AgentState::ApplyingSnapshot);
            self.apply_snapshot(run, &schema, server_id)?;
        }

        let client_timestamp = self.replica.local_timestamp()?;
        run.summary.local_timestamp = Some(client_timestamp);

        self.set_state(AgentState::Uploading);
        let server_batch = self.upload(run, &schema, server_id, client_timestamp)?;
        let remote_timestamp = server_batch.remote_timestamp;
        run.summary.remote_timestamp = Some(remote_timestamp);

        self.set_state(AgentState::Downloading);
        self.download(run, &schema, &server_batch, server_id, client_timestamp)?;
        run.summary.upload_applied = server_batch.applied;

        self.set_state(AgentState::Ending);
        let request = SyncRequest::EndSession(EndSessionRequest {
            context: run.context.clone(),
            client_applied: run.summary.download_applied.clone(),
            remote_timestamp: Some(remote_timestamp),
            duration_ms: millis(start.elapsed()),
        });
        self.send(run, request)?;

        run.scope.last_server_sync_timestamp = Some(remote_timestamp);
        run.scope.last_sync_timestamp = Some(client_timestamp);
        run.scope.last_sync = Some(now_millis());
        run.scope.last_sync_duration_ms = millis(start.elapsed());
        self.replica.scopes().save_client(run.scope.clone());
        Ok(())
    }

    /// Sends one request, re-sending it after retryable failures.
    fn send(&self, run: &mut Run, request: SyncRequest) -> SyncResult<SyncResponse> {
        let step = request.step();
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            self.check_cancelled()?;
            match self.transport.send(&request) {
                Ok(response) => {
                    tracing::debug!(
                        session_id = %run.context.session_id,
                        step = %step,
                        attempt,
                        "step completed"
                    );
                    run.last_step = Some(step);
                    return Ok(response);
                }
                // An earlier attempt ended the session; only its response was lost.
                Err(e) if step == SyncStep::EndSession && attempt > 0 && e.requires_restart() => {
                    run.last_step = Some(step);
                    return Ok(SyncResponse::Ack(run.message()));
                }
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    self.stats.write().retries += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        session_id = %run.context.session_id,
                        step = %step,
                        attempt,
                        delay_ms = millis(delay),
                        error = %e,
                        "re-sending request"
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Ends the session without reporting progress. Failures are ignored.
    fn abandon(&self, run: &mut Run) {
        let request = SyncRequest::EndSession(EndSessionRequest {
            context: run.context.clone(),
            client_applied: ApplyStats::default(),
            remote_timestamp: run.scope.last_server_sync_timestamp,
            duration_ms: 0,
        });
        if let Err(e) = self.send(run, request) {
            tracing::debug!(
                session_id = %run.context.session_id,
                error = %e,
                "failed to end session"
            );
        }
    }

    fn ensure_scopes(&self, run: &mut Run) -> SyncResult<ScopeSummary> {
        let request = SyncRequest::EnsureScopes(EnsureScopesRequest {
            context: run.context.clone(),
            last_server_sync_timestamp: run.scope.last_server_sync_timestamp,
        });
        match self.send(run, request)? {
            SyncResponse::EnsureScopes(response) => Ok(response.scope),
            _ => Err(unexpected(SyncStep::EnsureScopes)),
        }
    }

    /// Returns the scope schema, fetching and provisioning it when the
    /// local copy is missing or differs from the server's version.
    fn ensure_schema(&self, run: &mut Run, version: &str) -> SyncResult<SyncSchema> {
        if let Some(schema) = &run.scope.schema {
            if schema.fingerprint()? == version {
                return Ok(schema.clone());
            }
            tracing::info!(scope = %self.config.scope_name, "server schema changed");
        }
        let request = SyncRequest::EnsureSchema(run.message());
        let SyncResponse::EnsureSchema(response) = self.send(run, request)? else {
            return Err(unexpected(SyncStep::EnsureSchema));
        };
        let server = response.scope;
        let filled = self.replica.provision(&server.schema)?;
        tracing::debug!(
            scope = %self.config.scope_name,
            tables = server.schema.tables.len(),
            filled,
            "provisioned scope"
        );
        run.scope.schema = Some(server.schema.clone());
        run.scope.setup = Some(server.setup);
        Ok(server.schema)
    }

    fn apply_operation(&self, run: &mut Run) -> SyncResult<()> {
        let request = SyncRequest::GetOperation(run.message());
        let SyncResponse::Operation(response) = self.send(run, request)? else {
            return Err(unexpected(SyncStep::GetOperation));
        };
        match response.operation {
            ServerOperation::Normal => {}
            ServerOperation::Reinitialize => run.set_sync_type(SyncType::Reinitialize),
            ServerOperation::ReinitializeWithUpload => {
                run.set_sync_type(SyncType::ReinitializeWithUpload)
            }
            ServerOperation::AbortSync => {
                self.abandon(run);
                return Err(SyncError::ServerAborted {
                    scope: self.config.scope_name.clone(),
                });
            }
        }
        if response.operation != ServerOperation::Normal {
            tracing::info!(
                scope = %self.config.scope_name,
                operation = ?response.operation,
                "applying server operation"
            );
        }
        Ok(())
    }

    fn fetch(&self, run: &mut Run, step: SyncStep, batch_index: u32) -> SyncResult<ChangesPart> {
        let request = GetChangesRequest {
            context: run.context.clone(),
            batch_index,
        };
        let request = if step == SyncStep::GetSnapshot {
            SyncRequest::GetSnapshot(request)
        } else {
            SyncRequest::GetMoreChanges(request)
        };
        match self.send(run, request)? {
            SyncResponse::Changes(part) => Ok(part),
            _ => Err(unexpected(step)),
        }
    }

    /// Downloads and applies the server snapshot, if there is one.
    ///
    /// The rest of the exchange then only carries changes made after the
    /// snapshot was taken.
    fn apply_snapshot(
        &self,
        run: &mut Run,
        schema: &SyncSchema,
        server_id: ScopeId,
    ) -> SyncResult<()> {
        let mut part = self.fetch(run, SyncStep::GetSnapshot, 0)?;
        if part.batch_count == 0 {
            tracing::debug!(scope = %self.config.scope_name, "no server snapshot");
            return Ok(());
        }
        let timestamp = part.remote_timestamp;
        let mut assembler = BatchAssembler::new(self.replica.new_batch(timestamp));
        loop {
            if part.remote_timestamp != timestamp {
                release(&mut assembler.into_batch());
                return Err(ProtocolError::SnapshotChanged {
                    expected: timestamp,
                    actual: part.remote_timestamp,
                }
                .into());
            }
            let rows = part.rows.len() as u64;
            if assembler.receive(part.to_part())? == ReceiveOutcome::Accepted {
                run.summary.snapshot_rows += rows;
            }
            if assembler.is_complete() {
                break;
            }
            part = self.fetch(run, SyncStep::GetSnapshot, assembler.expected_index())?;
        }

        let reinitialize = run.context.sync_type.reinitializes();
        if reinitialize {
            self.replica.reset_tables(schema)?;
        }
        let ctx = ApplyContext {
            sender: server_id,
            client_min_timestamp: 0,
            force_write: reinitialize,
            role: ApplyRole::Client,
            resolver: &self.config.conflict_policy,
        };
        let mut batch = assembler.into_batch();
        let applied = self.replica.apply_batch(schema, &batch, &ctx);
        release(&mut batch);
        run.summary.download_applied.merge(&applied?);

        tracing::info!(
            scope = %self.config.scope_name,
            rows = run.summary.snapshot_rows,
            timestamp,
            "applied server snapshot"
        );
        run.scope.last_server_sync_timestamp = Some(timestamp);
        run.context.sync_type = SyncType::Normal;
        Ok(())
    }

    fn upload(
        &self,
        run: &mut Run,
        schema: &SyncSchema,
        server_id: ScopeId,
        client_timestamp: u64,
    ) -> SyncResult<ServerBatchInfo> {
        let mut batch = if run.context.sync_type.uploads() {
            let since = run.scope.last_sync_timestamp.unwrap_or(0);
            let selection = self.replica.select_changes(schema, since, server_id)?;
            self.replica
                .build_batch(selection, self.config.max_rows_per_part, client_timestamp)?
        } else {
            self.replica.new_batch(client_timestamp)
        };
        tracing::debug!(
            session_id = %run.context.session_id,
            rows = batch.row_count(),
            parts = batch.part_count(),
            "uploading changes"
        );
        run.summary.upload_selected = batch.selected();
        let result = self.send_batch(run, &batch);
        release(&mut batch);
        result
    }

    fn send_batch(&self, run: &mut Run, batch: &BatchInfo) -> SyncResult<ServerBatchInfo> {
        let last_server = run.scope.last_server_sync_timestamp;
        let mut last_response = None;
        if batch.part_count() == 0 {
            let request = SendChangesRequest::empty(run.context.clone(), last_server);
            last_response = Some(self.send(run, SyncRequest::SendChangesInProgress(request))?);
        }
        for index in 0..batch.part_count() {
            let part = batch.part(index)?;
            let rows = part.rows.len() as u64;
            let request = SendChangesRequest::from_part(run.context.clone(), last_server, part);
            last_response = Some(self.send(run, SyncRequest::SendChangesInProgress(request))?);
            run.summary.rows_uploaded += rows;
        }
        match last_response {
            Some(SyncResponse::SendChanges(response)) => response
                .server_batch
                .ok_or_else(|| unexpected(SyncStep::SendChangesInProgress)),
            _ => Err(unexpected(SyncStep::SendChangesInProgress)),
        }
    }

    fn download(
        &self,
        run: &mut Run,
        schema: &SyncSchema,
        server_batch: &ServerBatchInfo,
        server_id: ScopeId,
        client_timestamp: u64,
    ) -> SyncResult<()> {
        let mut assembler =
            BatchAssembler::new(self.replica.new_batch(server_batch.remote_timestamp));
        for index in 0..server_batch.batch_count {
            let part = self.fetch(run, SyncStep::GetMoreChanges, index)?;
            let rows = part.rows.len() as u64;
            if assembler.receive(part.to_part())? == ReceiveOutcome::Accepted {
                run.summary.rows_downloaded += rows;
            }
        }
        if !assembler.batch().is_complete() {
            return Err(unexpected(SyncStep::GetMoreChanges));
        }
        run.summary.download_selected = assembler.batch().selected();

        let reinitialize = run.context.sync_type.reinitializes();
        if reinitialize {
            self.replica.reset_tables(schema)?;
        }
        let ctx = ApplyContext {
            sender: server_id,
            client_min_timestamp: client_timestamp,
            force_write: reinitialize,
            role: ApplyRole::Client,
            resolver: &self.config.conflict_policy,
        };
        let mut batch = assembler.into_batch();
        let applied = self.replica.apply_batch(schema, &batch, &ctx);
        release(&mut batch);
        let applied = applied?;
        tracing::debug!(
            session_id = %run.context.session_id,
            applied = applied.total_applied(),
            conflicts = applied.total_conflicts(),
            failed = applied.total_failed(),
            "applied download"
        );
        run.summary.download_applied.merge(&applied);

        let request = SyncRequest::SendEndDownloadChanges(run.message());
        self.send(run, request)?;
        Ok(())
    }
}

fn release(batch: &mut BatchInfo) {
    if let Err(e) = batch.clear() {
        tracing::warn!(batch_id = batch.id(), error = %e, "failed to clear batch");
    }
}

impl<T: SyncTransport> std::fmt::Debug for SyncAgent<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncAgent")
            .field("scope", &self.config.scope_name)
            .field("replica", &self.replica.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
