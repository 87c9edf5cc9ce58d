//! Per-exchange session state.

use crate::error::{ServerError, ServerResult};
use crate::snapshot::Snapshot;
use scopesync_core::{BatchAssembler, BatchInfo, ScopeId};
use scopesync_sync_protocol::{
    SendChangesResponse, ServerOperation, SessionId, SyncContext, SyncCounters, SyncStep,
    SyncType,
};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Where a session is in the exchange.
///
/// ```text
/// Idle -> EnsuringScope -> ReceivingClientChanges -> ApplyingAndSelecting
///      -> SendingServerChanges -> Ended
/// ```
///
/// `ApplyingAndSelecting` only exists while the last uploaded part is being
/// handled; a stored session is never in that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, no step handled yet.
    Idle,
    /// Scope metadata negotiated; no part uploaded.
    EnsuringScope,
    /// Client parts are arriving.
    ReceivingClientChanges,
    /// Applying the upload and selecting the download.
    ApplyingAndSelecting,
    /// Server parts are being served.
    SendingServerChanges,
    /// Closed.
    Ended,
}

impl SessionState {
    /// State name as written in logs and summaries.
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::EnsuringScope => "EnsuringScope",
            SessionState::ReceivingClientChanges => "ReceivingClientChanges",
            SessionState::ApplyingAndSelecting => "ApplyingAndSelecting",
            SessionState::SendingServerChanges => "SendingServerChanges",
            SessionState::Ended => "Ended",
        }
    }

    /// Returns true if `step` may be handled in this state.
    pub fn allows(&self, step: SyncStep) -> bool {
        use SessionState::*;
        use SyncStep::*;
        match step {
            EnsureScopes => matches!(self, Idle | EnsuringScope),
            EnsureSchema | GetOperation | GetSnapshot => matches!(self, EnsuringScope),
            SendChangesInProgress => matches!(
                self,
                EnsuringScope | ReceivingClientChanges | SendingServerChanges
            ),
            GetMoreChanges | GetChangesInProgress | SendEndDownloadChanges => {
                matches!(self, SendingServerChanges)
            }
            GetSummary | GetEstimatedChangesCount | GetRemoteClientTimestamp | EndSession => {
                !matches!(self, Idle | Ended | ApplyingAndSelecting)
            }
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Server-side state of one synchronization exchange.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session id.
    pub id: SessionId,
    /// Scope being synchronized.
    pub scope_name: String,
    /// The client's scope id.
    pub client_id: ScopeId,
    /// Current state.
    pub state: SessionState,
    /// Kind of synchronization.
    pub sync_type: SyncType,
    /// Upload being reassembled.
    pub inbound: Option<BatchAssembler>,
    /// Download being served.
    pub outbound: Option<BatchInfo>,
    /// Snapshot pinned by the first `GetSnapshot` of the session.
    pub snapshot: Option<Arc<Snapshot>>,
    /// Server timestamp captured when applying the upload began.
    pub remote_timestamp: Option<u64>,
    /// Running counters.
    pub counters: SyncCounters,
    /// Highest outbound index served.
    pub last_served_index: Option<u32>,
    /// Response to the last uploaded part, replayed on retransmit.
    pub upload_response: Option<SendChangesResponse>,
    /// Operation handed to the client in this session.
    pub delivered_operation: Option<ServerOperation>,
    /// When the session was created.
    pub started_at: Instant,
}

impl Session {
    /// Creates an idle session.
    pub fn new(id: SessionId, scope_name: impl Into<String>, client_id: ScopeId) -> Self {
        Self {
            id,
            scope_name: scope_name.into(),
            client_id,
            state: SessionState::Idle,
            sync_type: SyncType::Normal,
            inbound: None,
            outbound: None,
            snapshot: None,
            remote_timestamp: None,
            counters: SyncCounters::default(),
            last_served_index: None,
            upload_response: None,
            delivered_operation: None,
            started_at: Instant::now(),
        }
    }

    /// Checks that `step` is allowed now.
    ///
    /// # Errors
    ///
    /// Returns `StepOutOfSequence` otherwise.
    pub fn check_step(&self, step: SyncStep) -> ServerResult<()> {
        if self.state.allows(step) {
            Ok(())
        } else {
            Err(ServerError::StepOutOfSequence {
                step,
                state: self.state,
            })
        }
    }

    /// Context echoed back in responses.
    pub fn context(&self) -> SyncContext {
        SyncContext {
            session_id: self.id,
            scope_name: self.scope_name.clone(),
            client_id: self.client_id,
            sync_type: self.sync_type,
            counters: self.counters,
        }
    }

    /// Moves to `next`, logging the transition.
    pub fn transition(&mut self, next: SessionState) {
        if self.state != next {
            tracing::debug!(
                session_id = %self.id,
                scope = %self.scope_name,
                from = %self.state,
                to = %next,
                "session transition"
            );
            self.state = next;
        }
    }

    /// Drops staged inbound and outbound artifacts and lets go of the
    /// pinned snapshot.
    pub fn release_batches(&mut self) {
        self.snapshot = None;
        if let Some(assembler) = self.inbound.take() {
            let mut batch = assembler.into_batch();
            if let Err(e) = batch.clear() {
                tracing::warn!(session_id = %self.id, error = %e, "failed to clear inbound batch");
            }
        }
        if let Some(mut batch) = self.outbound.take() {
            if let Err(e) = batch.clear() {
                tracing::warn!(session_id = %self.id, error = %e, "failed to clear outbound batch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_steps_are_allowed_in_order() {
        let path = [
            (SessionState::Idle, SyncStep::EnsureScopes),
            (SessionState::EnsuringScope, SyncStep::EnsureSchema),
            (SessionState::EnsuringScope, SyncStep::GetOperation),
            (SessionState::EnsuringScope, SyncStep::SendChangesInProgress),
            (
                SessionState::ReceivingClientChanges,
                SyncStep::SendChangesInProgress,
            ),
            (SessionState::SendingServerChanges, SyncStep::GetMoreChanges),
            (
                SessionState::SendingServerChanges,
                SyncStep::SendEndDownloadChanges,
            ),
            (SessionState::SendingServerChanges, SyncStep::EndSession),
        ];
        for (state, step) in path {
            assert!(state.allows(step), "{state} should allow {step}");
        }
    }

    #[test]
    fn out_of_sequence_steps_are_rejected() {
        assert!(!SessionState::Idle.allows(SyncStep::GetMoreChanges));
        assert!(!SessionState::EnsuringScope.allows(SyncStep::GetMoreChanges));
        assert!(!SessionState::ReceivingClientChanges.allows(SyncStep::EnsureSchema));
        assert!(!SessionState::SendingServerChanges.allows(SyncStep::EnsureScopes));
        assert!(!SessionState::Ended.allows(SyncStep::EndSession));

        let session = Session::new(SessionId::new(), "s", ScopeId::new());
        let err = session.check_step(SyncStep::GetMoreChanges).unwrap_err();
        assert!(matches!(err, ServerError::StepOutOfSequence { .. }));
    }
}
