//! Typed payloads for every step.
//!
//! A request body is the encoding of the step's own payload type; the step
//! itself travels in the headers, so [`SyncRequest::decode`] picks the
//! payload type from the step. A response body is an encoded
//! [`SyncResponse`], whose variant names the payload.

use crate::codec::Serializer;
use crate::context::SyncContext;
use crate::error::{ErrorCode, ProtocolError, ProtocolResult};
use crate::step::SyncStep;
use scopesync_core::{ApplyStats, BatchPart, ScopeId, ServerScopeInfo, SyncRow};
use serde::{Deserialize, Serialize};

/// Operation the server asks a client to perform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerOperation {
    /// Proceed with a normal sync.
    #[default]
    Normal,
    /// Reinitialize without uploading.
    Reinitialize,
    /// Upload, then reinitialize.
    ReinitializeWithUpload,
    /// Stop the synchronization.
    AbortSync,
}

/// A payload carrying only the context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    /// Sync context.
    pub context: SyncContext,
}

/// Server scope summary returned by `EnsureScopes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSummary {
    /// The server replica's scope id; rows downloaded are stamped with it.
    pub server_scope_id: ScopeId,
    /// Schema fingerprint.
    pub version: String,
    /// Tombstones at or below this server timestamp are purged.
    pub last_cleanup_timestamp: u64,
    /// Set when the client missed purged tombstones and must reinitialize.
    pub is_outdated: bool,
}

/// `EnsureScopes` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureScopesRequest {
    /// Sync context.
    pub context: SyncContext,
    /// Server timestamp the client last downloaded up to.
    pub last_server_sync_timestamp: Option<u64>,
}

/// `EnsureScopes` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureScopesResponse {
    /// Sync context.
    pub context: SyncContext,
    /// Scope summary.
    pub scope: ScopeSummary,
}

/// `EnsureSchema` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureSchemaResponse {
    /// Sync context.
    pub context: SyncContext,
    /// Full server scope, schema included.
    pub scope: ServerScopeInfo,
}

/// `GetOperation` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOperationResponse {
    /// Sync context.
    pub context: SyncContext,
    /// Requested operation.
    pub operation: ServerOperation,
}

/// `SendChangesInProgress` request: one client batch part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendChangesRequest {
    /// Sync context.
    pub context: SyncContext,
    /// Server timestamp the client last downloaded up to; the server's
    /// conflict rule compares local rows against it.
    pub last_server_sync_timestamp: Option<u64>,
    /// Part index.
    pub batch_index: u32,
    /// Set on the final part.
    pub is_last_batch: bool,
    /// Table of the rows; empty for an empty upload.
    pub table: String,
    /// Rows.
    pub rows: Vec<SyncRow>,
}

impl SendChangesRequest {
    /// Wraps a batch part.
    pub fn from_part(
        context: SyncContext,
        last_server_sync_timestamp: Option<u64>,
        part: BatchPart,
    ) -> Self {
        Self {
            context,
            last_server_sync_timestamp,
            batch_index: part.index,
            is_last_batch: part.is_last,
            table: part.table,
            rows: part.rows,
        }
    }

    /// The terminal part of an empty upload.
    pub fn empty(context: SyncContext, last_server_sync_timestamp: Option<u64>) -> Self {
        Self {
            context,
            last_server_sync_timestamp,
            batch_index: 0,
            is_last_batch: true,
            table: String::new(),
            rows: Vec::new(),
        }
    }

    /// Unwraps into a batch part.
    pub fn to_part(&self) -> BatchPart {
        BatchPart {
            index: self.batch_index,
            table: self.table.clone(),
            rows: self.rows.clone(),
            is_last: self.is_last_batch,
        }
    }
}

/// What the server prepared for download after applying an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerBatchInfo {
    /// Server timestamp captured before selection.
    pub remote_timestamp: u64,
    /// Number of parts to download.
    pub batch_count: u32,
    /// Number of rows to download.
    pub row_count: u64,
    /// How the upload was applied.
    pub applied: ApplyStats,
}

/// `SendChangesInProgress` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendChangesResponse {
    /// Sync context.
    pub context: SyncContext,
    /// Index acknowledged.
    pub batch_index: u32,
    /// Present once the last part was received.
    pub server_batch: Option<ServerBatchInfo>,
}

/// `GetMoreChanges` and `GetSnapshot` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetChangesRequest {
    /// Sync context.
    pub context: SyncContext,
    /// Part requested.
    pub batch_index: u32,
}

/// One downloaded part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesPart {
    /// Sync context.
    pub context: SyncContext,
    /// Part index.
    pub batch_index: u32,
    /// Total parts.
    pub batch_count: u32,
    /// Set on the final part.
    pub is_last_batch: bool,
    /// Table of the rows.
    pub table: String,
    /// Rows.
    pub rows: Vec<SyncRow>,
    /// Server timestamp the batch was selected at.
    pub remote_timestamp: u64,
}

impl ChangesPart {
    /// Unwraps into a batch part.
    pub fn to_part(&self) -> BatchPart {
        BatchPart {
            index: self.batch_index,
            table: self.table.clone(),
            rows: self.rows.clone(),
            is_last: self.is_last_batch,
        }
    }
}

/// `GetChangesInProgress` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesProgress {
    /// Sync context.
    pub context: SyncContext,
    /// Parts in the outbound batch.
    pub batch_count: u32,
    /// Next index the client should request.
    pub next_index: u32,
    /// Server timestamp of the outbound batch, once selected.
    pub remote_timestamp: Option<u64>,
}

/// `GetSummary` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryResponse {
    /// Sync context with the server's counters.
    pub context: SyncContext,
    /// Session state name.
    pub state: String,
}

/// `GetEstimatedChangesCount` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimatedChangesRequest {
    /// Sync context.
    pub context: SyncContext,
    /// Count changes after this server timestamp.
    pub last_server_sync_timestamp: Option<u64>,
}

/// `GetEstimatedChangesCount` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimatedChangesResponse {
    /// Sync context.
    pub context: SyncContext,
    /// Pending server changes.
    pub count: u64,
}

/// `GetRemoteClientTimestamp` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTimestampResponse {
    /// Sync context.
    pub context: SyncContext,
    /// Fresh server timestamp.
    pub timestamp: u64,
}

/// `EndSession` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndSessionRequest {
    /// Sync context with client counters.
    pub context: SyncContext,
    /// How the download was applied on the client.
    pub client_applied: ApplyStats,
    /// Server timestamp the client now records as downloaded.
    pub remote_timestamp: Option<u64>,
    /// Client-measured duration in millis.
    pub duration_ms: u64,
}

/// Failure response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncRequest {
    /// `EnsureSchema`.
    EnsureSchema(ContextMessage),
    /// `EnsureScopes`.
    EnsureScopes(EnsureScopesRequest),
    /// `SendChangesInProgress`.
    SendChangesInProgress(SendChangesRequest),
    /// `GetMoreChanges`.
    GetMoreChanges(GetChangesRequest),
    /// `GetChangesInProgress`.
    GetChangesInProgress(ContextMessage),
    /// `GetSnapshot`.
    GetSnapshot(GetChangesRequest),
    /// `GetSummary`.
    GetSummary(ContextMessage),
    /// `SendEndDownloadChanges`.
    SendEndDownloadChanges(ContextMessage),
    /// `GetEstimatedChangesCount`.
    GetEstimatedChangesCount(EstimatedChangesRequest),
    /// `GetRemoteClientTimestamp`.
    GetRemoteClientTimestamp(ContextMessage),
    /// `GetOperation`.
    GetOperation(ContextMessage),
    /// `EndSession`.
    EndSession(EndSessionRequest),
}

impl SyncRequest {
    /// The step this request performs.
    pub fn step(&self) -> SyncStep {
        match self {
            SyncRequest::EnsureSchema(_) => SyncStep::EnsureSchema,
            SyncRequest::EnsureScopes(_) => SyncStep::EnsureScopes,
            SyncRequest::SendChangesInProgress(_) => SyncStep::SendChangesInProgress,
            SyncRequest::GetMoreChanges(_) => SyncStep::GetMoreChanges,
            SyncRequest::GetChangesInProgress(_) => SyncStep::GetChangesInProgress,
            SyncRequest::GetSnapshot(_) => SyncStep::GetSnapshot,
            SyncRequest::GetSummary(_) => SyncStep::GetSummary,
            SyncRequest::SendEndDownloadChanges(_) => SyncStep::SendEndDownloadChanges,
            SyncRequest::GetEstimatedChangesCount(_) => SyncStep::GetEstimatedChangesCount,
            SyncRequest::GetRemoteClientTimestamp(_) => SyncStep::GetRemoteClientTimestamp,
            SyncRequest::GetOperation(_) => SyncStep::GetOperation,
            SyncRequest::EndSession(_) => SyncStep::EndSession,
        }
    }

    /// The context carried by the payload.
    pub fn context(&self) -> &SyncContext {
        match self {
            SyncRequest::EnsureSchema(m)
            | SyncRequest::GetChangesInProgress(m)
            | SyncRequest::GetSummary(m)
            | SyncRequest::SendEndDownloadChanges(m)
            | SyncRequest::GetRemoteClientTimestamp(m)
            | SyncRequest::GetOperation(m) => &m.context,
            SyncRequest::EnsureScopes(r) => &r.context,
            SyncRequest::SendChangesInProgress(r) => &r.context,
            SyncRequest::GetMoreChanges(r) | SyncRequest::GetSnapshot(r) => &r.context,
            SyncRequest::GetEstimatedChangesCount(r) => &r.context,
            SyncRequest::EndSession(r) => &r.context,
        }
    }

    /// Encodes the payload, without the step.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if serialization fails.
    pub fn encode(&self, serializer: Serializer) -> ProtocolResult<Vec<u8>> {
        match self {
            SyncRequest::EnsureSchema(m)
            | SyncRequest::GetChangesInProgress(m)
            | SyncRequest::GetSummary(m)
            | SyncRequest::SendEndDownloadChanges(m)
            | SyncRequest::GetRemoteClientTimestamp(m)
            | SyncRequest::GetOperation(m) => serializer.encode(m),
            SyncRequest::EnsureScopes(r) => serializer.encode(r),
            SyncRequest::SendChangesInProgress(r) => serializer.encode(r),
            SyncRequest::GetMoreChanges(r) | SyncRequest::GetSnapshot(r) => serializer.encode(r),
            SyncRequest::GetEstimatedChangesCount(r) => serializer.encode(r),
            SyncRequest::EndSession(r) => serializer.encode(r),
        }
    }

    /// Decodes the payload of `step`.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if the body is not the step's payload type.
    pub fn decode(step: SyncStep, serializer: Serializer, body: &[u8]) -> ProtocolResult<Self> {
        Ok(match step {
            SyncStep::EnsureSchema => SyncRequest::EnsureSchema(serializer.decode(body)?),
            SyncStep::EnsureScopes => SyncRequest::EnsureScopes(serializer.decode(body)?),
            SyncStep::SendChangesInProgress => {
                SyncRequest::SendChangesInProgress(serializer.decode(body)?)
            }
            SyncStep::GetMoreChanges => SyncRequest::GetMoreChanges(serializer.decode(body)?),
            SyncStep::GetChangesInProgress => {
                SyncRequest::GetChangesInProgress(serializer.decode(body)?)
            }
            SyncStep::GetSnapshot => SyncRequest::GetSnapshot(serializer.decode(body)?),
            SyncStep::GetSummary => SyncRequest::GetSummary(serializer.decode(body)?),
            SyncStep::SendEndDownloadChanges => {
                SyncRequest::SendEndDownloadChanges(serializer.decode(body)?)
            }
            SyncStep::GetEstimatedChangesCount => {
                SyncRequest::GetEstimatedChangesCount(serializer.decode(body)?)
            }
            SyncStep::GetRemoteClientTimestamp => {
                SyncRequest::GetRemoteClientTimestamp(serializer.decode(body)?)
            }
            SyncStep::GetOperation => SyncRequest::GetOperation(serializer.decode(body)?),
            SyncStep::EndSession => SyncRequest::EndSession(serializer.decode(body)?),
        })
    }
}

/// A response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncResponse {
    /// `EnsureSchema`.
    EnsureSchema(EnsureSchemaResponse),
    /// `EnsureScopes`.
    EnsureScopes(EnsureScopesResponse),
    /// `SendChangesInProgress`.
    SendChanges(SendChangesResponse),
    /// `GetMoreChanges` and `GetSnapshot`.
    Changes(ChangesPart),
    /// `GetChangesInProgress`.
    Progress(ChangesProgress),
    /// `GetSummary`.
    Summary(SummaryResponse),
    /// `GetEstimatedChangesCount`.
    EstimatedChanges(EstimatedChangesResponse),
    /// `GetRemoteClientTimestamp`.
    RemoteTimestamp(RemoteTimestampResponse),
    /// `GetOperation`.
    Operation(GetOperationResponse),
    /// `SendEndDownloadChanges` and `EndSession`.
    Ack(ContextMessage),
    /// Any failure.
    Error(ErrorResponse),
}

impl SyncResponse {
    /// Creates an error response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        SyncResponse::Error(ErrorResponse {
            code,
            message: message.into(),
        })
    }

    /// Returns true if this response answers `step`.
    pub fn answers(&self, step: SyncStep) -> bool {
        matches!(
            (self, step),
            (SyncResponse::EnsureSchema(_), SyncStep::EnsureSchema)
                | (SyncResponse::EnsureScopes(_), SyncStep::EnsureScopes)
                | (SyncResponse::SendChanges(_), SyncStep::SendChangesInProgress)
                | (
                    SyncResponse::Changes(_),
                    SyncStep::GetMoreChanges | SyncStep::GetSnapshot
                )
                | (SyncResponse::Progress(_), SyncStep::GetChangesInProgress)
                | (SyncResponse::Summary(_), SyncStep::GetSummary)
                | (
                    SyncResponse::EstimatedChanges(_),
                    SyncStep::GetEstimatedChangesCount
                )
                | (
                    SyncResponse::RemoteTimestamp(_),
                    SyncStep::GetRemoteClientTimestamp
                )
                | (SyncResponse::Operation(_), SyncStep::GetOperation)
                | (
                    SyncResponse::Ack(_),
                    SyncStep::SendEndDownloadChanges | SyncStep::EndSession
                )
        )
    }

    /// Checks that a success response answers `step`.
    ///
    /// Error responses pass through unchanged.
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedResponse` on a mismatch.
    pub fn expect_step(self, step: SyncStep) -> ProtocolResult<Self> {
        if matches!(self, SyncResponse::Error(_)) || self.answers(step) {
            Ok(self)
        } else {
            Err(ProtocolError::UnexpectedResponse { step })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::SessionId;
    use scopesync_core::{RowState, Value};

    fn context() -> SyncContext {
        SyncContext::new(SessionId::new(), "default", ScopeId::new())
    }

    #[test]
    fn decode_uses_step_payload_type() {
        let request = SyncRequest::GetMoreChanges(GetChangesRequest {
            context: context(),
            batch_index: 3,
        });
        for serializer in [Serializer::Cbor, Serializer::Json] {
            let body = request.encode(serializer).unwrap();
            let decoded = SyncRequest::decode(SyncStep::GetMoreChanges, serializer, &body).unwrap();
            assert_eq!(decoded, request);
            assert_eq!(decoded.step(), SyncStep::GetMoreChanges);
        }
    }

    #[test]
    fn mismatched_step_fails_to_decode() {
        let request = SyncRequest::GetMoreChanges(GetChangesRequest {
            context: context(),
            batch_index: 3,
        });
        let body = request.encode(Serializer::Json).unwrap();
        assert!(SyncRequest::decode(SyncStep::EndSession, Serializer::Json, &body).is_err());
    }

    #[test]
    fn send_changes_part_conversion() {
        let part = BatchPart {
            index: 2,
            table: "t".into(),
            rows: vec![SyncRow {
                values: vec![Value::Integer(1)],
                state: RowState::Modified,
                timestamp: 9,
                update_scope_id: None,
            }],
            is_last: true,
        };
        let request = SendChangesRequest::from_part(context(), Some(4), part.clone());
        assert_eq!(request.to_part(), part);
        let empty = SendChangesRequest::empty(context(), None);
        assert!(empty.is_last_batch && empty.rows.is_empty());
    }

    #[test]
    fn response_step_matching() {
        let ack = SyncResponse::Ack(ContextMessage { context: context() });
        assert!(ack.answers(SyncStep::EndSession));
        assert!(!ack.answers(SyncStep::GetMoreChanges));
        assert!(ack.clone().expect_step(SyncStep::GetOperation).is_err());
        let error = SyncResponse::error(ErrorCode::SessionLost, "gone");
        assert!(error.expect_step(SyncStep::GetOperation).is_ok());
    }
}
