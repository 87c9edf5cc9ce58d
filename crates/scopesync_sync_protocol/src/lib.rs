//! # scopesync Sync Protocol
//!
//! Protocol types and codecs for scopesync.
//!
//! This crate provides:
//! - `SyncStep`, the enumerated step carried by every request
//! - `RequestHeaders`, the metadata every request must carry
//! - `SyncContext` and typed per-step payloads
//! - CBOR and JSON serializers, SHA-256 payload hashing
//! - The error code taxonomy shared by client and server
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod context;
mod error;
mod headers;
mod messages;
mod step;

pub use codec::{payload_hash, verify_hash, Serializer};
pub use context::{SyncContext, SyncCounters, SyncType};
pub use error::{ErrorCode, ProtocolError, ProtocolResult};
pub use headers::{
    RequestHeaders, SessionId, COMPRESSION_HEADER, HASH_HEADER, SCOPE_NAME_HEADER,
    SERIALIZER_HEADER, SESSION_ID_HEADER, STEP_HEADER,
};
pub use messages::{
    ChangesPart, ChangesProgress, ContextMessage, EndSessionRequest, EnsureSchemaResponse,
    EnsureScopesRequest, EnsureScopesResponse, ErrorResponse, EstimatedChangesRequest,
    EstimatedChangesResponse, GetChangesRequest, GetOperationResponse, RemoteTimestampResponse,
    ScopeSummary, SendChangesRequest, SendChangesResponse, ServerBatchInfo, ServerOperation,
    SummaryResponse, SyncRequest, SyncResponse,
};
pub use step::SyncStep;
