//! Protocol error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Stable error codes carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// A required request header is missing or malformed.
    MissingMetadata,
    /// The scope name is not known to the server.
    UnknownScope,
    /// The session id or scope name does not match the session.
    SessionMismatch,
    /// The step is not allowed in the session's current state.
    StepOutOfSequence,
    /// The payload hash does not match.
    ChecksumMismatch,
    /// The payload could not be decoded.
    InvalidPayload,
    /// A batch part arrived out of order.
    OutOfOrderBatchPart,
    /// The session was not found.
    SessionLost,
    /// A table or its tracking infrastructure is missing.
    SchemaMissing,
    /// Replicas disagree on a table definition.
    SchemaMismatch,
    /// Unexpected server failure.
    Internal,
}

impl ErrorCode {
    /// HTTP-equivalent status for responses carrying this code.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::Internal => 500,
            ErrorCode::SessionLost => 410,
            ErrorCode::UnknownScope => 404,
            ErrorCode::SchemaMissing | ErrorCode::SchemaMismatch => 409,
            _ => 400,
        }
    }

    /// Returns true for codes caused by the request rather than the server.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.http_status())
    }
}

/// Errors raised while building, encoding or validating protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A required header is absent.
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// A header value is malformed.
    #[error("invalid header {name}: {value}")]
    InvalidHeader {
        /// Header name.
        name: &'static str,
        /// Offending value.
        value: String,
    },

    /// The serializer identifier is not supported.
    #[error("unknown serializer: {0}")]
    UnknownSerializer(String),

    /// The payload hash does not match the body.
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        /// Hash from the headers.
        expected: String,
        /// Hash of the received body.
        actual: String,
    },

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A response did not match the request's step.
    #[error("unexpected response for step {step}")]
    UnexpectedResponse {
        /// Step that was requested.
        step: crate::step::SyncStep,
    },

    /// Snapshot parts were taken at different timestamps.
    #[error("snapshot changed while downloading: started at {expected}, part from {actual}")]
    SnapshotChanged {
        /// Timestamp of the first part.
        expected: u64,
        /// Timestamp of the offending part.
        actual: u64,
    },
}

impl ProtocolError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Maps to the wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::MissingHeader(_)
            | ProtocolError::InvalidHeader { .. }
            | ProtocolError::UnknownSerializer(_) => ErrorCode::MissingMetadata,
            ProtocolError::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            ProtocolError::Codec(_)
            | ProtocolError::UnexpectedResponse { .. }
            | ProtocolError::SnapshotChanged { .. } => ErrorCode::InvalidPayload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert!(ErrorCode::StepOutOfSequence.is_client_error());
        assert!(ErrorCode::SessionLost.is_client_error());
        assert!(!ErrorCode::Internal.is_client_error());
        assert_eq!(ErrorCode::Internal.http_status(), 500);
    }

    #[test]
    fn protocol_error_codes() {
        assert_eq!(
            ProtocolError::MissingHeader("ss-step").code(),
            ErrorCode::MissingMetadata
        );
        assert_eq!(
            ProtocolError::ChecksumMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .code(),
            ErrorCode::ChecksumMismatch
        );
        assert_eq!(
            ProtocolError::SnapshotChanged {
                expected: 4,
                actual: 6
            }
            .code(),
            ErrorCode::InvalidPayload
        );
    }
}
