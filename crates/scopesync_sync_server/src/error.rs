//! Error types for the sync server.

use crate::session::SessionState;
use scopesync_core::CoreError;
use scopesync_sync_protocol::{ErrorCode, ErrorResponse, ProtocolError, SessionId, SyncStep};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Message sent for internal failures when verbose errors are off.
pub const GENERIC_INTERNAL_MESSAGE: &str = "internal server error";

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed metadata, hash mismatch or undecodable payload.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The request carries no payload hash but the server requires one.
    #[error("payload hash required")]
    HashRequired,

    /// The scope is not registered.
    #[error("unknown scope: {0}")]
    UnknownScope(String),

    /// Session id, scope name or client id does not match.
    #[error("session mismatch: {0}")]
    SessionMismatch(String),

    /// The step is not valid in the session's state.
    #[error("step {step} not allowed in state {state}")]
    StepOutOfSequence {
        /// Requested step.
        step: SyncStep,
        /// Current state.
        state: SessionState,
    },

    /// No session exists for a step that needs one.
    #[error("session lost: {0}")]
    SessionLost(SessionId),

    /// Replica failure.
    #[error("replica error: {0}")]
    Core(#[from] CoreError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Stable wire code.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::Protocol(e) => e.code(),
            ServerError::HashRequired => ErrorCode::MissingMetadata,
            ServerError::UnknownScope(_) => ErrorCode::UnknownScope,
            ServerError::SessionMismatch(_) => ErrorCode::SessionMismatch,
            ServerError::StepOutOfSequence { .. } => ErrorCode::StepOutOfSequence,
            ServerError::SessionLost(_) => ErrorCode::SessionLost,
            ServerError::Core(e) => match e {
                CoreError::SchemaMissing { .. } => ErrorCode::SchemaMissing,
                CoreError::SchemaMismatch { .. } | CoreError::InvalidSchema { .. } => {
                    ErrorCode::SchemaMismatch
                }
                CoreError::OutOfOrderBatchPart { .. } | CoreError::BatchAlreadyComplete { .. } => {
                    ErrorCode::OutOfOrderBatchPart
                }
                CoreError::BatchPartNotFound { .. } | CoreError::InvalidRow { .. } => {
                    ErrorCode::InvalidPayload
                }
                _ => ErrorCode::Internal,
            },
            ServerError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// HTTP-equivalent status.
    pub fn status_code(&self) -> u16 {
        self.code().http_status()
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }

    /// Renders the error for the wire.
    ///
    /// Server errors get a generic message unless `verbose`, which appends
    /// every cause in the source chain.
    pub fn to_response(&self, verbose: bool) -> ErrorResponse {
        let message = if verbose {
            let mut message = self.to_string();
            let mut source = std::error::Error::source(self);
            while let Some(cause) = source {
                message.push_str(": ");
                message.push_str(&cause.to_string());
                source = cause.source();
            }
            message
        } else if self.is_server_error() {
            GENERIC_INTERNAL_MESSAGE.to_string()
        } else {
            self.to_string()
        };
        ErrorResponse {
            code: self.code(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopesync_storage::StorageError;

    #[test]
    fn error_classification() {
        assert!(ServerError::UnknownScope("x".into()).is_client_error());
        assert!(ServerError::SessionLost(SessionId::new()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::HashRequired.is_server_error());
    }

    #[test]
    fn core_errors_map_to_codes() {
        let err = ServerError::from(CoreError::OutOfOrderBatchPart {
            expected: 1,
            actual: 3,
        });
        assert_eq!(err.code(), ErrorCode::OutOfOrderBatchPart);
        assert!(err.is_client_error());

        let err = ServerError::from(CoreError::schema_missing("t"));
        assert_eq!(err.code(), ErrorCode::SchemaMissing);
    }

    #[test]
    fn internal_details_hidden_unless_verbose() {
        let err = ServerError::from(CoreError::Storage(StorageError::Corrupted(
            "disk on fire".into(),
        )));
        assert!(err.is_server_error());
        assert_eq!(err.to_response(false).message, GENERIC_INTERNAL_MESSAGE);
        assert!(err.to_response(true).message.contains("disk on fire"));
    }

    #[test]
    fn client_errors_keep_their_message() {
        let err = ServerError::UnknownScope("inventory".into());
        assert!(err.to_response(false).message.contains("inventory"));
    }
}
