//! Error types for the sync engine.

use crate::agent::SyncSummary;
use scopesync_core::CoreError;
use scopesync_sync_protocol::{ErrorCode, ErrorResponse, ProtocolError, SyncStep};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the request can be re-sent.
        retryable: bool,
    },

    /// Malformed, mismatched or undecodable message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The server rejected the request.
    #[error("server error {code:?}: {message}")]
    Remote {
        /// Error code.
        code: ErrorCode,
        /// Server message.
        message: String,
    },

    /// The server no longer knows the session; restart from the beginning.
    #[error("session lost: {0}")]
    SessionLost(String),

    /// The server purged metadata this client has not downloaded yet.
    #[error("scope {scope} is outdated and must be reinitialized")]
    OutdatedScope {
        /// Scope name.
        scope: String,
    },

    /// The server asked the client to stop.
    #[error("server aborted synchronization of scope {scope}")]
    ServerAborted {
        /// Scope name.
        scope: String,
    },

    /// Local replica failure.
    #[error("replica error: {0}")]
    Core(#[from] CoreError),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Transport is closed.
    #[error("not connected to server")]
    NotConnected,

    /// Another synchronization is running on this agent.
    #[error("a synchronization is already running")]
    AlreadyRunning,

    /// A synchronization failed part way through.
    #[error("synchronization aborted after {}: {source}", step_name(.step))]
    Aborted {
        /// Last step that completed.
        step: Option<SyncStep>,
        /// Counters gathered before the failure.
        summary: Box<SyncSummary>,
        /// Underlying failure.
        source: Box<SyncError>,
    },
}

fn step_name(step: &Option<SyncStep>) -> &'static str {
    step.map_or("start", SyncStep::name)
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Converts an error response.
    pub fn from_remote(response: ErrorResponse) -> Self {
        match response.code {
            ErrorCode::SessionLost => SyncError::SessionLost(response.message),
            code => SyncError::Remote {
                code,
                message: response.message,
            },
        }
    }

    /// The innermost error, looking through `Aborted`.
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::Aborted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns true if re-sending the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Remote { code, .. } => *code == ErrorCode::Internal,
            _ => false,
        }
    }

    /// Returns true if the whole synchronization must start over.
    pub fn requires_restart(&self) -> bool {
        matches!(self.root(), SyncError::SessionLost(_))
    }

    /// The remote error code, if the server rejected a request.
    pub fn remote_code(&self) -> Option<ErrorCode> {
        match self.root() {
            SyncError::Remote { code, .. } => Some(*code),
            SyncError::SessionLost(_) => Some(ErrorCode::SessionLost),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Remote {
            code: ErrorCode::Internal,
            message: "boom".into()
        }
        .is_retryable());
        assert!(!SyncError::Remote {
            code: ErrorCode::StepOutOfSequence,
            message: "no".into()
        }
        .is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn session_lost_requires_restart() {
        let err = SyncError::from_remote(ErrorResponse {
            code: ErrorCode::SessionLost,
            message: "gone".into(),
        });
        assert!(err.requires_restart());
        assert!(!err.is_retryable());
        assert_eq!(err.remote_code(), Some(ErrorCode::SessionLost));
    }

    #[test]
    fn aborted_delegates_to_source() {
        let err = SyncError::Aborted {
            step: Some(SyncStep::SendChangesInProgress),
            summary: Box::default(),
            source: Box::new(SyncError::transport_retryable("reset")),
        };
        assert!(err.is_retryable());
        assert!(matches!(err.root(), SyncError::Transport { .. }));
        let text = err.to_string();
        assert!(text.contains("SendChangesInProgress"));
        assert!(text.contains("reset"));

        let err = SyncError::Aborted {
            step: None,
            summary: Box::default(),
            source: Box::new(SyncError::Cancelled),
        };
        assert!(err.to_string().contains("start"));
    }
}
