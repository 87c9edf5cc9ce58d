//! Transport layer abstraction.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use scopesync_sync_protocol::{SyncRequest, SyncResponse, SyncStep};
use std::collections::VecDeque;

/// Carries requests to the sync server.
///
/// Implementations return `Ok` only for success responses matching the
/// request's step; server error responses become `SyncError::Remote` or
/// `SyncError::SessionLost`.
pub trait SyncTransport: Send + Sync {
    /// Sends one request and waits for its response.
    fn send(&self, request: &SyncRequest) -> SyncResult<SyncResponse>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool {
        true
    }
}

impl<T: SyncTransport + ?Sized> SyncTransport for std::sync::Arc<T> {
    fn send(&self, request: &SyncRequest) -> SyncResult<SyncResponse> {
        (**self).send(request)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// A scripted transport for tests.
///
/// Responses are returned in the order they were pushed; error responses are
/// converted the way a real transport converts them. With an empty script
/// the transport reports a fatal transport error.
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<SyncResponse>>,
    sent: Mutex<Vec<SyncStep>>,
}

impl MockTransport {
    /// Creates a transport with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_response(&self, response: SyncResponse) {
        self.script.lock().push_back(response);
    }

    /// Steps of the requests sent so far.
    pub fn sent_steps(&self) -> Vec<SyncStep> {
        self.sent.lock().clone()
    }
}

impl SyncTransport for MockTransport {
    fn send(&self, request: &SyncRequest) -> SyncResult<SyncResponse> {
        self.sent.lock().push(request.step());
        match self.script.lock().pop_front() {
            Some(SyncResponse::Error(e)) => Err(SyncError::from_remote(e)),
            Some(response) => Ok(response),
            None => Err(SyncError::transport_fatal("no scripted response")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopesync_sync_protocol::{ContextMessage, ErrorCode, SessionId, SyncContext};

    #[test]
    fn mock_replays_script() {
        let transport = MockTransport::new();
        let message = ContextMessage {
            context: SyncContext::new(SessionId::new(), "default", Default::default()),
        };
        transport.push_response(SyncResponse::Ack(message.clone()));
        transport.push_response(SyncResponse::error(ErrorCode::Internal, "busy"));

        let request = SyncRequest::SendEndDownloadChanges(message);
        assert!(transport.send(&request).is_ok());
        assert!(transport.send(&request).unwrap_err().is_retryable());
        assert!(!transport.send(&request).unwrap_err().is_retryable());
        assert_eq!(transport.sent_steps().len(), 3);
    }
}
