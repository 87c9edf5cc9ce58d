//! HTTP transport.
//!
//! The HTTP library is abstracted behind [`HttpClient`]; this module builds
//! the request metadata, encodes and hashes payloads, and validates
//! responses.

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use scopesync_sync_protocol::{
    payload_hash, verify_hash, RequestHeaders, Serializer, SyncRequest, SyncResponse,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A response as seen by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body.
    pub body: Vec<u8>,
    /// Payload hash header, if the server sent one.
    pub hash: Option<String>,
}

/// HTTP client abstraction.
///
/// Implement this trait over reqwest, hyper, ureq or any other transport
/// that can post a body with headers.
pub trait HttpClient: Send + Sync {
    /// Posts `body` with `headers` and returns the response.
    ///
    /// # Errors
    ///
    /// Returns a message when no response was received.
    fn post(&self, headers: &[(&'static str, String)], body: Vec<u8>)
        -> Result<HttpResponse, String>;

    /// Checks if the client is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// HTTP-based sync transport.
pub struct HttpTransport<C: HttpClient> {
    client: C,
    serializer: Serializer,
    hash_payloads: bool,
    connected: AtomicBool,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport encoding payloads with `serializer`.
    pub fn new(client: C, serializer: Serializer) -> Self {
        Self {
            client,
            serializer,
            hash_payloads: true,
            connected: AtomicBool::new(true),
        }
    }

    /// Enables or disables request payload hashes.
    pub fn with_payload_hashes(mut self, enabled: bool) -> Self {
        self.hash_payloads = enabled;
        self
    }

    /// Marks the transport closed; later sends fail with `NotConnected`.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    fn send(&self, request: &SyncRequest) -> SyncResult<SyncResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let step = request.step();
        let context = request.context();
        let body = request.encode(self.serializer)?;
        let mut headers = RequestHeaders::new(
            context.session_id,
            context.scope_name.clone(),
            self.serializer,
            step,
        );
        if self.hash_payloads {
            headers = headers.with_hash(payload_hash(&body));
        }

        let response = self
            .client
            .post(&headers.to_pairs(), body)
            .map_err(SyncError::transport_retryable)?;
        if let Some(hash) = &response.hash {
            verify_hash(&response.body, hash)?;
        }
        let decoded: SyncResponse = match self.serializer.decode(&response.body) {
            Ok(decoded) => decoded,
            Err(e) if response.status >= 500 => {
                return Err(SyncError::transport_retryable(format!(
                    "status {}: {e}",
                    response.status
                )))
            }
            Err(e) => return Err(e.into()),
        };
        match decoded.expect_step(step)? {
            SyncResponse::Error(e) => Err(SyncError::from_remote(e)),
            ok => Ok(ok),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }
}

/// Handles requests in process.
pub trait LoopbackServer: Send + Sync {
    /// Handles one request given raw header pairs.
    fn handle_post(&self, headers: &[(&str, &str)], body: &[u8]) -> HttpResponse;
}

impl<F> LoopbackServer for F
where
    F: Fn(&[(&str, &str)], &[u8]) -> HttpResponse + Send + Sync,
{
    fn handle_post(&self, headers: &[(&str, &str)], body: &[u8]) -> HttpResponse {
        self(headers, body)
    }
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    fn handle_post(&self, headers: &[(&str, &str)], body: &[u8]) -> HttpResponse {
        (**self).handle_post(headers, body)
    }
}

/// An HTTP client that routes requests directly to an in-process server.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a loopback client connected to `server`.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    fn post(
        &self,
        headers: &[(&'static str, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, String> {
        let pairs: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (*k, v.as_str())).collect();
        Ok(self.server.handle_post(&pairs, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use scopesync_core::ScopeId;
    use scopesync_sync_protocol::{
        ContextMessage, ErrorCode, SessionId, SyncContext, HASH_HEADER, STEP_HEADER,
    };

    struct TestClient {
        response: Mutex<Option<HttpResponse>>,
        seen: Mutex<Vec<(&'static str, String)>>,
    }

    impl TestClient {
        fn new() -> Self {
            Self {
                response: Mutex::new(None),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn respond(&self, status: u16, response: &SyncResponse) {
            let body = Serializer::Cbor.encode(response).unwrap();
            let hash = Some(payload_hash(&body));
            *self.response.lock() = Some(HttpResponse { status, body, hash });
        }
    }

    impl HttpClient for TestClient {
        fn post(
            &self,
            headers: &[(&'static str, String)],
            _body: Vec<u8>,
        ) -> Result<HttpResponse, String> {
            *self.seen.lock() = headers.to_vec();
            self.response
                .lock()
                .clone()
                .ok_or_else(|| "connection refused".to_string())
        }
    }

    fn message() -> ContextMessage {
        ContextMessage {
            context: SyncContext::new(SessionId::new(), "default", ScopeId::new()),
        }
    }

    #[test]
    fn sends_headers_and_decodes() {
        let transport = HttpTransport::new(TestClient::new(), Serializer::Cbor);
        let ack = SyncResponse::Ack(message());
        transport.client().respond(200, &ack);

        let response = transport
            .send(&SyncRequest::SendEndDownloadChanges(message()))
            .unwrap();
        assert_eq!(response, ack);
        let seen = transport.client().seen.lock().clone();
        assert!(seen.iter().any(|(k, v)| *k == STEP_HEADER && v == "8"));
        assert!(seen.iter().any(|(k, _)| *k == HASH_HEADER));
    }

    #[test]
    fn hashes_can_be_disabled() {
        let transport =
            HttpTransport::new(TestClient::new(), Serializer::Cbor).with_payload_hashes(false);
        transport.client().respond(200, &SyncResponse::Ack(message()));
        transport
            .send(&SyncRequest::EndSession(scopesync_sync_protocol::EndSessionRequest {
                context: message().context,
                client_applied: Default::default(),
                remote_timestamp: None,
                duration_ms: 0,
            }))
            .unwrap();
        let seen = transport.client().seen.lock().clone();
        assert!(!seen.iter().any(|(k, _)| *k == HASH_HEADER));
    }

    #[test]
    fn error_responses_become_errors() {
        let transport = HttpTransport::new(TestClient::new(), Serializer::Cbor);
        transport.client().respond(
            410,
            &SyncResponse::error(ErrorCode::SessionLost, "expired"),
        );
        let err = transport
            .send(&SyncRequest::GetSummary(message()))
            .unwrap_err();
        assert!(err.requires_restart());
    }

    #[test]
    fn mismatched_response_is_a_protocol_error() {
        let transport = HttpTransport::new(TestClient::new(), Serializer::Cbor);
        transport.client().respond(200, &SyncResponse::Ack(message()));
        let err = transport
            .send(&SyncRequest::GetSummary(message()))
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn missing_response_is_retryable() {
        let transport = HttpTransport::new(TestClient::new(), Serializer::Cbor);
        let err = transport
            .send(&SyncRequest::GetSummary(message()))
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn corrupted_response_is_rejected() {
        let client = TestClient::new();
        client.respond(200, &SyncResponse::Ack(message()));
        if let Some(response) = client.response.lock().as_mut() {
            response.body.push(0);
        }
        let transport = HttpTransport::new(client, Serializer::Cbor);
        let err = transport
            .send(&SyncRequest::SendEndDownloadChanges(message()))
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn closed_transport_refuses() {
        let transport = HttpTransport::new(TestClient::new(), Serializer::Cbor);
        transport.close();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send(&SyncRequest::GetSummary(message())),
            Err(SyncError::NotConnected)
        ));
    }
}
