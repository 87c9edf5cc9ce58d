//! Required request metadata.

use crate::codec::Serializer;
use crate::error::{ProtocolError, ProtocolResult};
use crate::step::SyncStep;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Header carrying the session id.
pub const SESSION_ID_HEADER: &str = "ss-session-id";
/// Header carrying the scope name.
pub const SCOPE_NAME_HEADER: &str = "ss-scope-name";
/// Header carrying the serializer identifier.
pub const SERIALIZER_HEADER: &str = "ss-serializer";
/// Header carrying the step code.
pub const STEP_HEADER: &str = "ss-step";
/// Header carrying the payload hash.
pub const HASH_HEADER: &str = "ss-hash";
/// Header carrying the compression indicator.
pub const COMPRESSION_HEADER: &str = "ss-compression";

/// Identity of one synchronization exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a fresh session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata every request must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaders {
    /// Session the request belongs to.
    pub session_id: SessionId,
    /// Scope being synchronized.
    pub scope_name: String,
    /// Payload serializer.
    pub serializer: Serializer,
    /// Step performed.
    pub step: SyncStep,
    /// Optional SHA-256 hex digest of the body.
    pub hash: Option<String>,
    /// Optional compression indicator. Only `identity` is understood.
    pub compression: Option<String>,
}

impl RequestHeaders {
    /// Creates headers without hash or compression.
    pub fn new(
        session_id: SessionId,
        scope_name: impl Into<String>,
        serializer: Serializer,
        step: SyncStep,
    ) -> Self {
        Self {
            session_id,
            scope_name: scope_name.into(),
            serializer,
            step,
            hash: None,
            compression: None,
        }
    }

    /// Attaches a payload hash.
    #[must_use]
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// Parses headers from name/value pairs. Names are case-insensitive.
    ///
    /// # Errors
    ///
    /// Returns `MissingHeader` or `InvalidHeader` for absent or malformed
    /// required metadata and for unsupported compression.
    pub fn from_pairs<'a, I>(pairs: I) -> ProtocolResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let pairs: Vec<(String, &str)> = pairs
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
            .collect();
        let get = |name: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| *v)
                .filter(|v| !v.is_empty())
        };
        let require = |name: &'static str| get(name).ok_or(ProtocolError::MissingHeader(name));

        let session = require(SESSION_ID_HEADER)?;
        let session_id = Uuid::parse_str(session)
            .map(SessionId)
            .map_err(|_| ProtocolError::InvalidHeader {
                name: SESSION_ID_HEADER,
                value: session.to_string(),
            })?;
        let scope_name = require(SCOPE_NAME_HEADER)?.to_string();
        let serializer = Serializer::from_identifier(require(SERIALIZER_HEADER)?)?;
        let step_value = require(STEP_HEADER)?;
        let step = step_value
            .parse::<u8>()
            .ok()
            .and_then(SyncStep::from_code)
            .ok_or_else(|| ProtocolError::InvalidHeader {
                name: STEP_HEADER,
                value: step_value.to_string(),
            })?;
        let compression = get(COMPRESSION_HEADER).map(str::to_string);
        if let Some(value) = &compression {
            if !value.eq_ignore_ascii_case("identity") {
                return Err(ProtocolError::InvalidHeader {
                    name: COMPRESSION_HEADER,
                    value: value.clone(),
                });
            }
        }

        Ok(Self {
            session_id,
            scope_name,
            serializer,
            step,
            hash: get(HASH_HEADER).map(str::to_string),
            compression,
        })
    }

    /// Renders headers as name/value pairs.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (SESSION_ID_HEADER, self.session_id.to_string()),
            (SCOPE_NAME_HEADER, self.scope_name.clone()),
            (SERIALIZER_HEADER, self.serializer.identifier().to_string()),
            (STEP_HEADER, self.step.to_code().to_string()),
        ];
        if let Some(hash) = &self.hash {
            pairs.push((HASH_HEADER, hash.clone()));
        }
        if let Some(compression) = &self.compression {
            pairs.push((COMPRESSION_HEADER, compression.clone()));
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RequestHeaders {
        RequestHeaders::new(
            SessionId::new(),
            "default",
            Serializer::Json,
            SyncStep::GetMoreChanges,
        )
        .with_hash("00ff")
    }

    #[test]
    fn pairs_roundtrip() {
        let headers = sample();
        let pairs = headers.to_pairs();
        let parsed =
            RequestHeaders::from_pairs(pairs.iter().map(|(k, v)| (*k, v.as_str()))).unwrap();
        assert_eq!(parsed, headers);
    }

    #[test]
    fn names_are_case_insensitive() {
        let id = SessionId::new().to_string();
        let parsed = RequestHeaders::from_pairs([
            ("SS-Session-Id", id.as_str()),
            ("SS-Scope-Name", "s"),
            ("SS-Serializer", "cbor"),
            ("SS-Step", "2"),
        ])
        .unwrap();
        assert_eq!(parsed.step, SyncStep::EnsureScopes);
        assert_eq!(parsed.hash, None);
    }

    #[test]
    fn missing_and_invalid_headers() {
        let err = RequestHeaders::from_pairs([("ss-scope-name", "s")]).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingHeader(SESSION_ID_HEADER)));

        let id = SessionId::new().to_string();
        let err = RequestHeaders::from_pairs([
            ("ss-session-id", id.as_str()),
            ("ss-scope-name", "s"),
            ("ss-serializer", "cbor"),
            ("ss-step", "77"),
        ])
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidHeader { name: STEP_HEADER, .. }));

        let err = RequestHeaders::from_pairs([
            ("ss-session-id", "not-a-uuid"),
            ("ss-scope-name", "s"),
            ("ss-serializer", "cbor"),
            ("ss-step", "2"),
        ])
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidHeader { .. }));
    }

    #[test]
    fn unsupported_compression_is_rejected() {
        let id = SessionId::new().to_string();
        let err = RequestHeaders::from_pairs([
            ("ss-session-id", id.as_str()),
            ("ss-scope-name", "s"),
            ("ss-serializer", "cbor"),
            ("ss-step", "2"),
            ("ss-compression", "gzip"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidHeader {
                name: COMPRESSION_HEADER,
                ..
            }
        ));
    }
}
