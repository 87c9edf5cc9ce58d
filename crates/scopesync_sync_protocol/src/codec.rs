//! Payload serializers and integrity hashing.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Payload serializer selected by the request's serializer header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Serializer {
    /// CBOR via `ciborium`.
    #[default]
    Cbor,
    /// JSON via `serde_json`.
    Json,
}

impl Serializer {
    /// Header identifier.
    pub fn identifier(&self) -> &'static str {
        match self {
            Serializer::Cbor => "cbor",
            Serializer::Json => "json",
        }
    }

    /// Parses a header identifier.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSerializer` for anything but `cbor` or `json`.
    pub fn from_identifier(id: &str) -> ProtocolResult<Self> {
        match id.to_ascii_lowercase().as_str() {
            "cbor" => Ok(Serializer::Cbor),
            "json" => Ok(Serializer::Json),
            _ => Err(ProtocolError::UnknownSerializer(id.to_string())),
        }
    }

    /// Encodes a value.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if serialization fails.
    pub fn encode<T: Serialize>(&self, value: &T) -> ProtocolResult<Vec<u8>> {
        match self {
            Serializer::Cbor => {
                let mut bytes = Vec::new();
                ciborium::into_writer(value, &mut bytes)
                    .map_err(|e| ProtocolError::codec(e.to_string()))?;
                Ok(bytes)
            }
            Serializer::Json => {
                serde_json::to_vec(value).map_err(|e| ProtocolError::codec(e.to_string()))
            }
        }
    }

    /// Decodes a value.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if the bytes do not decode to `T`.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> ProtocolResult<T> {
        match self {
            Serializer::Cbor => {
                ciborium::from_reader(bytes).map_err(|e| ProtocolError::codec(e.to_string()))
            }
            Serializer::Json => {
                serde_json::from_slice(bytes).map_err(|e| ProtocolError::codec(e.to_string()))
            }
        }
    }
}

/// SHA-256 of `payload` as lowercase hex.
pub fn payload_hash(payload: &[u8]) -> String {
    Sha256::digest(payload)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Checks `payload` against an expected hash.
///
/// # Errors
///
/// Returns `ChecksumMismatch` if the hashes differ.
pub fn verify_hash(payload: &[u8], expected: &str) -> ProtocolResult<()> {
    let actual = payload_hash(payload);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(ProtocolError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
