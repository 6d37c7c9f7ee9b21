//! Transport envelope around event payloads.
//!
//! Publishers wrap every payload with the tenant resource path and the id of
//! the calling user. The payload itself is carried base64-encoded so the
//! envelope stays valid JSON whatever the payload bytes are.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Errors raised while decoding a bus message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The message is not a valid envelope
    #[error("invalid envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    /// The envelope payload is not valid base64
    #[error("invalid payload encoding: {0}")]
    Payload(#[from] base64::DecodeError),

    /// The payload is not a known user event
    #[error("invalid user event: {0}")]
    Event(#[source] serde_json::Error),
}

/// Envelope carried by every message on the user subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEnvelope {
    payload: String,
    pub resource_path: String,
    #[serde(default)]
    pub user_id: String,
}

impl DataEnvelope {
    pub fn new(payload: &[u8], resource_path: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            payload: STANDARD.encode(payload),
            resource_path: resource_path.into(),
            user_id: user_id.into(),
        }
    }

    /// Decoded payload bytes.
    pub fn payload(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(STANDARD.decode(&self.payload)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(data).map_err(DecodeError::Envelope)
    }
}
