use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every frame on the event connection is one JSON envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    /// Unix millis assigned by the sender.
    pub timestamp: u64,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, timestamp: u64, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            timestamp,
            data,
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(text).map_err(|err| ProtoError::MalformedFrame(err.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|err| ProtoError::Encode(err.to_string()))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unknown event type: {0}")]
    UnknownKind(String),
    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("encode failure: {0}")]
    Encode(String),
}
