//! The producer-facing unit of work.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Validation failures for messages and dispatch options.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message type must not be empty")]
    EmptyType,
    #[error("message payload must be a JSON object, got {0}")]
    PayloadNotObject(&'static str),
    #[error("priority must be between 1 and 10, got {0}")]
    PriorityOutOfRange(u8),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// An immutable unit of work routed to the handler registered for `message_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Routing key for handler lookup.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Handler-specific body.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Caller-supplied metadata (sender, campaign id, ...).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Message {
    /// Build a message from a JSON payload, rejecting empty types and non-object payloads.
    pub fn new(message_type: impl Into<String>, payload: Value) -> Result<Self, ValidationError> {
        let message_type = message_type.into();
        if message_type.trim().is_empty() {
            return Err(ValidationError::EmptyType);
        }

        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => return Err(ValidationError::PayloadNotObject("null")),
            Value::Bool(_) => return Err(ValidationError::PayloadNotObject("bool")),
            Value::Number(_) => return Err(ValidationError::PayloadNotObject("number")),
            Value::String(_) => return Err(ValidationError::PayloadNotObject("string")),
            Value::Array(_) => return Err(ValidationError::PayloadNotObject("array")),
        };

        Ok(Self {
            message_type,
            payload,
            metadata: Map::new(),
        })
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Re-check the invariants `new` enforces, for messages built by hand or deserialized.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.message_type.trim().is_empty() {
            return Err(ValidationError::EmptyType);
        }
        Ok(())
    }

    /// Sender identity used for per-sender rate limiting, read from `metadata.sender`.
    pub fn sender(&self) -> Option<&str> {
        self.metadata.get("sender").and_then(Value::as_str)
    }

    /// Approximate encoded size of the payload in bytes.
    pub fn payload_size(&self) -> u64 {
        serde_json::to_vec(&self.payload)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0)
    }
}
