//! Dead-letter records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::envelope::{AttemptRecord, Envelope, EnvelopeId};
use crate::error::ErrorKind;
use crate::message::Message;

/// Unique identifier for a dead-letter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailedMessageId(pub Ulid);

impl FailedMessageId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for FailedMessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FailedMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal copy of an envelope that can no longer be retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedMessage {
    pub id: FailedMessageId,
    pub original_message_id: EnvelopeId,
    pub transport_name: String,
    pub queue_name: String,
    pub body: Message,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub error: String,
    pub error_class: ErrorKind,
    /// Every failed attempt, oldest first.
    #[serde(default)]
    pub error_trace: Vec<AttemptRecord>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub failed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl FailedMessage {
    /// Build the dead-letter copy of an envelope that has already been marked failed.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let failed_at = envelope.processed_at.unwrap_or(envelope.updated_at);
        let mut metadata = envelope.message.metadata.clone();
        metadata.insert("priority".into(), Value::from(envelope.priority.value()));
        metadata.insert(
            "delivery_count".into(),
            Value::from(envelope.delivery_count),
        );
        metadata.insert(
            "created_at".into(),
            Value::from(envelope.created_at.timestamp_millis()),
        );

        Self {
            id: FailedMessageId::new(),
            original_message_id: envelope.id,
            transport_name: envelope.transport_name.clone(),
            queue_name: envelope.queue_name.clone(),
            body: envelope.message.clone(),
            headers: envelope.headers.clone(),
            error: envelope.last_error.clone().unwrap_or_default(),
            error_class: envelope.error_class.unwrap_or(ErrorKind::Permanent),
            error_trace: envelope.attempts.clone(),
            retry_count: envelope.retry_count,
            max_retries: envelope.max_retries,
            failed_at,
            metadata,
            idempotency_key: envelope.idempotency_key.clone(),
        }
    }

    /// A fresh pending envelope carrying the same message, with the retry budget reset.
    pub fn to_retry_envelope(&self) -> Envelope {
        let mut envelope = Envelope::new(
            self.body.clone(),
            self.transport_name.clone(),
            self.queue_name.clone(),
        )
        .with_max_retries(self.max_retries);

        envelope.headers = self.headers.clone();
        envelope
            .headers
            .remove(crate::envelope::AUTH_REFRESH_HEADER);
        if let Some(priority) = self
            .metadata
            .get("priority")
            .and_then(Value::as_u64)
            .and_then(|value| u8::try_from(value).ok())
            .and_then(|value| crate::envelope::Priority::new(value).ok())
        {
            envelope.priority = priority;
        }
        envelope.idempotency_key = self.idempotency_key.clone();
        envelope
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeStatus, Priority};
    use serde_json::json;

    #[test]
    fn retry_envelope_resets_budget_and_keeps_routing() {
        let now = Utc::now();
        let mut env = Envelope::new(
            Message::new("email.send", json!({"to": "x@example.com"})).unwrap(),
            "db",
            "emails",
        )
        .with_priority(Priority::new(8).unwrap())
        .with_idempotency_key("welcome-42");
        env.claim("w", std::time::Duration::from_secs(30), now);
        env.reschedule("503", ErrorKind::Transient, now, now);
        env.claim("w", std::time::Duration::from_secs(30), now);
        env.fail("422 bad address", ErrorKind::Permanent, now);

        let failed = FailedMessage::from_envelope(&env);
        assert_eq!(failed.error_trace.len(), 2);
        assert_eq!(failed.error_class, ErrorKind::Permanent);
        assert_eq!(failed.retry_count, 1);

        let retry = failed.to_retry_envelope();
        assert_ne!(retry.id, env.id);
        assert_eq!(retry.retry_count, 0);
        assert_eq!(retry.status, EnvelopeStatus::Pending);
        assert_eq!(retry.priority.value(), 8);
        assert_eq!(retry.idempotency_key.as_deref(), Some("welcome-42"));
        assert_eq!(retry.queue_name, "emails");
    }
}
