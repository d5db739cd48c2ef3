//! Envelope domain types: the durable record wrapped around a message.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::ErrorKind;
use crate::message::{Message, ValidationError};

/// Header set on a retry that follows an authentication failure.
pub const AUTH_REFRESH_HEADER: &str = "x-symphony-auth-refresh";

/// Header naming the schedule that produced an envelope.
pub const SCHEDULE_HEADER: &str = "x-symphony-schedule";

/// Unique identifier for an envelope, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(pub Ulid);

impl EnvelopeId {
    /// Create a new unique envelope ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse an envelope ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dispatch priority, 1 (lowest) to 10 (highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(1);
    pub const MAX: Priority = Priority(10);
    pub const NORMAL: Priority = Priority(5);

    pub fn new(value: u8) -> Result<Self, ValidationError> {
        if (1..=10).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ValidationError::PriorityOutOfRange(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    /// Waiting until `available_at` for a worker to claim it.
    #[default]
    Pending,
    /// Claimed by a worker holding an unexpired lock.
    Processing,
    /// Acknowledged by a handler.
    Completed,
    /// Exhausted its retry budget; a dead-letter copy exists.
    Failed,
}

impl EnvelopeStatus {
    /// Check if the envelope is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnvelopeStatus::Completed | EnvelopeStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeStatus::Pending => "pending",
            EnvelopeStatus::Processing => "processing",
            EnvelopeStatus::Completed => "completed",
            EnvelopeStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed handler attempt, kept for the dead-letter error trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub error: String,
    pub error_class: ErrorKind,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub failed_at: DateTime<Utc>,
}

/// The durable record a transport stores and workers claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub message: Message,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub transport_name: String,
    pub queue_name: String,
    pub priority: Priority,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Earliest time the envelope may be claimed.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub available_at: DateTime<Utc>,
    pub status: EnvelopeStatus,
    /// Failed attempts that were rescheduled.
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    /// Number of times the envelope has been claimed, including lapsed claims.
    #[serde(default)]
    pub delivery_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub error_class: Option<ErrorKind>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(default)]
    pub locked_by: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub lock_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Envelope {
    /// Create a pending envelope that is immediately available.
    pub fn new(
        message: Message,
        transport_name: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EnvelopeId::new(),
            message,
            headers: BTreeMap::new(),
            transport_name: transport_name.into(),
            queue_name: queue_name.into(),
            priority: Priority::default(),
            scheduled_at: None,
            available_at: now,
            status: EnvelopeStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            delivery_count: 0,
            last_error: None,
            error_class: None,
            attempts: Vec::new(),
            locked_by: None,
            lock_expires_at: None,
            idempotency_key: None,
            created_at: now,
            processed_at: None,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Defer availability until `at`.
    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self.available_at = at;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn message_type(&self) -> &str {
        &self.message.message_type
    }

    /// True while another worker may not claim this envelope.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_by.is_some() && self.lock_expires_at.is_some_and(|expires| expires > now)
    }

    /// Whether a worker polling at `now` may claim this envelope.
    ///
    /// Due pending envelopes are claimable, and so are processing envelopes
    /// whose lock lapsed without a settlement.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            EnvelopeStatus::Pending => self.available_at <= now && !self.is_locked_at(now),
            EnvelopeStatus::Processing => !self.is_locked_at(now),
            EnvelopeStatus::Completed | EnvelopeStatus::Failed => false,
        }
    }

    /// Mark as processing under `worker_id` until `now + lock_duration`.
    pub fn claim(&mut self, worker_id: &str, lock_duration: Duration, now: DateTime<Utc>) {
        self.status = EnvelopeStatus::Processing;
        self.locked_by = Some(worker_id.to_string());
        self.lock_expires_at = Some(add_duration(now, lock_duration));
        self.delivery_count = self.delivery_count.saturating_add(1);
        self.updated_at = now;
    }

    /// True if `worker_id` holds the lock (expired or not).
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.locked_by.as_deref() == Some(worker_id)
    }

    /// Whether the previous attempt failed authentication and asked for a credential refresh.
    pub fn auth_refresh_requested(&self) -> bool {
        self.headers
            .get(AUTH_REFRESH_HEADER)
            .is_some_and(|value| value == "true")
    }

    fn clear_lock(&mut self) {
        self.locked_by = None;
        self.lock_expires_at = None;
    }

    /// Settle as completed.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = EnvelopeStatus::Completed;
        self.processed_at = Some(now);
        self.updated_at = now;
        self.clear_lock();
    }

    /// Put back to pending for another attempt at `available_at`, recording the failure.
    pub fn reschedule(
        &mut self,
        error: &str,
        error_class: ErrorKind,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.record_attempt(error, error_class, now);
        self.retry_count = self.retry_count.saturating_add(1);
        self.status = EnvelopeStatus::Pending;
        self.available_at = available_at;
        self.updated_at = now;
        if error_class == ErrorKind::Authentication {
            self.headers
                .insert(AUTH_REFRESH_HEADER.to_string(), "true".to_string());
        } else {
            self.headers.remove(AUTH_REFRESH_HEADER);
        }
        self.clear_lock();
    }

    /// Return to pending without consuming retry budget.
    pub fn release(&mut self, available_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = EnvelopeStatus::Pending;
        self.available_at = available_at;
        self.delivery_count = self.delivery_count.saturating_sub(1);
        self.updated_at = now;
        self.clear_lock();
    }

    /// Settle as failed, recording the final error.
    pub fn fail(&mut self, error: &str, error_class: ErrorKind, now: DateTime<Utc>) {
        self.record_attempt(error, error_class, now);
        self.status = EnvelopeStatus::Failed;
        self.processed_at = Some(now);
        self.updated_at = now;
        self.clear_lock();
    }

    fn record_attempt(&mut self, error: &str, error_class: ErrorKind, now: DateTime<Utc>) {
        self.last_error = Some(error.to_string());
        self.error_class = Some(error_class);
        self.attempts.push(AttemptRecord {
            attempt: self.delivery_count.max(self.retry_count + 1),
            error: error.to_string(),
            error_class,
            failed_at: now,
        });
    }
}

/// `at + duration`, saturating at the maximum representable time.
pub fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
