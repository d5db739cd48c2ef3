//! Pluggable backends holding the durable backlog.
//!
//! A [`Transport`] stores envelopes and hands them to workers through an
//! atomic claim. An [`AdminStore`] exposes the dead-letter store and
//! history aggregation of the same backend to operators.

mod memory;

pub use memory::MemoryTransport;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::BoxFuture;
use crate::envelope::{Envelope, EnvelopeId};
use crate::error::{ErrorKind, StoreError};
use crate::failed::{FailedMessage, FailedMessageId, Page};
use crate::message::ValidationError;
use crate::stats::{Statistics, StatsFilter};

/// Errors raised by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("lock on envelope {0} is no longer held by this worker")]
    LockLost(EnvelopeId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid envelope: {0}")]
    Invalid(#[from] ValidationError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}

impl From<StoreError> for TransportError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => TransportError::Unavailable(msg),
            StoreError::Conflict(msg) => TransportError::Conflict(msg),
            StoreError::NotFound(msg) => TransportError::NotFound(msg),
            StoreError::Serialization(msg) => TransportError::Serialization(msg),
        }
    }
}

/// Result of storing an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Created(EnvelopeId),
    /// The idempotency key is held by a live envelope; nothing was stored.
    Duplicate(EnvelopeId),
}

impl SendOutcome {
    pub fn id(&self) -> EnvelopeId {
        match self {
            SendOutcome::Created(id) | SendOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, SendOutcome::Duplicate(_))
    }
}

/// Parameters of one claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub queue: String,
    pub batch_size: usize,
    pub worker_id: String,
    pub lock_duration: Duration,
}

/// Where a rejected envelope goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry { available_at: DateTime<Utc> },
    DeadLetter,
}

/// A handler failure handed to [`Transport::reject`].
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub error: String,
    pub error_class: ErrorKind,
    pub disposition: Disposition,
}

/// What [`Transport::reject`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectOutcome {
    Rescheduled { available_at: DateTime<Utc> },
    DeadLettered(FailedMessageId),
}

/// Durable backlog with claim semantics.
///
/// `acknowledge`, `reject`, `release` and `extend_lock` are owner-checked:
/// they fail with [`TransportError::LockLost`] unless the stored envelope is
/// still processing under the `locked_by` of the envelope passed in.
pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Store a new envelope, or report the live envelope holding its idempotency key.
    fn send<'a>(&'a self, envelope: Envelope) -> BoxFuture<'a, Result<SendOutcome, TransportError>>;

    /// Atomically claim up to `batch_size` due envelopes, highest priority first.
    ///
    /// Pending envelopes with `available_at <= now` and processing envelopes
    /// whose lock has lapsed are both claimable.
    fn receive<'a>(
        &'a self,
        request: &'a ReceiveRequest,
    ) -> BoxFuture<'a, Result<Vec<Envelope>, TransportError>>;

    /// Mark a claimed envelope completed.
    fn acknowledge<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Reschedule or dead-letter a claimed envelope.
    ///
    /// A retry requested for an envelope whose budget is spent is dead-lettered.
    fn reject<'a>(
        &'a self,
        envelope: &'a Envelope,
        rejection: Rejection,
    ) -> BoxFuture<'a, Result<RejectOutcome, TransportError>>;

    /// Hand a claimed envelope back without consuming retry budget.
    fn release<'a>(
        &'a self,
        envelope: &'a Envelope,
        available_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Push the lock expiry of a claimed envelope to `now + lock_duration`.
    fn extend_lock<'a>(
        &'a self,
        envelope: &'a Envelope,
        lock_duration: Duration,
    ) -> BoxFuture<'a, Result<DateTime<Utc>, TransportError>>;

    /// Pending plus processing envelopes, optionally for one queue.
    fn queue_depth<'a>(&'a self, queue: Option<&'a str>) -> BoxFuture<'a, Result<u64, TransportError>>;

    /// Delete completed envelopes processed before `older_than`.
    fn purge_completed<'a>(
        &'a self,
        older_than: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<u64, TransportError>>;
}

/// Operator view over a backend's dead letters and history.
pub trait AdminStore: Send + Sync + 'static {
    /// Dead letters, most recent first.
    fn list_dead_letters<'a>(
        &'a self,
        limit: usize,
        offset: usize,
    ) -> BoxFuture<'a, Result<Page<FailedMessage>, TransportError>>;

    fn get_dead_letter<'a>(
        &'a self,
        id: FailedMessageId,
    ) -> BoxFuture<'a, Result<Option<FailedMessage>, TransportError>>;

    /// Re-enqueue a fresh envelope and remove the dead letter in one step.
    fn retry_dead_letter<'a>(
        &'a self,
        id: FailedMessageId,
    ) -> BoxFuture<'a, Result<Envelope, TransportError>>;

    fn delete_dead_letter<'a>(
        &'a self,
        id: FailedMessageId,
    ) -> BoxFuture<'a, Result<bool, TransportError>>;

    fn get_envelope<'a>(
        &'a self,
        id: EnvelopeId,
    ) -> BoxFuture<'a, Result<Option<Envelope>, TransportError>>;

    fn statistics<'a>(
        &'a self,
        filter: &'a StatsFilter,
    ) -> BoxFuture<'a, Result<Statistics, TransportError>>;
}
