//! Lifecycle events published to the observability collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitState;
use crate::envelope::EnvelopeId;
use crate::error::ErrorKind;
use crate::failed::FailedMessageId;
use crate::schedule::ScheduleId;

/// Events emitted by the queue engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SymphonyEvent {
    // Producer events
    /// An envelope was stored (or an idempotent duplicate was detected).
    MessageDispatched {
        message_id: EnvelopeId,
        message_type: String,
        transport: String,
        queue: String,
        duplicate: bool,
        timestamp: DateTime<Utc>,
    },

    // Worker events
    /// A worker claimed an envelope.
    MessageReceived {
        message_id: EnvelopeId,
        message_type: String,
        worker_id: String,
        delivery_count: u32,
        timestamp: DateTime<Utc>,
    },
    /// A handler completed and the envelope was acknowledged.
    MessageSent {
        message_id: EnvelopeId,
        message_type: String,
        worker_id: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A handler failed or timed out.
    MessageFailed {
        message_id: EnvelopeId,
        message_type: String,
        error: String,
        error_class: ErrorKind,
        retry_count: u32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    /// A failed envelope was rescheduled.
    MessageRetrying {
        message_id: EnvelopeId,
        message_type: String,
        retry_count: u32,
        available_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    /// An envelope was handed back without consuming retry budget.
    MessageDeferred {
        message_id: EnvelopeId,
        message_type: String,
        reason: String,
        available_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    /// An envelope moved to the dead-letter store.
    MessageDeadLettered {
        message_id: EnvelopeId,
        failed_id: FailedMessageId,
        message_type: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    // Admin events
    /// A dead letter was re-enqueued.
    DeadLetterRetried {
        failed_id: FailedMessageId,
        message_id: EnvelopeId,
        timestamp: DateTime<Utc>,
    },
    /// A dead letter was discarded.
    DeadLetterDeleted {
        failed_id: FailedMessageId,
        timestamp: DateTime<Utc>,
    },

    // Infrastructure events
    /// A destination's circuit breaker changed state.
    CircuitStateChanged {
        destination: String,
        from: CircuitState,
        to: CircuitState,
        timestamp: DateTime<Utc>,
    },
    /// A schedule produced an envelope.
    ScheduleFired {
        schedule_id: ScheduleId,
        message_id: EnvelopeId,
        run_count: u32,
        next_run_at: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },
    /// A worker began polling.
    WorkerStarted {
        worker_id: String,
        transport: String,
        queue: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker drained and stopped.
    WorkerStopped {
        worker_id: String,
        processed: u64,
        timestamp: DateTime<Utc>,
    },
}

impl SymphonyEvent {
    /// Dotted event name used by sinks, e.g. `message.sent`.
    pub fn name(&self) -> &'static str {
        match self {
            SymphonyEvent::MessageDispatched { .. } => "message.dispatched",
            SymphonyEvent::MessageReceived { .. } => "message.received",
            SymphonyEvent::MessageSent { .. } => "message.sent",
            SymphonyEvent::MessageFailed { .. } => "message.failed",
            SymphonyEvent::MessageRetrying { .. } => "message.retrying",
            SymphonyEvent::MessageDeferred { .. } => "message.deferred",
            SymphonyEvent::MessageDeadLettered { .. } => "message.dead_lettered",
            SymphonyEvent::DeadLetterRetried { .. } => "dead_letter.retried",
            SymphonyEvent::DeadLetterDeleted { .. } => "dead_letter.deleted",
            SymphonyEvent::CircuitStateChanged { .. } => "circuit.state_changed",
            SymphonyEvent::ScheduleFired { .. } => "schedule.fired",
            SymphonyEvent::WorkerStarted { .. } => "worker.started",
            SymphonyEvent::WorkerStopped { .. } => "worker.stopped",
        }
    }

    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SymphonyEvent::MessageDispatched { timestamp, .. }
            | SymphonyEvent::MessageReceived { timestamp, .. }
            | SymphonyEvent::MessageSent { timestamp, .. }
            | SymphonyEvent::MessageFailed { timestamp, .. }
            | SymphonyEvent::MessageRetrying { timestamp, .. }
            | SymphonyEvent::MessageDeferred { timestamp, .. }
            | SymphonyEvent::MessageDeadLettered { timestamp, .. }
            | SymphonyEvent::DeadLetterRetried { timestamp, .. }
            | SymphonyEvent::DeadLetterDeleted { timestamp, .. }
            | SymphonyEvent::CircuitStateChanged { timestamp, .. }
            | SymphonyEvent::ScheduleFired { timestamp, .. }
            | SymphonyEvent::WorkerStarted { timestamp, .. }
            | SymphonyEvent::WorkerStopped { timestamp, .. } => *timestamp,
        }
    }

    /// Get the envelope ID associated with this event, if any.
    pub fn message_id(&self) -> Option<EnvelopeId> {
        match self {
            SymphonyEvent::MessageDispatched { message_id, .. }
            | SymphonyEvent::MessageReceived { message_id, .. }
            | SymphonyEvent::MessageSent { message_id, .. }
            | SymphonyEvent::MessageFailed { message_id, .. }
            | SymphonyEvent::MessageRetrying { message_id, .. }
            | SymphonyEvent::MessageDeferred { message_id, .. }
            | SymphonyEvent::MessageDeadLettered { message_id, .. }
            | SymphonyEvent::DeadLetterRetried { message_id, .. }
            | SymphonyEvent::ScheduleFired { message_id, .. } => Some(*message_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            SymphonyEvent::MessageDispatched {
                message_id,
                queue,
                duplicate,
                ..
            } => {
                let dup = if *duplicate { " (duplicate)" } else { "" };
                format!("Message {message_id} dispatched to {queue}{dup}")
            }
            SymphonyEvent::MessageReceived {
                message_id,
                worker_id,
                ..
            } => format!("Message {message_id} claimed by {worker_id}"),
            SymphonyEvent::MessageSent {
                message_id,
                duration_ms,
                ..
            } => format!("Message {message_id} handled in {duration_ms}ms"),
            SymphonyEvent::MessageFailed {
                message_id,
                error,
                will_retry,
                ..
            } => {
                let retry = if *will_retry { " (will retry)" } else { "" };
                format!("Message {message_id} failed: {error}{retry}")
            }
            SymphonyEvent::MessageRetrying {
                message_id,
                retry_count,
                ..
            } => format!("Message {message_id} retrying (retry {retry_count})"),
            SymphonyEvent::MessageDeferred {
                message_id, reason, ..
            } => format!("Message {message_id} deferred: {reason}"),
            SymphonyEvent::MessageDeadLettered {
                message_id,
                failed_id,
                ..
            } => format!("Message {message_id} dead-lettered as {failed_id}"),
            SymphonyEvent::DeadLetterRetried {
                failed_id,
                message_id,
                ..
            } => format!("Dead letter {failed_id} re-enqueued as {message_id}"),
            SymphonyEvent::DeadLetterDeleted { failed_id, .. } => {
                format!("Dead letter {failed_id} deleted")
            }
            SymphonyEvent::CircuitStateChanged {
                destination,
                from,
                to,
                ..
            } => format!("Circuit {destination}: {from} -> {to}"),
            SymphonyEvent::ScheduleFired {
                schedule_id,
                message_id,
                ..
            } => format!("Schedule {schedule_id} fired {message_id}"),
            SymphonyEvent::WorkerStarted {
                worker_id, queue, ..
            } => format!("Worker {worker_id} polling {queue}"),
            SymphonyEvent::WorkerStopped {
                worker_id,
                processed,
                ..
            } => format!("Worker {worker_id} stopped after {processed} messages"),
        }
    }
}
