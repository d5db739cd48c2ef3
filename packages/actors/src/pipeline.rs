//! Per-envelope processing: limits, breaker, handler, settlement.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use symphony_core::envelope::add_duration;
use symphony_core::{
    CircuitBreaker, CircuitError, Disposition, Envelope, ErrorKind, FailedMessageId,
    HandlerError, Message, RateIncrement, RateLimitReason, RateLimiter, RejectOutcome, Rejection,
    RetryDecision, RetryStrategy, SymphonyEvent, Transport, TransportError,
};
use tokio::time::{Instant, MissedTickBehavior};

use crate::handler::{HandlerContext, HandlerRegistry, MessageHandler};
use crate::observability::{Observability, SEND_DURATION, SEND_FAILURE, SEND_SUCCESS};

const DEFER_ON_STORE_ERROR: Duration = Duration::from_secs(1);
const MIN_RENEW_PERIOD: Duration = Duration::from_millis(10);

/// How one claimed envelope was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Acknowledged,
    Rescheduled { available_at: DateTime<Utc> },
    DeadLettered(FailedMessageId),
    /// Handed back without consuming retry budget (rate limit, open circuit).
    Deferred { available_at: DateTime<Utc> },
    /// Timed out or could not be settled; the lock is left to lapse.
    Abandoned,
    /// Another worker owns the envelope now; the outcome was dropped.
    LockLost,
}

/// Everything a worker needs to process envelopes from one transport.
#[derive(Clone)]
pub struct Pipeline {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) retry: Arc<dyn RetryStrategy>,
    pub(crate) rate_limiter: RateLimiter,
    pub(crate) circuit_breaker: CircuitBreaker,
    pub(crate) observability: Observability,
    pub(crate) worker_id: String,
    pub(crate) lock_duration: Duration,
    pub(crate) handler_timeout: Duration,
}

enum Invocation {
    Finished(Result<(), HandlerError>),
    TimedOut,
}

impl Pipeline {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Process one claimed envelope to a settled outcome.
    pub async fn process(&self, envelope: Envelope) -> ProcessOutcome {
        match self.try_process(&envelope).await {
            Ok(outcome) => outcome,
            Err(TransportError::LockLost(id)) => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    message_id = %id,
                    "Lock lost before settlement, dropping outcome"
                );
                ProcessOutcome::LockLost
            }
            Err(err) => {
                tracing::error!(
                    worker_id = %self.worker_id,
                    message_id = %envelope.id,
                    "Failed to settle envelope: {}",
                    err
                );
                ProcessOutcome::Abandoned
            }
        }
    }

    async fn try_process(&self, envelope: &Envelope) -> Result<ProcessOutcome, TransportError> {
        let message_type = envelope.message_type();
        self.observability.publish(SymphonyEvent::MessageReceived {
            message_id: envelope.id,
            message_type: message_type.to_string(),
            worker_id: self.worker_id.clone(),
            delivery_count: envelope.delivery_count,
            timestamp: Utc::now(),
        });

        if envelope.delivery_count > envelope.max_retries.saturating_add(1) {
            let error = format!(
                "claimed {} times without being settled",
                envelope.delivery_count
            );
            return self
                .dead_letter(envelope, &error, ErrorKind::DeliveryExhausted)
                .await;
        }

        let Some(handler) = self.handlers.get(message_type) else {
            let error = format!("no handler registered for message type '{message_type}'");
            return self.dead_letter(envelope, &error, ErrorKind::Permanent).await;
        };

        let now = Utc::now();
        let destination = handler.destination(&envelope.message);
        if let Err(CircuitError::Open { retry_at, .. }) =
            self.circuit_breaker.check_at(&destination, now).await
        {
            let reason = format!("circuit open for '{destination}'");
            return self.defer(envelope, retry_at, reason).await;
        }

        match self
            .rate_limiter
            .check_send(envelope.message.sender(), increment_for(&envelope.message), now)
            .await
        {
            Ok(None) => {}
            Ok(Some(limited)) if limited.decision.reason == Some(RateLimitReason::SizeExceeded) => {
                let error = format!(
                    "message of {} bytes exceeds the {}-byte limit of {}",
                    limited.decision.current.unwrap_or_default(),
                    limited.decision.limit.unwrap_or_default(),
                    limited.key
                );
                return self.dead_letter(envelope, &error, ErrorKind::Permanent).await;
            }
            Ok(Some(limited)) => {
                let retry_at = limited
                    .decision
                    .reset_at
                    .unwrap_or_else(|| add_duration(now, DEFER_ON_STORE_ERROR));
                let reason = match limited.decision.reason {
                    Some(reason) => format!("rate limited ({}): {reason}", limited.key),
                    None => format!("rate limited ({})", limited.key),
                };
                return self.defer(envelope, retry_at, reason).await;
            }
            Err(err) => {
                tracing::warn!(message_id = %envelope.id, "Rate limiter unavailable: {}", err);
                let retry_at = add_duration(now, DEFER_ON_STORE_ERROR);
                return self
                    .defer(envelope, retry_at, "rate limiter unavailable".into())
                    .await;
            }
        }

        match self.circuit_breaker.acquire_at(&destination, now).await {
            Ok(()) => {}
            Err(CircuitError::Open { retry_at, .. }) => {
                let reason = format!("circuit open for '{destination}'");
                return self.defer(envelope, retry_at, reason).await;
            }
            Err(CircuitError::Store(err)) => {
                tracing::warn!(destination = %destination, "Circuit store unavailable, proceeding: {}", err);
            }
        }

        let timeout = handler.timeout().unwrap_or(self.handler_timeout);
        let started = Instant::now();
        let invocation = self.invoke(handler.as_ref(), envelope, timeout).await?;
        let elapsed = started.elapsed();
        let tags = [("message_type", message_type)];
        self.observability.timing(SEND_DURATION, elapsed, &tags);

        match invocation {
            Invocation::Finished(Ok(())) => {
                self.record_circuit(&destination, false).await;
                self.transport.acknowledge(envelope).await?;
                self.observability.increment(SEND_SUCCESS, &tags);
                self.observability.publish(SymphonyEvent::MessageSent {
                    message_id: envelope.id,
                    message_type: message_type.to_string(),
                    worker_id: self.worker_id.clone(),
                    duration_ms: elapsed.as_millis() as u64,
                    timestamp: Utc::now(),
                });
                tracing::debug!(
                    worker_id = %self.worker_id,
                    message_id = %envelope.id,
                    message_type = %message_type,
                    "Message handled"
                );
                Ok(ProcessOutcome::Acknowledged)
            }
            Invocation::Finished(Err(error)) => {
                self.observability.increment(SEND_FAILURE, &tags);
                let kind = handler.classify(&error);
                self.record_circuit(&destination, kind.counts_against_destination())
                    .await;
                self.settle_failure(envelope, &error, kind).await
            }
            Invocation::TimedOut => {
                self.observability.increment(SEND_FAILURE, &tags);
                self.record_circuit(&destination, true).await;
                let error = format!("handler timed out after {}ms", timeout.as_millis());
                tracing::warn!(
                    worker_id = %self.worker_id,
                    message_id = %envelope.id,
                    message_type = %message_type,
                    "{error}, leaving lock to lapse"
                );
                self.observability.publish(SymphonyEvent::MessageFailed {
                    message_id: envelope.id,
                    message_type: message_type.to_string(),
                    error,
                    error_class: ErrorKind::Transient,
                    retry_count: envelope.retry_count,
                    will_retry: true,
                    timestamp: Utc::now(),
                });
                Ok(ProcessOutcome::Abandoned)
            }
        }
    }

    /// Run the handler on its own task, renewing the lock every half lock
    /// duration until it finishes or the timeout elapses.
    async fn invoke(
        &self,
        handler: &dyn MessageHandler,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<Invocation, TransportError> {
        let context = HandlerContext::new(envelope.clone(), self.worker_id.clone());
        let mut task = tokio::spawn(handler.handle(envelope.message.clone(), context));

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let period = (self.lock_duration / 2).max(MIN_RENEW_PERIOD);
        let mut renew = tokio::time::interval_at(Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                joined = &mut task => {
                    return Ok(Invocation::Finished(match joined {
                        Ok(result) => result,
                        Err(err) if err.is_panic() => Err(HandlerError::permanent("handler panicked")),
                        Err(_) => Err(HandlerError::transient("handler task cancelled")),
                    }));
                }
                () = &mut deadline => {
                    task.abort();
                    return Ok(Invocation::TimedOut);
                }
                _ = renew.tick() => {
                    match self.transport.extend_lock(envelope, self.lock_duration).await {
                        Ok(until) => tracing::trace!(message_id = %envelope.id, %until, "Lock renewed"),
                        Err(err @ TransportError::LockLost(_)) => {
                            task.abort();
                            return Err(err);
                        }
                        Err(err) => tracing::warn!(message_id = %envelope.id, "Lock renewal failed: {}", err),
                    }
                }
            }
        }
    }

    async fn settle_failure(
        &self,
        envelope: &Envelope,
        error: &HandlerError,
        kind: ErrorKind,
    ) -> Result<ProcessOutcome, TransportError> {
        let now = Utc::now();
        let disposition = match self.retry.decide(error, kind, envelope) {
            RetryDecision::Retry { delay } => Disposition::Retry {
                available_at: add_duration(now, delay),
            },
            RetryDecision::DeadLetter => Disposition::DeadLetter,
        };
        let will_retry = matches!(disposition, Disposition::Retry { .. })
            && envelope.retry_count < envelope.max_retries;

        self.observability.publish(SymphonyEvent::MessageFailed {
            message_id: envelope.id,
            message_type: envelope.message_type().to_string(),
            error: error.message.clone(),
            error_class: kind,
            retry_count: envelope.retry_count,
            will_retry,
            timestamp: now,
        });

        let rejection = Rejection {
            error: error.message.clone(),
            error_class: kind,
            disposition,
        };
        match self.transport.reject(envelope, rejection).await? {
            RejectOutcome::Rescheduled { available_at } => {
                tracing::info!(
                    message_id = %envelope.id,
                    message_type = %envelope.message_type(),
                    retry = envelope.retry_count + 1,
                    %available_at,
                    "Retrying after {} failure: {}",
                    kind,
                    error.message
                );
                self.observability.publish(SymphonyEvent::MessageRetrying {
                    message_id: envelope.id,
                    message_type: envelope.message_type().to_string(),
                    retry_count: envelope.retry_count + 1,
                    available_at,
                    timestamp: Utc::now(),
                });
                Ok(ProcessOutcome::Rescheduled { available_at })
            }
            RejectOutcome::DeadLettered(failed_id) => {
                self.publish_dead_lettered(envelope, failed_id, &error.message);
                Ok(ProcessOutcome::DeadLettered(failed_id))
            }
        }
    }

    async fn dead_letter(
        &self,
        envelope: &Envelope,
        error: &str,
        kind: ErrorKind,
    ) -> Result<ProcessOutcome, TransportError> {
        self.observability.publish(SymphonyEvent::MessageFailed {
            message_id: envelope.id,
            message_type: envelope.message_type().to_string(),
            error: error.to_string(),
            error_class: kind,
            retry_count: envelope.retry_count,
            will_retry: false,
            timestamp: Utc::now(),
        });
        let rejection = Rejection {
            error: error.to_string(),
            error_class: kind,
            disposition: Disposition::DeadLetter,
        };
        match self.transport.reject(envelope, rejection).await? {
            RejectOutcome::DeadLettered(failed_id) => {
                self.publish_dead_lettered(envelope, failed_id, error);
                Ok(ProcessOutcome::DeadLettered(failed_id))
            }
            RejectOutcome::Rescheduled { available_at } => {
                Ok(ProcessOutcome::Rescheduled { available_at })
            }
        }
    }

    fn publish_dead_lettered(&self, envelope: &Envelope, failed_id: FailedMessageId, error: &str) {
        tracing::warn!(
            message_id = %envelope.id,
            failed_id = %failed_id,
            message_type = %envelope.message_type(),
            "Message dead-lettered: {}",
            error
        );
        self.observability.publish(SymphonyEvent::MessageDeadLettered {
            message_id: envelope.id,
            failed_id,
            message_type: envelope.message_type().to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    async fn defer(
        &self,
        envelope: &Envelope,
        available_at: DateTime<Utc>,
        reason: String,
    ) -> Result<ProcessOutcome, TransportError> {
        self.transport.release(envelope, available_at).await?;
        tracing::debug!(message_id = %envelope.id, %available_at, "Deferred: {}", reason);
        self.observability.publish(SymphonyEvent::MessageDeferred {
            message_id: envelope.id,
            message_type: envelope.message_type().to_string(),
            reason,
            available_at,
            timestamp: Utc::now(),
        });
        Ok(ProcessOutcome::Deferred { available_at })
    }

    async fn record_circuit(&self, destination: &str, failed: bool) {
        let result = if failed {
            self.circuit_breaker.record_failure(destination).await
        } else {
            self.circuit_breaker.record_success(destination).await
        };
        match result {
            Ok(Some(transition)) => {
                tracing::info!(
                    destination = %destination,
                    "Circuit {} -> {}",
                    transition.from,
                    transition.to
                );
                self.observability.publish(SymphonyEvent::CircuitStateChanged {
                    destination: destination.to_string(),
                    from: transition.from,
                    to: transition.to,
                    timestamp: Utc::now(),
                });
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(destination = %destination, "Failed to record circuit outcome: {}", err);
            }
        }
    }
}

/// Counters a send adds: one message, its recipients and payload size.
///
/// Recipients come from `metadata.recipients`, either a number or a list.
pub fn increment_for(message: &Message) -> RateIncrement {
    let recipients = match message.metadata.get("recipients") {
        Some(Value::Array(list)) => list.len() as u64,
        Some(value) => value.as_u64().unwrap_or(1),
        None => 1,
    };
    RateIncrement::one()
        .with_recipients(recipients)
        .with_size(message.payload_size())
}
