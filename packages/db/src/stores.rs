//! SurrealDB-backed implementations of the core storage traits.
//!
//! These adapt the repositories to the object-safe traits the worker,
//! scheduler, limiter and breaker are written against, so one database can
//! back several processes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use symphony_core::envelope::add_duration;
use symphony_core::{
    AdminStore, BoxFuture, CircuitSnapshot, CircuitStore, Disposition, Envelope, EnvelopeId,
    FailedMessage, FailedMessageId, LimiterKey, Page, RateIncrement, RateLimitDecision,
    RateLimitRule, RateLimitStore, ReceiveRequest, RejectOutcome, Rejection, ScheduleDefinition,
    ScheduleId, ScheduleStore, SendOutcome, Statistics, StatsFilter, StoreError, Transport,
    TransportError,
};

use crate::DbError;
use crate::repositories::{
    CircuitRepository, DeadLetterRepository, EnvelopeRepository, RateLimitRepository,
    ScheduleRepository, StatsRepository,
};

impl From<DbError> for TransportError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotInitialized => TransportError::Unavailable(err.to_string()),
            DbError::LockLost(id) => TransportError::LockLost(id),
            DbError::NotFound(msg) => TransportError::NotFound(msg),
            DbError::Conflict(msg) => TransportError::Conflict(msg),
            DbError::Serialization(msg) => TransportError::Serialization(msg),
            DbError::Database(_) | DbError::Query(_) => TransportError::Backend(err.to_string()),
        }
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => StoreError::NotFound(msg),
            DbError::Conflict(msg) => StoreError::Conflict(msg),
            DbError::Serialization(msg) => StoreError::Serialization(msg),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// A named transport over the shared `envelope` and `dead_letter` tables.
#[derive(Debug, Clone)]
pub struct SurrealTransport {
    name: String,
}

impl SurrealTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    async fn reject_at(
        &self,
        envelope: &Envelope,
        rejection: Rejection,
        now: DateTime<Utc>,
    ) -> Result<RejectOutcome, DbError> {
        let worker = envelope.locked_by.clone().unwrap_or_default();
        let mut settled = envelope.clone();

        if let Disposition::Retry { available_at } = rejection.disposition
            && envelope.retry_count < envelope.max_retries
        {
            settled.reschedule(&rejection.error, rejection.error_class, available_at, now);
            EnvelopeRepository::reschedule(&settled, &worker).await?;
            return Ok(RejectOutcome::Rescheduled { available_at });
        }

        settled.fail(&rejection.error, rejection.error_class, now);
        let failed = FailedMessage::from_envelope(&settled);
        EnvelopeRepository::dead_letter(envelope, &failed, &worker).await?;
        Ok(RejectOutcome::DeadLettered(failed.id))
    }
}

impl Transport for SurrealTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(
        &'a self,
        mut envelope: Envelope,
    ) -> BoxFuture<'a, Result<SendOutcome, TransportError>> {
        Box::pin(async move {
            envelope.message.validate()?;
            envelope.transport_name = self.name.clone();
            Ok(EnvelopeRepository::create(&envelope).await?)
        })
    }

    fn receive<'a>(
        &'a self,
        request: &'a ReceiveRequest,
    ) -> BoxFuture<'a, Result<Vec<Envelope>, TransportError>> {
        Box::pin(async move { Ok(EnvelopeRepository::claim(&self.name, request, Utc::now()).await?) })
    }

    fn acknowledge<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move { Ok(EnvelopeRepository::acknowledge(envelope, Utc::now()).await?) })
    }

    fn reject<'a>(
        &'a self,
        envelope: &'a Envelope,
        rejection: Rejection,
    ) -> BoxFuture<'a, Result<RejectOutcome, TransportError>> {
        Box::pin(async move { Ok(self.reject_at(envelope, rejection, Utc::now()).await?) })
    }

    fn release<'a>(
        &'a self,
        envelope: &'a Envelope,
        available_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            Ok(EnvelopeRepository::release(envelope, available_at, Utc::now()).await?)
        })
    }

    fn extend_lock<'a>(
        &'a self,
        envelope: &'a Envelope,
        lock_duration: Duration,
    ) -> BoxFuture<'a, Result<DateTime<Utc>, TransportError>> {
        Box::pin(async move {
            let now = Utc::now();
            let until = add_duration(now, lock_duration);
            EnvelopeRepository::extend_lock(envelope, until, now).await?;
            Ok(until)
        })
    }

    fn queue_depth<'a>(&'a self, queue: Option<&'a str>) -> BoxFuture<'a, Result<u64, TransportError>> {
        Box::pin(async move { Ok(EnvelopeRepository::depth(&self.name, queue).await?) })
    }

    fn purge_completed<'a>(
        &'a self,
        older_than: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<u64, TransportError>> {
        Box::pin(async move { Ok(EnvelopeRepository::purge_completed(&self.name, older_than).await?) })
    }
}

impl AdminStore for SurrealTransport {
    fn list_dead_letters<'a>(
        &'a self,
        limit: usize,
        offset: usize,
    ) -> BoxFuture<'a, Result<Page<FailedMessage>, TransportError>> {
        Box::pin(async move { Ok(DeadLetterRepository::list(&self.name, limit, offset).await?) })
    }

    fn get_dead_letter<'a>(
        &'a self,
        id: FailedMessageId,
    ) -> BoxFuture<'a, Result<Option<FailedMessage>, TransportError>> {
        Box::pin(async move { Ok(DeadLetterRepository::get(&self.name, id).await?) })
    }

    fn retry_dead_letter<'a>(
        &'a self,
        id: FailedMessageId,
    ) -> BoxFuture<'a, Result<Envelope, TransportError>> {
        Box::pin(async move {
            let failed = DeadLetterRepository::get(&self.name, id)
                .await?
                .ok_or_else(|| TransportError::NotFound(format!("dead letter {id}")))?;
            let envelope = failed.to_retry_envelope();
            EnvelopeRepository::replace_dead_letter(&failed, &envelope).await?;
            tracing::info!(failed_id = %id, envelope_id = %envelope.id, "Dead letter re-enqueued");
            Ok(envelope)
        })
    }

    fn delete_dead_letter<'a>(
        &'a self,
        id: FailedMessageId,
    ) -> BoxFuture<'a, Result<bool, TransportError>> {
        Box::pin(async move { Ok(DeadLetterRepository::delete(&self.name, id).await?) })
    }

    fn get_envelope<'a>(
        &'a self,
        id: EnvelopeId,
    ) -> BoxFuture<'a, Result<Option<Envelope>, TransportError>> {
        Box::pin(async move { Ok(EnvelopeRepository::get(&self.name, id).await?) })
    }

    fn statistics<'a>(
        &'a self,
        filter: &'a StatsFilter,
    ) -> BoxFuture<'a, Result<Statistics, TransportError>> {
        Box::pin(async move { Ok(StatsRepository::statistics(filter).await?) })
    }
}

/// Schedule definitions in the `schedule` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SurrealScheduleStore;

impl ScheduleStore for SurrealScheduleStore {
    fn insert<'a>(
        &'a self,
        definition: &'a ScheduleDefinition,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move { Ok(ScheduleRepository::insert(definition).await?) })
    }

    fn get<'a>(
        &'a self,
        id: ScheduleId,
    ) -> BoxFuture<'a, Result<Option<ScheduleDefinition>, StoreError>> {
        Box::pin(async move { Ok(ScheduleRepository::get(id).await?) })
    }

    fn list<'a>(&'a self) -> BoxFuture<'a, Result<Vec<ScheduleDefinition>, StoreError>> {
        Box::pin(async move { Ok(ScheduleRepository::list().await?) })
    }

    fn due<'a>(
        &'a self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<ScheduleDefinition>, StoreError>> {
        Box::pin(async move { Ok(ScheduleRepository::due(now, limit).await?) })
    }

    fn advance<'a>(
        &'a self,
        definition: &'a ScheduleDefinition,
        expected_next_run: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move { Ok(ScheduleRepository::advance(definition, expected_next_run).await?) })
    }

    fn update<'a>(
        &'a self,
        definition: &'a ScheduleDefinition,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move { Ok(ScheduleRepository::update(definition).await?) })
    }

    fn delete<'a>(&'a self, id: ScheduleId) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move { Ok(ScheduleRepository::delete(id).await?) })
    }
}

/// Rate-limit windows in the `rate_limiter` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SurrealRateLimitStore;

impl RateLimitStore for SurrealRateLimitStore {
    fn check_and_increment<'a>(
        &'a self,
        key: &'a LimiterKey,
        increment: RateIncrement,
        rules: &'a [RateLimitRule],
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<RateLimitDecision, StoreError>> {
        Box::pin(async move {
            Ok(RateLimitRepository::check_and_increment(key, increment, rules, now).await?)
        })
    }
}

/// Circuit snapshots in the `circuit` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SurrealCircuitStore;

impl CircuitStore for SurrealCircuitStore {
    fn load<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<CircuitSnapshot>, StoreError>> {
        Box::pin(async move { Ok(CircuitRepository::load(key).await?) })
    }

    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        expected_version: u64,
        next: &'a CircuitSnapshot,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            Ok(CircuitRepository::compare_and_swap(key, expected_version, next).await?)
        })
    }

    fn list<'a>(&'a self) -> BoxFuture<'a, Result<Vec<(String, CircuitSnapshot)>, StoreError>> {
        Box::pin(async move { Ok(CircuitRepository::list().await?) })
    }
}
