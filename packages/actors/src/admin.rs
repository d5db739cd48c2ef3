//! Operator inspection: dead letters, envelopes, statistics, schedules, circuits.

use std::sync::Arc;

use chrono::Utc;
use symphony_core::{
    AdminStore, CircuitBreaker, CircuitSnapshot, Envelope, EnvelopeId, EnvelopeStatus,
    FailedMessage, FailedMessageId, Page, ScheduleDefinition, ScheduleError, ScheduleId,
    ScheduleStore, Statistics, StatsFilter, StoreError, SymphonyEvent, TransportError,
};
use thiserror::Error;

use crate::dispatcher::TransportRegistry;
use crate::observability::Observability;

/// Largest page the listing returns.
pub const MAX_PAGE_SIZE: usize = 500;

/// Admin errors.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),
}

/// Read and repair surface consumed by an operator UI.
#[derive(Clone)]
pub struct AdminService {
    transports: TransportRegistry,
    default_transport: String,
    schedules: Arc<dyn ScheduleStore>,
    circuit_breaker: CircuitBreaker,
    observability: Observability,
}

impl AdminService {
    pub fn new(
        transports: TransportRegistry,
        default_transport: impl Into<String>,
        schedules: Arc<dyn ScheduleStore>,
        circuit_breaker: CircuitBreaker,
        observability: Observability,
    ) -> Self {
        Self {
            transports,
            default_transport: default_transport.into(),
            schedules,
            circuit_breaker,
            observability,
        }
    }

    fn admin(&self, transport: Option<&str>) -> Result<Arc<dyn AdminStore>, AdminError> {
        let name = transport.unwrap_or(&self.default_transport);
        self.transports
            .admin(name)
            .ok_or_else(|| AdminError::UnknownTransport(name.to_string()))
    }

    // Dead letters

    /// One page of dead letters, newest first. `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub async fn list_dead_letters(
        &self,
        transport: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Page<FailedMessage>, AdminError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        Ok(self.admin(transport)?.list_dead_letters(limit, offset).await?)
    }

    /// Find a dead letter on whichever transport holds it.
    pub async fn get_dead_letter(
        &self,
        id: FailedMessageId,
    ) -> Result<Option<FailedMessage>, AdminError> {
        Ok(self.find_dead_letter(id).await?.map(|(_, failed)| failed))
    }

    async fn find_dead_letter(
        &self,
        id: FailedMessageId,
    ) -> Result<Option<(Arc<dyn AdminStore>, FailedMessage)>, AdminError> {
        for (_, _, admin) in self.transports.iter() {
            if let Some(failed) = admin.get_dead_letter(id).await? {
                return Ok(Some((admin.clone(), failed)));
            }
        }
        Ok(None)
    }

    /// Re-enqueue a dead letter as a fresh envelope and remove the dead letter.
    pub async fn retry_dead_letter(&self, id: FailedMessageId) -> Result<Envelope, AdminError> {
        let (admin, _) = self
            .find_dead_letter(id)
            .await?
            .ok_or_else(|| AdminError::NotFound(format!("dead letter {id}")))?;
        let envelope = admin.retry_dead_letter(id).await?;
        self.observability.publish(SymphonyEvent::DeadLetterRetried {
            failed_id: id,
            message_id: envelope.id,
            timestamp: Utc::now(),
        });
        Ok(envelope)
    }

    /// Discard a dead letter permanently.
    pub async fn delete_dead_letter(&self, id: FailedMessageId) -> Result<(), AdminError> {
        for (name, _, admin) in self.transports.iter() {
            if admin.delete_dead_letter(id).await? {
                tracing::info!("Deleted dead letter {} from {}", id, name);
                self.observability.publish(SymphonyEvent::DeadLetterDeleted {
                    failed_id: id,
                    timestamp: Utc::now(),
                });
                return Ok(());
            }
        }
        Err(AdminError::NotFound(format!("dead letter {id}")))
    }

    // Envelopes and statistics

    pub async fn get_envelope(&self, id: EnvelopeId) -> Result<Option<Envelope>, AdminError> {
        for (_, _, admin) in self.transports.iter() {
            if let Some(envelope) = admin.get_envelope(id).await? {
                return Ok(Some(envelope));
            }
        }
        Ok(None)
    }

    /// Aggregate statistics. Without a transport filter, each registered
    /// transport is aggregated separately and the results merged.
    pub async fn statistics(&self, filter: &StatsFilter) -> Result<Statistics, AdminError> {
        if let Some(name) = filter.transport.as_deref() {
            return Ok(self.admin(Some(name))?.statistics(filter).await?);
        }

        let mut parts = Vec::new();
        for (name, _, admin) in self.transports.iter() {
            let scoped = StatsFilter {
                transport: Some(name.to_string()),
                ..filter.clone()
            };
            parts.push(admin.statistics(&scoped).await?);
        }
        Ok(merge_statistics(parts))
    }

    /// Active envelopes on a transport, optionally for one queue.
    pub async fn queue_depth(
        &self,
        transport: Option<&str>,
        queue: Option<&str>,
    ) -> Result<u64, AdminError> {
        let name = transport.unwrap_or(&self.default_transport);
        let transport = self
            .transports
            .get(name)
            .ok_or_else(|| AdminError::UnknownTransport(name.to_string()))?;
        Ok(transport.queue_depth(queue).await?)
    }

    // Schedules

    pub async fn create_schedule(&self, definition: ScheduleDefinition) -> Result<ScheduleDefinition, AdminError> {
        definition.validate()?;
        self.schedules.insert(&definition).await?;
        tracing::info!(
            schedule_id = %definition.id,
            message_type = %definition.message_type,
            "Schedule created ({})",
            definition.schedule.type_name()
        );
        Ok(definition)
    }

    pub async fn get_schedule(&self, id: ScheduleId) -> Result<Option<ScheduleDefinition>, AdminError> {
        Ok(self.schedules.get(id).await?)
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>, AdminError> {
        Ok(self.schedules.list().await?)
    }

    /// Enable or disable a schedule. Re-enabling recomputes the next run.
    pub async fn set_schedule_enabled(
        &self,
        id: ScheduleId,
        enabled: bool,
    ) -> Result<ScheduleDefinition, AdminError> {
        let mut definition = self
            .schedules
            .get(id)
            .await?
            .ok_or_else(|| AdminError::NotFound(format!("schedule {id}")))?;
        definition.set_enabled(enabled, Utc::now())?;
        self.schedules.update(&definition).await?;
        tracing::info!(schedule_id = %id, enabled, "Schedule updated");
        Ok(definition)
    }

    pub async fn delete_schedule(&self, id: ScheduleId) -> Result<(), AdminError> {
        if self.schedules.delete(id).await? {
            tracing::info!(schedule_id = %id, "Schedule deleted");
            Ok(())
        } else {
            Err(AdminError::NotFound(format!("schedule {id}")))
        }
    }

    // Circuits

    /// Every known circuit by destination.
    pub async fn circuits(&self) -> Result<Vec<(String, CircuitSnapshot)>, AdminError> {
        Ok(self.circuit_breaker.list().await?)
    }
}

/// Sum per-transport statistics. Rates are recomputed from the merged
/// counts; average latency is weighted by each part's completed count.
pub fn merge_statistics(parts: Vec<Statistics>) -> Statistics {
    let mut merged = Statistics::default();
    let mut latency_weighted = 0.0;
    let mut latency_samples = 0u64;

    for part in parts {
        if let Some(average) = part.average_processing_ms {
            let samples = part.count(EnvelopeStatus::Completed).max(1);
            latency_weighted += average * samples as f64;
            latency_samples += samples;
        }

        for (status, count) in part.status_counts {
            *merged.status_counts.entry(status).or_default() += count;
        }
        for (priority, count) in part.priority_histogram {
            *merged.priority_histogram.entry(priority).or_default() += count;
        }
        for (message_type, count) in part.by_message_type {
            *merged.by_message_type.entry(message_type).or_default() += count;
        }
        for (transport, count) in part.by_transport {
            *merged.by_transport.entry(transport).or_default() += count;
        }
        merged.dead_letter_count += part.dead_letter_count;
        merged.queue_depth += part.queue_depth;
    }

    let completed = merged.count(EnvelopeStatus::Completed);
    let settled = completed + merged.dead_letter_count;
    merged.success_rate = (settled > 0).then(|| completed as f64 / settled as f64);
    merged.average_processing_ms =
        (latency_samples > 0).then(|| latency_weighted / latency_samples as f64);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(transport: &str, completed: u64, dead: u64, average: Option<f64>) -> Statistics {
        let mut stats = Statistics::default();
        stats.status_counts.insert("completed".into(), completed);
        stats.status_counts.insert("failed".into(), dead);
        stats.by_transport.insert(transport.into(), completed + dead);
        stats.dead_letter_count = dead;
        stats.average_processing_ms = average;
        stats
    }

    #[test]
    fn merge_recomputes_rates() {
        let merged = merge_statistics(vec![
            part("a", 3, 1, Some(100.0)),
            part("b", 1, 3, Some(500.0)),
        ]);
        assert_eq!(merged.count(EnvelopeStatus::Completed), 4);
        assert_eq!(merged.dead_letter_count, 4);
        assert_eq!(merged.success_rate, Some(0.5));
        assert_eq!(merged.average_processing_ms, Some(200.0));
        assert_eq!(merged.by_transport.len(), 2);
    }

    #[test]
    fn merge_of_nothing_is_empty() {
        let merged = merge_statistics(Vec::new());
        assert_eq!(merged.success_rate, None);
        assert_eq!(merged.average_processing_ms, None);
    }
}
