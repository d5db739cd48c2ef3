//! Turns due schedule definitions into envelopes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use symphony_core::{
    SCHEDULE_HEADER, ScheduleDefinition, ScheduleError, ScheduleStore, StoreError, SymphonyEvent,
};
use thiserror::Error;

use crate::dispatcher::{DispatchError, DispatchOptions, Dispatcher, TransportRegistry};
use crate::observability::Observability;

/// Errors firing a single schedule.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Schedule store error: {0}")]
    Store(#[from] StoreError),
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Fires due schedules and purges old completed envelopes.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    dispatcher: Dispatcher,
    transports: TransportRegistry,
    observability: Observability,
    batch_size: usize,
    completed_retention: Option<Duration>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        dispatcher: Dispatcher,
        transports: TransportRegistry,
        observability: Observability,
    ) -> Self {
        Self {
            store,
            dispatcher,
            transports,
            observability,
            batch_size: 100,
            completed_retention: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_completed_retention(mut self, retention: Option<Duration>) -> Self {
        self.completed_retention = retention;
        self
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    /// Fire every schedule due at `now`. Returns how many this call fired.
    ///
    /// A schedule that fails to fire is logged and retried on the next call.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let due = self.store.due(now, self.batch_size).await?;
        let mut fired = 0;
        for definition in due {
            match self.fire(&definition, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(schedule_id = %definition.id, "Failed to fire schedule: {}", err);
                }
            }
        }
        Ok(fired)
    }

    /// Claim the pending fire of `definition` by advancing it, then dispatch.
    ///
    /// Returns `false` when another scheduler advanced the slot first, in
    /// which case nothing is dispatched. A failed dispatch puts the observed
    /// definition back so the slot fires on a later call.
    pub async fn fire(
        &self,
        definition: &ScheduleDefinition,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let expected = definition.next_run_at;
        let message = definition.to_message().map_err(DispatchError::from)?;

        let mut next = definition.clone();
        next.advance(now)?;
        if !self.store.advance(&next, expected).await? {
            tracing::debug!(schedule_id = %definition.id, "Schedule already advanced elsewhere");
            return Ok(false);
        }

        let mut options = DispatchOptions {
            transport: definition.transport_name.clone(),
            queue: definition.queue_name.clone(),
            priority: Some(definition.priority),
            idempotency_key: Some(definition.fire_key()),
            headers: definition.headers.clone(),
            ..Default::default()
        };
        options
            .headers
            .insert(SCHEDULE_HEADER.to_string(), definition.id.to_string());
        let receipt = match self.dispatcher.dispatch(message, options).await {
            Ok(receipt) => receipt,
            Err(err) => {
                if let Err(restore) = self.store.update(definition).await {
                    tracing::error!(
                        schedule_id = %definition.id,
                        "Failed to restore schedule after dispatch error: {}",
                        restore
                    );
                }
                return Err(err.into());
            }
        };

        tracing::info!(
            schedule_id = %definition.id,
            message_id = %receipt.message_id,
            run_count = next.run_count,
            "Schedule fired"
        );
        if !next.enabled {
            tracing::info!(
                "Schedule {} disabled after {} runs",
                definition.id,
                next.run_count
            );
        }
        self.observability.publish(SymphonyEvent::ScheduleFired {
            schedule_id: definition.id,
            message_id: receipt.message_id,
            run_count: next.run_count,
            next_run_at: next.next_run_at,
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    /// Delete completed envelopes older than the retention window on every
    /// transport. Does nothing when no retention is configured.
    pub async fn purge_completed(&self, now: DateTime<Utc>) -> u64 {
        let Some(retention) = self.completed_retention else {
            return 0;
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = now - retention;

        let mut purged = 0;
        for (name, transport, _) in self.transports.iter() {
            match transport.purge_completed(cutoff).await {
                Ok(count) => {
                    if count > 0 {
                        tracing::info!("Purged {} completed envelopes from {}", count, name);
                    }
                    purged += count;
                }
                Err(err) => tracing::warn!("Failed to purge {}: {}", name, err),
            }
        }
        purged
    }
}
