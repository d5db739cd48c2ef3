//! Lifecycle events and metrics.
//!
//! An [`Observability`] value is built once per process and cloned into the
//! dispatcher, workers and scheduler. Publishing never fails the caller.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use symphony_core::SymphonyEvent;
use tokio::sync::broadcast;

pub const SEND_DURATION: &str = "email_send_duration";
pub const SEND_SUCCESS: &str = "email_send_success";
pub const SEND_FAILURE: &str = "email_send_failure";

/// Counter and timer sink.
pub trait MetricsSink: Send + Sync + 'static {
    fn increment(&self, name: &str, tags: &[(&str, &str)]);

    fn timing(&self, name: &str, duration: Duration, tags: &[(&str, &str)]);

    fn flush(&self) {}
}

/// Emits metrics as `tracing` events on the `symphony::metrics` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn increment(&self, name: &str, tags: &[(&str, &str)]) {
        tracing::debug!(target: "symphony::metrics", metric = name, tags = ?tags, "counter");
    }

    fn timing(&self, name: &str, duration: Duration, tags: &[(&str, &str)]) {
        tracing::debug!(
            target: "symphony::metrics",
            metric = name,
            duration_ms = duration.as_millis() as u64,
            tags = ?tags,
            "timing"
        );
    }
}

/// Records metrics in memory, keyed by `name{tag=value,...}`.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<BTreeMap<String, u64>>,
    timings: Mutex<BTreeMap<String, Vec<Duration>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str, tags: &[(&str, &str)]) -> String {
        if tags.is_empty() {
            return name.to_string();
        }
        let tags: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{name}{{{}}}", tags.join(","))
    }

    pub fn counter(&self, name: &str, tags: &[(&str, &str)]) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.get(&Self::key(name, tags)).copied().unwrap_or(0)
    }

    pub fn timings(&self, name: &str, tags: &[(&str, &str)]) -> Vec<Duration> {
        let timings = self.timings.lock().unwrap_or_else(PoisonError::into_inner);
        timings.get(&Self::key(name, tags)).cloned().unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, tags: &[(&str, &str)]) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        *counters.entry(Self::key(name, tags)).or_default() += 1;
    }

    fn timing(&self, name: &str, duration: Duration, tags: &[(&str, &str)]) {
        let mut timings = self.timings.lock().unwrap_or_else(PoisonError::into_inner);
        timings.entry(Self::key(name, tags)).or_default().push(duration);
    }
}

/// Event bus plus metrics sink.
#[derive(Clone)]
pub struct Observability {
    events: broadcast::Sender<SymphonyEvent>,
    metrics: Arc<dyn MetricsSink>,
}

impl Observability {
    pub fn new(capacity: usize, metrics: Arc<dyn MetricsSink>) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self { events, metrics }
    }

    /// Tracing-backed metrics and a 1024-event channel.
    pub fn tracing() -> Self {
        Self::new(1_024, Arc::new(TracingMetricsSink))
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SymphonyEvent) {
        tracing::trace!(event = event.name(), "{}", event.description());
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SymphonyEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &dyn MetricsSink {
        self.metrics.as_ref()
    }

    pub fn increment(&self, name: &str, tags: &[(&str, &str)]) {
        self.metrics.increment(name, tags);
    }

    pub fn timing(&self, name: &str, duration: Duration, tags: &[(&str, &str)]) {
        self.metrics.timing(name, duration, tags);
    }

    pub fn flush(&self) {
        self.metrics.flush();
    }
}

impl Default for Observability {
    fn default() -> Self {
        Self::tracing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use symphony_core::FailedMessageId;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let observability = Observability::tracing();
        observability.publish(SymphonyEvent::DeadLetterDeleted {
            failed_id: FailedMessageId::new(),
            timestamp: Utc::now(),
        });
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let observability = Observability::tracing();
        let mut events = observability.subscribe();
        let failed_id = FailedMessageId::new();
        observability.publish(SymphonyEvent::DeadLetterDeleted {
            failed_id,
            timestamp: Utc::now(),
        });
        let event = events.recv().await.unwrap();
        assert!(matches!(event, SymphonyEvent::DeadLetterDeleted { failed_id: id, .. } if id == failed_id));
    }

    #[test]
    fn in_memory_metrics_key_by_tags() {
        let metrics = InMemoryMetrics::new();
        metrics.increment(SEND_SUCCESS, &[("message_type", "email.send")]);
        metrics.increment(SEND_SUCCESS, &[("message_type", "email.send")]);
        metrics.increment(SEND_SUCCESS, &[("message_type", "sms.send")]);
        metrics.timing(SEND_DURATION, Duration::from_millis(12), &[]);

        assert_eq!(metrics.counter(SEND_SUCCESS, &[("message_type", "email.send")]), 2);
        assert_eq!(metrics.counter(SEND_SUCCESS, &[("message_type", "sms.send")]), 1);
        assert_eq!(metrics.counter(SEND_FAILURE, &[]), 0);
        assert_eq!(metrics.timings(SEND_DURATION, &[]), vec![Duration::from_millis(12)]);
    }
}
