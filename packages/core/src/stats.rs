//! Aggregate statistics over envelope and dead-letter history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, EnvelopeStatus};
use crate::failed::FailedMessage;

/// Restricts statistics to one transport and/or a time window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsFilter {
    #[serde(default)]
    pub transport: Option<String>,
    /// Inclusive lower bound on creation (envelopes) or failure (dead letters) time.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub until: Option<DateTime<Utc>>,
}

impl StatsFilter {
    pub fn for_transport(transport: impl Into<String>) -> Self {
        Self {
            transport: Some(transport.into()),
            ..Default::default()
        }
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    fn in_window(&self, at: DateTime<Utc>) -> bool {
        self.since.is_none_or(|since| at >= since) && self.until.is_none_or(|until| at < until)
    }

    fn transport_matches(&self, transport: &str) -> bool {
        self.transport.as_deref().is_none_or(|wanted| wanted == transport)
    }

    pub fn matches_envelope(&self, envelope: &Envelope) -> bool {
        self.transport_matches(&envelope.transport_name) && self.in_window(envelope.created_at)
    }

    pub fn matches_failed(&self, failed: &FailedMessage) -> bool {
        self.transport_matches(&failed.transport_name) && self.in_window(failed.failed_at)
    }
}

/// Queue health snapshot for the admin surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Counts by status. `failed` counts dead letters.
    pub status_counts: BTreeMap<String, u64>,
    pub priority_histogram: BTreeMap<u8, u64>,
    pub by_message_type: BTreeMap<String, u64>,
    pub by_transport: BTreeMap<String, u64>,
    pub dead_letter_count: u64,
    /// Envelopes still waiting or in flight.
    pub queue_depth: u64,
    /// `completed / (completed + dead-lettered)`; `None` before anything settled.
    pub success_rate: Option<f64>,
    /// Mean time from creation to acknowledgement, over completed envelopes.
    pub average_processing_ms: Option<f64>,
}

impl Statistics {
    pub fn count(&self, status: EnvelopeStatus) -> u64 {
        self.status_counts.get(status.as_str()).copied().unwrap_or(0)
    }
}

/// Accumulates grouped counts from any backend.
#[derive(Debug, Default)]
pub struct StatisticsBuilder {
    stats: Statistics,
    latency_total_ms: f64,
    latency_samples: u64,
}

impl StatisticsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_status(&mut self, status: EnvelopeStatus, count: u64) -> &mut Self {
        *self
            .stats
            .status_counts
            .entry(status.as_str().to_string())
            .or_default() += count;
        self
    }

    pub fn add_priority(&mut self, priority: u8, count: u64) -> &mut Self {
        *self.stats.priority_histogram.entry(priority).or_default() += count;
        self
    }

    pub fn add_message_type(&mut self, message_type: &str, count: u64) -> &mut Self {
        *self
            .stats
            .by_message_type
            .entry(message_type.to_string())
            .or_default() += count;
        self
    }

    pub fn add_transport(&mut self, transport: &str, count: u64) -> &mut Self {
        *self
            .stats
            .by_transport
            .entry(transport.to_string())
            .or_default() += count;
        self
    }

    pub fn add_dead_letters(&mut self, count: u64) -> &mut Self {
        self.stats.dead_letter_count += count;
        self
    }

    /// Fold in `samples` completed envelopes whose latencies sum to `total_ms`.
    pub fn add_latency(&mut self, total_ms: f64, samples: u64) -> &mut Self {
        self.latency_total_ms += total_ms;
        self.latency_samples += samples;
        self
    }

    /// Count one active or completed envelope in every dimension.
    pub fn add_envelope(&mut self, envelope: &Envelope) -> &mut Self {
        self.add_status(envelope.status, 1)
            .add_priority(envelope.priority.value(), 1)
            .add_message_type(envelope.message_type(), 1)
            .add_transport(&envelope.transport_name, 1);
        if envelope.status == EnvelopeStatus::Completed
            && let Some(processed_at) = envelope.processed_at
        {
            let latency = (processed_at - envelope.created_at).num_milliseconds().max(0);
            self.add_latency(latency as f64, 1);
        }
        self
    }

    /// Count one dead letter in every dimension.
    pub fn add_failed(&mut self, failed: &FailedMessage) -> &mut Self {
        let priority = failed
            .metadata
            .get("priority")
            .and_then(serde_json::Value::as_u64)
            .and_then(|p| u8::try_from(p).ok());
        self.add_dead_letters(1)
            .add_message_type(&failed.body.message_type, 1)
            .add_transport(&failed.transport_name, 1);
        if let Some(priority) = priority {
            self.add_priority(priority, 1);
        }
        self
    }

    pub fn build(mut self) -> Statistics {
        let dead = self.stats.dead_letter_count;
        if dead > 0 {
            *self
                .stats
                .status_counts
                .entry(EnvelopeStatus::Failed.as_str().to_string())
                .or_default() += dead;
        }

        let completed = self.stats.count(EnvelopeStatus::Completed);
        self.stats.queue_depth = self.stats.count(EnvelopeStatus::Pending)
            + self.stats.count(EnvelopeStatus::Processing);

        let settled = completed + dead;
        self.stats.success_rate = (settled > 0).then(|| completed as f64 / settled as f64);
        self.stats.average_processing_ms = (self.latency_samples > 0)
            .then(|| self.latency_total_ms / self.latency_samples as f64);
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use serde_json::json;

    #[test]
    fn success_rate_and_latency() {
        let created = Utc::now();
        let mut builder = StatisticsBuilder::new();
        for latency in [100, 300] {
            let mut env = Envelope::new(Message::new("email.send", json!({})).unwrap(), "db", "q");
            env.created_at = created;
            env.complete(created + chrono::Duration::milliseconds(latency));
            builder.add_envelope(&env);
        }
        let pending = Envelope::new(Message::new("calendar.sync", json!({})).unwrap(), "db", "q");
        builder.add_envelope(&pending);
        builder.add_dead_letters(2);

        let stats = builder.build();
        assert_eq!(stats.count(EnvelopeStatus::Completed), 2);
        assert_eq!(stats.count(EnvelopeStatus::Failed), 2);
        assert_eq!(stats.queue_depth, 1);
        assert_eq!(stats.success_rate, Some(0.5));
        assert_eq!(stats.average_processing_ms, Some(200.0));
        assert_eq!(stats.by_message_type["email.send"], 2);
        assert_eq!(stats.priority_histogram[&5], 3);
    }

    #[test]
    fn empty_history_has_no_rates() {
        let stats = StatisticsBuilder::new().build();
        assert_eq!(stats.success_rate, None);
        assert_eq!(stats.average_processing_ms, None);
    }
}
