//! Aggregation queries over envelope and dead-letter history.

use serde::Deserialize;
use symphony_core::{EnvelopeStatus, Statistics, StatisticsBuilder, StatsFilter};

use crate::{DbError, get_db};

/// Repository for statistics queries.
pub struct StatsRepository;

/// One row of any of the GROUP BY queries below.
#[derive(Debug, Default, Deserialize)]
struct GroupRow {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    transport_name: Option<String>,
    count: i64,
    #[serde(default)]
    total: Option<f64>,
}

impl GroupRow {
    fn count(&self) -> u64 {
        self.count.max(0) as u64
    }
}

fn parse_status(status: &str) -> Option<EnvelopeStatus> {
    match status {
        "pending" => Some(EnvelopeStatus::Pending),
        "processing" => Some(EnvelopeStatus::Processing),
        "completed" => Some(EnvelopeStatus::Completed),
        "failed" => Some(EnvelopeStatus::Failed),
        _ => None,
    }
}

/// WHERE clause restricting `time_field` and `transport_name` per the filter.
fn where_clause(filter: &StatsFilter, time_field: &str, extra: Option<&str>) -> String {
    let mut conditions = Vec::new();
    if filter.transport.is_some() {
        conditions.push("transport_name = $transport".to_string());
    }
    if filter.since.is_some() {
        conditions.push(format!("{time_field} >= $since"));
    }
    if filter.until.is_some() {
        conditions.push(format!("{time_field} < $until"));
    }
    if let Some(extra) = extra {
        conditions.push(extra.to_string());
    }

    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}

impl StatsRepository {
    /// Aggregate statistics for the filter.
    pub async fn statistics(filter: &StatsFilter) -> Result<Statistics, DbError> {
        let db = get_db()?;

        let envelopes = where_clause(filter, "created_at", None);
        let completed = where_clause(filter, "created_at", Some(r#"status = "completed""#));
        let dead = where_clause(filter, "failed_at", None);

        let query = format!(
            r#"
            SELECT status, count() AS count FROM envelope {envelopes} GROUP BY status;
            SELECT priority, count() AS count FROM envelope {envelopes} GROUP BY priority;
            SELECT message_type, count() AS count FROM envelope {envelopes} GROUP BY message_type;
            SELECT transport_name, count() AS count FROM envelope {envelopes} GROUP BY transport_name;
            SELECT count() AS count, math::sum(latency_ms) AS total FROM envelope {completed} GROUP ALL;
            SELECT count() AS count FROM dead_letter {dead} GROUP ALL;
            SELECT message_type, count() AS count FROM dead_letter {dead} GROUP BY message_type;
            SELECT transport_name, count() AS count FROM dead_letter {dead} GROUP BY transport_name;
            SELECT priority, count() AS count FROM dead_letter {dead} GROUP BY priority;
            "#
        );

        let mut request = db.query(query);
        if let Some(transport) = &filter.transport {
            request = request.bind(("transport", transport.clone()));
        }
        if let Some(since) = filter.since {
            request = request.bind(("since", since.timestamp_millis()));
        }
        if let Some(until) = filter.until {
            request = request.bind(("until", until.timestamp_millis()));
        }
        let mut response = request.await?;

        let by_status: Vec<GroupRow> = response.take(0)?;
        let by_priority: Vec<GroupRow> = response.take(1)?;
        let by_type: Vec<GroupRow> = response.take(2)?;
        let by_transport: Vec<GroupRow> = response.take(3)?;
        let latency: Vec<GroupRow> = response.take(4)?;
        let dead_total: Vec<GroupRow> = response.take(5)?;
        let dead_by_type: Vec<GroupRow> = response.take(6)?;
        let dead_by_transport: Vec<GroupRow> = response.take(7)?;
        let dead_by_priority: Vec<GroupRow> = response.take(8)?;

        let mut builder = StatisticsBuilder::new();
        for row in &by_status {
            if let Some(status) = row.status.as_deref().and_then(parse_status) {
                builder.add_status(status, row.count());
            }
        }
        for row in by_priority.iter().chain(&dead_by_priority) {
            if let Some(priority) = row.priority {
                builder.add_priority(priority, row.count());
            }
        }
        for row in by_type.iter().chain(&dead_by_type) {
            if let Some(message_type) = &row.message_type {
                builder.add_message_type(message_type, row.count());
            }
        }
        for row in by_transport.iter().chain(&dead_by_transport) {
            if let Some(transport) = &row.transport_name {
                builder.add_transport(transport, row.count());
            }
        }
        if let Some(row) = latency.first() {
            builder.add_latency(row.total.unwrap_or(0.0), row.count());
        }
        if let Some(row) = dead_total.first() {
            builder.add_dead_letters(row.count());
        }

        Ok(builder.build())
    }
}
