//! Circuit snapshots keyed by destination.

use serde::Deserialize;
use symphony_core::{CircuitSnapshot, CircuitState};

use crate::record;
use crate::{DbError, get_db};

/// Repository for circuit breaker state.
pub struct CircuitRepository;

#[derive(Debug, Deserialize)]
struct CircuitRow {
    key: String,
    #[serde(default)]
    state: CircuitState,
    #[serde(default)]
    consecutive_failures: u32,
    #[serde(default)]
    consecutive_successes: u32,
    #[serde(default)]
    opened_at: Option<i64>,
    #[serde(default)]
    trial_started_at: Option<i64>,
    #[serde(default)]
    version: u64,
}

impl CircuitRow {
    fn into_entry(self) -> (String, CircuitSnapshot) {
        let to_time = |ms: i64| chrono::DateTime::from_timestamp_millis(ms);
        let snapshot = CircuitSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            opened_at: self.opened_at.and_then(to_time),
            trial_started_at: self.trial_started_at.and_then(to_time),
            version: self.version,
        };
        (self.key, snapshot)
    }
}

const SELECT_CIRCUIT: &str = "record::id(id) AS key, state, consecutive_failures, \
    consecutive_successes, opened_at, trial_started_at, version";

impl CircuitRepository {
    /// Current snapshot for `key`, if one was ever stored.
    pub async fn load(key: &str) -> Result<Option<CircuitSnapshot>, DbError> {
        let db = get_db()?;
        let mut response = db
            .query(format!(
                "SELECT {SELECT_CIRCUIT} FROM type::thing('circuit', $key);"
            ))
            .bind(("key", key.to_string()))
            .await?;
        let rows: Vec<CircuitRow> = response.take(0)?;
        Ok(rows.into_iter().next().map(|row| row.into_entry().1))
    }

    /// Store `next` if the stored version still equals `expected_version`.
    pub async fn compare_and_swap(
        key: &str,
        expected_version: u64,
        next: &CircuitSnapshot,
    ) -> Result<bool, DbError> {
        let db = get_db()?;
        let content = record::content(next)?;

        if expected_version == 0 {
            let mut response = db
                .query("CREATE type::thing('circuit', $key) CONTENT $content RETURN NONE;")
                .bind(("key", key.to_string()))
                .bind(("content", content))
                .await?;
            return match record::statement_errors(response.take_errors()) {
                None => Ok(true),
                Some(errors) if errors.contains("already exists") => Ok(false),
                Some(errors) if record::is_conflict(&errors) => Ok(false),
                Some(errors) => Err(DbError::Query(errors)),
            };
        }

        let mut response = db
            .query(
                r#"
                UPDATE type::thing('circuit', $key) CONTENT $content
                WHERE version = $expected
                RETURN VALUE version;
                "#,
            )
            .bind(("key", key.to_string()))
            .bind(("content", content))
            .bind(("expected", expected_version as i64))
            .await?;
        match record::statement_errors(response.take_errors()) {
            None => {
                let updated: Vec<i64> = response.take(0)?;
                Ok(!updated.is_empty())
            }
            Some(errors) if record::is_conflict(&errors) => Ok(false),
            Some(errors) => Err(DbError::Query(errors)),
        }
    }

    /// Every stored circuit, by key.
    pub async fn list() -> Result<Vec<(String, CircuitSnapshot)>, DbError> {
        let db = get_db()?;
        let mut response = db
            .query(format!("SELECT {SELECT_CIRCUIT} FROM circuit ORDER BY key ASC;"))
            .await?;
        let rows: Vec<CircuitRow> = response.take(0)?;
        Ok(rows.into_iter().map(CircuitRow::into_entry).collect())
    }
}
