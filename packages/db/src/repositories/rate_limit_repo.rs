//! Rate-limit window storage shared between processes.
//!
//! Each limiter key owns one `rate_limiter` row holding its live buckets and
//! a version. A check reads the row, evaluates the rules locally and writes
//! back only if the version is unchanged, retrying on a lost race.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use symphony_core::rate_limit::evaluate;
use symphony_core::{LimiterKey, RateIncrement, RateLimitDecision, RateLimitRule, WindowEntry};

use crate::record;
use crate::{DbError, get_db};

const CAS_ATTEMPTS: usize = 16;

/// Repository for limiter window rows.
pub struct RateLimitRepository;

#[derive(Debug, Deserialize)]
struct WindowRow {
    #[serde(default)]
    entries: Vec<WindowEntry>,
    version: i64,
}

fn row_key(key: &LimiterKey) -> Value {
    Value::from(vec![
        key.limiter_type.as_str().to_string(),
        key.identifier.clone(),
    ])
}

impl RateLimitRepository {
    async fn load(key: &LimiterKey) -> Result<Option<WindowRow>, DbError> {
        let db = get_db()?;
        let mut response = db
            .query("SELECT entries, version FROM type::thing('rate_limiter', $key);")
            .bind(("key", row_key(key)))
            .await?;
        let rows: Vec<WindowRow> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    /// Write `entries` if the row is still at `version` (or absent when `None`).
    async fn store(
        key: &LimiterKey,
        version: Option<i64>,
        entries: &[WindowEntry],
    ) -> Result<bool, DbError> {
        let db = get_db()?;
        let entries = serde_json::to_value(entries)?;

        let Some(version) = version else {
            let mut response = db
                .query(
                    "CREATE type::thing('rate_limiter', $key) CONTENT { entries: $entries, version: 1 } RETURN NONE;",
                )
                .bind(("key", row_key(key)))
                .bind(("entries", entries))
                .await?;
            return match record::statement_errors(response.take_errors()) {
                None => Ok(true),
                Some(errors) if errors.contains("already exists") => Ok(false),
                Some(errors) if record::is_conflict(&errors) => Ok(false),
                Some(errors) => Err(DbError::Query(errors)),
            };
        };

        let mut response = db
            .query(
                r#"
                UPDATE type::thing('rate_limiter', $key)
                SET entries = $entries, version = $version + 1
                WHERE version = $version
                RETURN VALUE version;
                "#,
            )
            .bind(("key", row_key(key)))
            .bind(("entries", entries))
            .bind(("version", version))
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

    /// Evaluate `rules` for `key` and record the increment when allowed.
    pub async fn check_and_increment(
        key: &LimiterKey,
        increment: RateIncrement,
        rules: &[RateLimitRule],
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, DbError> {
        let now_ms = now.timestamp_millis();

        for attempt in 1..=CAS_ATTEMPTS {
            let row = Self::load(key).await?;
            let version = row.as_ref().map(|row| row.version);
            let mut entries = row.map(|row| row.entries).unwrap_or_default();
            entries.retain(|entry| entry.is_live(now_ms));

            let evaluation = evaluate(rules, &entries, increment, now);
            if !evaluation.decision.allowed {
                return Ok(evaluation.decision);
            }

            for update in evaluation.updates {
                match entries.iter_mut().find(|entry| {
                    entry.duration_ms == update.duration_ms
                        && entry.precision_ms == update.precision_ms
                        && entry.window_start == update.window_start
                }) {
                    Some(existing) => *existing = update,
                    None => entries.push(update),
                }
            }

            if Self::store(key, version, &entries).await? {
                return Ok(evaluation.decision);
            }
            tracing::debug!(%key, attempt, "Rate limiter update raced, retrying");
        }

        Err(DbError::Conflict(format!(
            "rate limiter {key} kept changing under contention"
        )))
    }
}
