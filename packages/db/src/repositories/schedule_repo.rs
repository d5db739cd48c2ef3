//! Schedule repository: definitions and their conditional advance.

use chrono::{DateTime, Utc};
use symphony_core::{ScheduleDefinition, ScheduleId};

use crate::record::{self, WITH_ID};
use crate::{DbError, get_db};

/// Repository for schedule persistence operations.
pub struct ScheduleRepository;

impl ScheduleRepository {
    /// Store a new schedule definition.
    pub async fn insert(definition: &ScheduleDefinition) -> Result<(), DbError> {
        let db = get_db()?;
        let mut response = db
            .query("CREATE type::thing('schedule', $id) CONTENT $content RETURN NONE;")
            .bind(("id", definition.id.to_string()))
            .bind(("content", record::content(definition)?))
            .await?;

        match record::statement_errors(response.take_errors()) {
            None => Ok(()),
            Some(errors) if errors.contains("already exists") => Err(DbError::Conflict(format!(
                "schedule {} already exists",
                definition.id
            ))),
            Some(errors) => Err(DbError::Query(errors)),
        }
    }

    /// Get a schedule by ID.
    pub async fn get(id: ScheduleId) -> Result<Option<ScheduleDefinition>, DbError> {
        let db = get_db()?;
        let mut response = db
            .query(format!("SELECT {WITH_ID} FROM type::thing('schedule', $id);"))
            .bind(("id", id.to_string()))
            .await?;
        let found: Vec<ScheduleDefinition> = response.take(0)?;
        Ok(found.into_iter().next())
    }

    /// List all schedules, oldest first.
    pub async fn list() -> Result<Vec<ScheduleDefinition>, DbError> {
        let db = get_db()?;
        let mut response = db
            .query(format!("SELECT {WITH_ID} FROM schedule ORDER BY created_at ASC;"))
            .await?;
        Ok(response.take(0)?)
    }

    /// Enabled schedules due at `now`, earliest first.
    pub async fn due(now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduleDefinition>, DbError> {
        let db = get_db()?;
        let mut response = db
            .query(format!(
                r#"
                SELECT {WITH_ID} FROM schedule
                WHERE enabled = true AND next_run_at != NONE AND next_run_at <= $now
                ORDER BY next_run_at ASC
                LIMIT $limit;
                "#
            ))
            .bind(("now", now.timestamp_millis()))
            .bind(("limit", limit as i64))
            .await?;
        Ok(response.take(0)?)
    }

    /// Replace the stored definition if its `next_run_at` is still `expected`.
    pub async fn advance(
        definition: &ScheduleDefinition,
        expected: Option<DateTime<Utc>>,
    ) -> Result<bool, DbError> {
        let db = get_db()?;
        let slot_clause = if expected.is_some() {
            "next_run_at = $expected"
        } else {
            "next_run_at = NONE"
        };
        let mut response = db
            .query(format!(
                r#"
                UPDATE type::thing('schedule', $id) CONTENT $content
                WHERE enabled = true AND {slot_clause}
                RETURN VALUE record::id(id);
                "#
            ))
            .bind(("id", definition.id.to_string()))
            .bind(("content", record::content(definition)?))
            .bind(("expected", expected.map_or(0, |at| at.timestamp_millis())))
            .await?;
        let advanced: Vec<String> = response.take(0)?;
        Ok(!advanced.is_empty())
    }

    /// Overwrite an existing definition.
    pub async fn update(definition: &ScheduleDefinition) -> Result<(), DbError> {
        let db = get_db()?;
        let mut response = db
            .query("UPDATE type::thing('schedule', $id) CONTENT $content RETURN VALUE record::id(id);")
            .bind(("id", definition.id.to_string()))
            .bind(("content", record::content(definition)?))
            .await?;
        let updated: Vec<String> = response.take(0)?;
        if updated.is_empty() {
            return Err(DbError::NotFound(format!("schedule {}", definition.id)));
        }
        Ok(())
    }

    /// Delete a schedule. Returns whether it existed.
    pub async fn delete(id: ScheduleId) -> Result<bool, DbError> {
        let db = get_db()?;
        let mut response = db
            .query(
                r#"
                SELECT VALUE record::id(id) FROM type::thing('schedule', $id);
                DELETE type::thing('schedule', $id);
                "#,
            )
            .bind(("id", id.to_string()))
            .await?;
        let existed: Vec<String> = response.take(0)?;
        Ok(!existed.is_empty())
    }
}
