//! Dead-letter repository: listing, lookup and deletion.

use serde::Deserialize;
use symphony_core::{FailedMessage, FailedMessageId, Page};

use crate::record::WITH_ID;
use crate::{DbError, get_db};

/// Repository for dead-letter persistence operations.
pub struct DeadLetterRepository;

#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

impl DeadLetterRepository {
    /// List a transport's dead letters, most recent first.
    pub async fn list(
        transport: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Page<FailedMessage>, DbError> {
        let db = get_db()?;
        let mut response = db
            .query(format!(
                r#"
                SELECT {WITH_ID} FROM dead_letter
                WHERE transport_name = $transport
                ORDER BY failed_at DESC LIMIT $limit START $offset;
                SELECT count() AS count FROM dead_letter
                WHERE transport_name = $transport
                GROUP ALL;
                "#
            ))
            .bind(("transport", transport.to_string()))
            .bind(("limit", limit as i64))
            .bind(("offset", offset as i64))
            .await?;

        let items: Vec<FailedMessage> = response.take(0)?;
        let totals: Vec<CountRow> = response.take(1)?;

        Ok(Page {
            items,
            total: totals.first().map_or(0, |row| row.count.max(0) as u64),
            limit,
            offset,
        })
    }

    /// Get a dead letter by ID if `transport` owns it.
    pub async fn get(
        transport: &str,
        id: FailedMessageId,
    ) -> Result<Option<FailedMessage>, DbError> {
        let db = get_db()?;
        let mut response = db
            .query(format!(
                "SELECT {WITH_ID} FROM type::thing('dead_letter', $id) WHERE transport_name = $transport;"
            ))
            .bind(("transport", transport.to_string()))
            .bind(("id", id.to_string()))
            .await?;
        let found: Vec<FailedMessage> = response.take(0)?;
        Ok(found.into_iter().next())
    }

    /// Delete a dead letter owned by `transport`. Returns whether it existed.
    pub async fn delete(transport: &str, id: FailedMessageId) -> Result<bool, DbError> {
        let db = get_db()?;
        let mut response = db
            .query(
                r#"
                SELECT VALUE record::id(id) FROM type::thing('dead_letter', $id)
                WHERE transport_name = $transport;
                DELETE type::thing('dead_letter', $id) WHERE transport_name = $transport;
                "#,
            )
            .bind(("transport", transport.to_string()))
            .bind(("id", id.to_string()))
            .await?;
        let existed: Vec<String> = response.take(0)?;
        Ok(!existed.is_empty())
    }
}
