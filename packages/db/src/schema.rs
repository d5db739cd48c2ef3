//! Database schema definitions using SurrealQL.
//!
//! Timestamps are stored as epoch milliseconds. Optional fields are omitted
//! rather than stored as NULL, so queries test them against NONE.

use crate::{DbError, get_db};

/// Initialize the database schema.
///
/// This creates all necessary tables, fields, and indexes.
pub async fn init_schema() -> Result<(), DbError> {
    let db = get_db()?;

    tracing::info!("Initializing database schema...");

    db.query(ENVELOPE_SCHEMA).await?.check()?;
    db.query(DEAD_LETTER_SCHEMA).await?.check()?;
    db.query(SCHEDULE_SCHEMA).await?.check()?;
    db.query(STATE_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Active backlog.
const ENVELOPE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS envelope SCHEMALESS;

DEFINE FIELD IF NOT EXISTS transport_name ON envelope TYPE string;
DEFINE FIELD IF NOT EXISTS queue_name ON envelope TYPE string;
DEFINE FIELD IF NOT EXISTS message_type ON envelope TYPE string;
DEFINE FIELD IF NOT EXISTS status ON envelope TYPE string
    ASSERT $value IN ["pending", "processing", "completed", "failed"];
DEFINE FIELD IF NOT EXISTS priority ON envelope TYPE int ASSERT $value >= 1 AND $value <= 10;
DEFINE FIELD IF NOT EXISTS available_at ON envelope TYPE int;
DEFINE FIELD IF NOT EXISTS retry_count ON envelope TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS max_retries ON envelope TYPE int DEFAULT 3;
DEFINE FIELD IF NOT EXISTS delivery_count ON envelope TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS created_at ON envelope TYPE int;
DEFINE FIELD IF NOT EXISTS updated_at ON envelope TYPE int;

-- Claim path: due envelopes of one queue by priority
DEFINE INDEX IF NOT EXISTS envelope_claim ON envelope FIELDS transport_name, queue_name, status, priority;
DEFINE INDEX IF NOT EXISTS envelope_status ON envelope FIELDS status;
DEFINE INDEX IF NOT EXISTS envelope_created ON envelope FIELDS created_at;

-- Idempotency reservations keyed by [transport, queue, key]
DEFINE TABLE IF NOT EXISTS idempotency SCHEMALESS;
DEFINE FIELD IF NOT EXISTS envelope_id ON idempotency TYPE string;
"#;

/// Dead letters.
const DEAD_LETTER_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS dead_letter SCHEMALESS;

DEFINE FIELD IF NOT EXISTS original_message_id ON dead_letter TYPE string;
DEFINE FIELD IF NOT EXISTS transport_name ON dead_letter TYPE string;
DEFINE FIELD IF NOT EXISTS queue_name ON dead_letter TYPE string;
DEFINE FIELD IF NOT EXISTS message_type ON dead_letter TYPE string;
DEFINE FIELD IF NOT EXISTS failed_at ON dead_letter TYPE int;

DEFINE INDEX IF NOT EXISTS dead_letter_failed ON dead_letter FIELDS failed_at;
DEFINE INDEX IF NOT EXISTS dead_letter_transport ON dead_letter FIELDS transport_name;
"#;

/// Schedule definitions.
const SCHEDULE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS schedule SCHEMALESS;

DEFINE FIELD IF NOT EXISTS message_type ON schedule TYPE string;
DEFINE FIELD IF NOT EXISTS enabled ON schedule TYPE bool DEFAULT true;
DEFINE FIELD IF NOT EXISTS run_count ON schedule TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS created_at ON schedule TYPE int;

DEFINE INDEX IF NOT EXISTS schedule_due ON schedule FIELDS enabled, next_run_at;
"#;

/// Shared limiter and breaker state.
const STATE_SCHEMA: &str = r#"
-- One row per limiter key holding its window buckets
DEFINE TABLE IF NOT EXISTS rate_limiter SCHEMALESS;
DEFINE FIELD IF NOT EXISTS version ON rate_limiter TYPE int DEFAULT 0;

-- One row per destination
DEFINE TABLE IF NOT EXISTS circuit SCHEMALESS;
DEFINE FIELD IF NOT EXISTS state ON circuit TYPE string;
DEFINE FIELD IF NOT EXISTS version ON circuit TYPE int DEFAULT 0;
"#;
