//! Envelope repository: storage, claiming and settlement of the active backlog.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use symphony_core::envelope::add_duration;
use symphony_core::{Envelope, EnvelopeId, FailedMessage, ReceiveRequest, SendOutcome};

use crate::record::{self, WITH_ID};
use crate::{DbError, get_db};

const CLAIM_ATTEMPTS: usize = 3;

/// Repository for envelope persistence operations.
pub struct EnvelopeRepository;

#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

/// Select due envelopes, lock them, then read them back.
///
/// The UPDATE re-checks claimability, so of two workers racing for the same
/// candidate only one sees it in `$claimed`.
const CLAIM_QUERY: &str = r#"
LET $candidates = (
    SELECT id, priority, available_at FROM envelope
    WHERE transport_name = $transport
        AND queue_name = $queue
        AND ((status = "pending" AND available_at <= $now) OR status = "processing")
        AND (lock_expires_at = NONE OR lock_expires_at <= $now)
    ORDER BY priority DESC, available_at ASC
    LIMIT $limit
);
LET $claimed = (
    UPDATE $candidates.id SET
        status = "processing",
        locked_by = $worker,
        lock_expires_at = $lock_until,
        delivery_count += 1,
        updated_at = $now
    WHERE ((status = "pending" AND available_at <= $now) OR status = "processing")
        AND (lock_expires_at = NONE OR lock_expires_at <= $now)
    RETURN VALUE id
);
SELECT *, record::id(id) AS id FROM $claimed ORDER BY priority DESC, available_at ASC;
"#;

const OWNED: &str = r#"status = "processing" AND locked_by = $worker"#;

fn owner(envelope: &Envelope) -> String {
    envelope.locked_by.clone().unwrap_or_default()
}

fn idempotency_slot(envelope: &Envelope) -> Option<Value> {
    envelope.idempotency_key.as_ref().map(|key| {
        Value::from(vec![
            envelope.transport_name.clone(),
            envelope.queue_name.clone(),
            key.clone(),
        ])
    })
}

/// Envelope document with the denormalized `message_type` used for grouping.
fn envelope_content(envelope: &Envelope) -> Result<serde_json::Map<String, Value>, DbError> {
    let mut content = record::content(envelope)?;
    content.insert(
        "message_type".into(),
        Value::from(envelope.message_type().to_string()),
    );
    Ok(content)
}

impl EnvelopeRepository {
    /// Store a new envelope, honoring its idempotency key.
    pub async fn create(envelope: &Envelope) -> Result<SendOutcome, DbError> {
        let db = get_db()?;
        let content = envelope_content(envelope)?;

        let Some(slot) = idempotency_slot(envelope) else {
            db.query("CREATE type::thing('envelope', $id) CONTENT $content RETURN NONE;")
                .bind(("id", envelope.id.to_string()))
                .bind(("content", content))
                .await?
                .check()?;
            return Ok(SendOutcome::Created(envelope.id));
        };

        // A lost reservation race is retried once: the second pass sees the winner.
        for _ in 0..2 {
            if let Some(holder) = Self::live_holder(&slot).await? {
                return Ok(SendOutcome::Duplicate(holder));
            }

            let mut response = db
                .query(
                    r#"
                    BEGIN TRANSACTION;
                    CREATE type::thing('idempotency', $slot) CONTENT { envelope_id: $id } RETURN NONE;
                    CREATE type::thing('envelope', $id) CONTENT $content RETURN NONE;
                    COMMIT TRANSACTION;
                    "#,
                )
                .bind(("slot", slot.clone()))
                .bind(("id", envelope.id.to_string()))
                .bind(("content", content.clone()))
                .await?;

            match record::statement_errors(response.take_errors()) {
                None => return Ok(SendOutcome::Created(envelope.id)),
                Some(errors) => {
                    tracing::debug!(envelope_id = %envelope.id, %errors, "Idempotency reservation failed");
                }
            }
        }

        Err(DbError::Conflict(format!(
            "could not reserve idempotency key for envelope {}",
            envelope.id
        )))
    }

    /// The non-terminal envelope holding an idempotency slot.
    ///
    /// Reservations left behind by settled or vanished envelopes are removed.
    async fn live_holder(slot: &Value) -> Result<Option<EnvelopeId>, DbError> {
        let db = get_db()?;
        let mut response = db
            .query("SELECT VALUE envelope_id FROM type::thing('idempotency', $slot);")
            .bind(("slot", slot.clone()))
            .await?;
        let holders: Vec<String> = response.take(0)?;
        let Some(holder) = holders.into_iter().next() else {
            return Ok(None);
        };

        let mut response = db
            .query("SELECT VALUE status FROM type::thing('envelope', $id);")
            .bind(("id", holder.clone()))
            .await?;
        let statuses: Vec<String> = response.take(0)?;
        let live = statuses
            .first()
            .is_some_and(|status| status == "pending" || status == "processing");

        if live {
            let id = EnvelopeId::parse(&holder)
                .map_err(|err| DbError::Serialization(format!("bad envelope id {holder}: {err}")))?;
            return Ok(Some(id));
        }

        db.query("DELETE type::thing('idempotency', $slot) WHERE envelope_id = $holder;")
            .bind(("slot", slot.clone()))
            .bind(("holder", holder))
            .await?
            .check()?;
        Ok(None)
    }

    /// Atomically claim due envelopes for `request.worker_id`.
    pub async fn claim(
        transport: &str,
        request: &ReceiveRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<Envelope>, DbError> {
        let db = get_db()?;
        let lock_until = add_duration(now, request.lock_duration).timestamp_millis();

        for attempt in 1..=CLAIM_ATTEMPTS {
            let mut response = db
                .query(CLAIM_QUERY)
                .bind(("transport", transport.to_string()))
                .bind(("queue", request.queue.clone()))
                .bind(("worker", request.worker_id.clone()))
                .bind(("now", now.timestamp_millis()))
                .bind(("lock_until", lock_until))
                .bind(("limit", request.batch_size as i64))
                .await?;

            match record::statement_errors(response.take_errors()) {
                None => return Ok(response.take(2)?),
                Some(errors) if attempt < CLAIM_ATTEMPTS && record::is_conflict(&errors) => {
                    tracing::debug!(queue = %request.queue, attempt, "Claim conflicted, retrying");
                }
                Some(errors) => return Err(DbError::Query(errors)),
            }
        }

        Ok(Vec::new())
    }

    /// Get an envelope by ID if `transport` owns it.
    pub async fn get(transport: &str, id: EnvelopeId) -> Result<Option<Envelope>, DbError> {
        let db = get_db()?;
        let mut response = db
            .query(format!(
                "SELECT {WITH_ID} FROM type::thing('envelope', $id) WHERE transport_name = $transport;"
            ))
            .bind(("transport", transport.to_string()))
            .bind(("id", id.to_string()))
            .await?;
        let envelopes: Vec<Envelope> = response.take(0)?;
        Ok(envelopes.into_iter().next())
    }

    /// Mark a claimed envelope completed and release its idempotency slot in
    /// one transaction.
    pub async fn acknowledge(envelope: &Envelope, now: DateTime<Utc>) -> Result<(), DbError> {
        let db = get_db()?;
        let release_slot = if idempotency_slot(envelope).is_some() {
            "DELETE type::thing('idempotency', $slot) WHERE envelope_id = $id;"
        } else {
            ""
        };

        let mut response = db
            .query(format!(
                r#"
                BEGIN TRANSACTION;
                LET $done = (UPDATE type::thing('envelope', $id) SET
                    status = "completed",
                    processed_at = $now,
                    updated_at = $now,
                    latency_ms = $now - created_at,
                    locked_by = NONE,
                    lock_expires_at = NONE
                WHERE {OWNED}
                RETURN VALUE status);
                IF array::len($done) = 0 {{ THROW "lock_lost"; }};
                {release_slot}
                COMMIT TRANSACTION;
                "#
            ))
            .bind(("id", envelope.id.to_string()))
            .bind(("worker", owner(envelope)))
            .bind(("now", now.timestamp_millis()))
            .bind(("slot", idempotency_slot(envelope).unwrap_or(Value::Null)))
            .await?;

        match record::statement_errors(response.take_errors()) {
            None => Ok(()),
            Some(errors) if errors.contains("lock_lost") => Err(DbError::LockLost(envelope.id)),
            Some(errors) => Err(DbError::Query(errors)),
        }
    }

    /// Overwrite a claimed envelope with its rescheduled state.
    ///
    /// `worker` is the claim owner; `rescheduled` has already dropped its lock.
    pub async fn reschedule(rescheduled: &Envelope, worker: &str) -> Result<(), DbError> {
        let db = get_db()?;
        let mut response = db
            .query(format!(
                "UPDATE type::thing('envelope', $id) CONTENT $content WHERE {OWNED} RETURN VALUE status;"
            ))
            .bind(("id", rescheduled.id.to_string()))
            .bind(("content", envelope_content(rescheduled)?))
            .bind(("worker", worker.to_string()))
            .await?;
        let updated: Vec<String> = response.take(0)?;
        if updated.is_empty() {
            return Err(DbError::LockLost(rescheduled.id));
        }
        Ok(())
    }

    /// Return a claimed envelope to pending without touching its retry budget.
    pub async fn release(
        envelope: &Envelope,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let db = get_db()?;
        let mut response = db
            .query(format!(
                r#"
                UPDATE type::thing('envelope', $id) SET
                    status = "pending",
                    available_at = $available_at,
                    delivery_count = math::max([delivery_count - 1, 0]),
                    updated_at = $now,
                    locked_by = NONE,
                    lock_expires_at = NONE
                WHERE {OWNED}
                RETURN VALUE status;
                "#
            ))
            .bind(("id", envelope.id.to_string()))
            .bind(("worker", owner(envelope)))
            .bind(("available_at", available_at.timestamp_millis()))
            .bind(("now", now.timestamp_millis()))
            .await?;
        let updated: Vec<String> = response.take(0)?;
        if updated.is_empty() {
            return Err(DbError::LockLost(envelope.id));
        }
        Ok(())
    }

    /// Push the lock expiry of a claimed envelope.
    pub async fn extend_lock(
        envelope: &Envelope,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let db = get_db()?;
        let mut response = db
            .query(format!(
                "UPDATE type::thing('envelope', $id) SET lock_expires_at = $until, updated_at = $now WHERE {OWNED} RETURN VALUE status;"
            ))
            .bind(("id", envelope.id.to_string()))
            .bind(("worker", owner(envelope)))
            .bind(("until", lock_until.timestamp_millis()))
            .bind(("now", now.timestamp_millis()))
            .await?;
        let updated: Vec<String> = response.take(0)?;
        if updated.is_empty() {
            return Err(DbError::LockLost(envelope.id));
        }
        Ok(())
    }

    /// Move a claimed envelope to the dead-letter table in one transaction.
    ///
    /// `worker` is the claim owner; `failed` is the dead-letter copy to store.
    pub async fn dead_letter(
        envelope: &Envelope,
        failed: &FailedMessage,
        worker: &str,
    ) -> Result<(), DbError> {
        let db = get_db()?;
        let mut failed_content = record::content(failed)?;
        failed_content.insert(
            "message_type".into(),
            Value::from(failed.body.message_type.clone()),
        );
        failed_content.insert("priority".into(), Value::from(envelope.priority.value()));

        let release_slot = if idempotency_slot(envelope).is_some() {
            "DELETE type::thing('idempotency', $slot) WHERE envelope_id = $id;"
        } else {
            ""
        };

        let mut response = db
            .query(format!(
                r#"
                BEGIN TRANSACTION;
                LET $gone = (DELETE type::thing('envelope', $id) WHERE {OWNED} RETURN BEFORE);
                IF array::len($gone) = 0 {{ THROW "lock_lost"; }};
                CREATE type::thing('dead_letter', $failed_id) CONTENT $failed RETURN NONE;
                {release_slot}
                COMMIT TRANSACTION;
                "#
            ))
            .bind(("id", envelope.id.to_string()))
            .bind(("worker", worker.to_string()))
            .bind(("failed_id", failed.id.to_string()))
            .bind(("failed", failed_content))
            .bind(("slot", idempotency_slot(envelope).unwrap_or(Value::Null)))
            .await?;

        match record::statement_errors(response.take_errors()) {
            None => Ok(()),
            Some(errors) if errors.contains("lock_lost") => Err(DbError::LockLost(envelope.id)),
            Some(errors) => Err(DbError::Query(errors)),
        }
    }

    /// Store a fresh envelope replacing a dead letter, in one transaction.
    pub async fn replace_dead_letter(
        failed: &FailedMessage,
        envelope: &Envelope,
    ) -> Result<(), DbError> {
        let db = get_db()?;
        let slot = idempotency_slot(envelope);
        if let Some(slot) = &slot
            && let Some(holder) = Self::live_holder(slot).await?
        {
            return Err(DbError::Conflict(format!(
                "idempotency key is held by live envelope {holder}"
            )));
        }

        let reserve = if slot.is_some() {
            "CREATE type::thing('idempotency', $slot) CONTENT { envelope_id: $id } RETURN NONE;"
        } else {
            ""
        };

        let mut response = db
            .query(format!(
                r#"
                BEGIN TRANSACTION;
                LET $gone = (DELETE type::thing('dead_letter', $failed_id)
                    WHERE transport_name = $transport RETURN BEFORE);
                IF array::len($gone) = 0 {{ THROW "not_found"; }};
                {reserve}
                CREATE type::thing('envelope', $id) CONTENT $content RETURN NONE;
                COMMIT TRANSACTION;
                "#
            ))
            .bind(("failed_id", failed.id.to_string()))
            .bind(("transport", failed.transport_name.clone()))
            .bind(("id", envelope.id.to_string()))
            .bind(("content", envelope_content(envelope)?))
            .bind(("slot", slot.unwrap_or(Value::Null)))
            .await?;

        match record::statement_errors(response.take_errors()) {
            None => Ok(()),
            Some(errors) if errors.contains("not_found") => {
                Err(DbError::NotFound(format!("dead letter {}", failed.id)))
            }
            Some(errors) if errors.contains("already exists") => Err(DbError::Conflict(errors)),
            Some(errors) => Err(DbError::Query(errors)),
        }
    }

    /// Pending plus processing envelopes.
    pub async fn depth(transport: &str, queue: Option<&str>) -> Result<u64, DbError> {
        let db = get_db()?;
        let queue_clause = if queue.is_some() {
            "AND queue_name = $queue"
        } else {
            ""
        };
        let mut response = db
            .query(format!(
                r#"
                SELECT count() AS count FROM envelope
                WHERE transport_name = $transport
                    AND (status = "pending" OR status = "processing")
                    {queue_clause}
                GROUP ALL;
                "#
            ))
            .bind(("transport", transport.to_string()))
            .bind(("queue", queue.unwrap_or_default().to_string()))
            .await?;
        let rows: Vec<CountRow> = response.take(0)?;
        Ok(rows.first().map_or(0, |row| row.count.max(0) as u64))
    }

    /// Delete completed envelopes processed before `older_than`.
    pub async fn purge_completed(transport: &str, older_than: DateTime<Utc>) -> Result<u64, DbError> {
        let db = get_db()?;
        let mut response = db
            .query(
                r#"
                SELECT count() AS count FROM envelope
                WHERE transport_name = $transport AND status = "completed" AND processed_at < $before
                GROUP ALL;
                DELETE envelope
                WHERE transport_name = $transport AND status = "completed" AND processed_at < $before;
                "#,
            )
            .bind(("transport", transport.to_string()))
            .bind(("before", older_than.timestamp_millis()))
            .await?;
        if let Some(errors) = record::statement_errors(response.take_errors()) {
            return Err(DbError::Query(errors));
        }
        let rows: Vec<CountRow> = response.take(0)?;
        Ok(rows.first().map_or(0, |row| row.count.max(0) as u64))
    }
}
