//! In-process transport for tests and single-node deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{
    AdminStore, Disposition, ReceiveRequest, RejectOutcome, Rejection, SendOutcome, Transport,
    TransportError,
};
use crate::BoxFuture;
use crate::envelope::{Envelope, EnvelopeId, EnvelopeStatus, add_duration};
use crate::failed::{FailedMessage, FailedMessageId, Page};
use crate::stats::{Statistics, StatisticsBuilder, StatsFilter};

#[derive(Debug, Default)]
struct State {
    envelopes: HashMap<EnvelopeId, Envelope>,
    dead_letters: BTreeMap<FailedMessageId, FailedMessage>,
    /// (queue, idempotency key) -> envelope holding it.
    idempotency: HashMap<(String, String), EnvelopeId>,
}

impl State {
    fn owned_mut(&mut self, envelope: &Envelope) -> Result<&mut Envelope, TransportError> {
        let stored = self
            .envelopes
            .get_mut(&envelope.id)
            .ok_or(TransportError::LockLost(envelope.id))?;
        let owner = envelope.locked_by.as_deref().unwrap_or_default();
        if stored.status != EnvelopeStatus::Processing || !stored.is_owned_by(owner) {
            return Err(TransportError::LockLost(envelope.id));
        }
        Ok(stored)
    }

    fn reserve(&mut self, envelope: &Envelope) -> Option<EnvelopeId> {
        let key = envelope.idempotency_key.as_ref()?;
        let slot = (envelope.queue_name.clone(), key.clone());
        if let Some(holder) = self.idempotency.get(&slot)
            && self
                .envelopes
                .get(holder)
                .is_some_and(|held| !held.status.is_terminal())
        {
            return Some(*holder);
        }
        self.idempotency.insert(slot, envelope.id);
        None
    }

    fn release_key(&mut self, envelope: &Envelope) {
        if let Some(key) = &envelope.idempotency_key {
            let slot = (envelope.queue_name.clone(), key.clone());
            if self.idempotency.get(&slot) == Some(&envelope.id) {
                self.idempotency.remove(&slot);
            }
        }
    }
}

/// Transport keeping everything in a mutex-guarded map.
///
/// Every operation takes the lock once, so claims are trivially atomic.
#[derive(Debug)]
pub struct MemoryTransport {
    name: String,
    state: Mutex<State>,
}

impl MemoryTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All stored envelopes, oldest first.
    pub fn envelopes(&self) -> Vec<Envelope> {
        let mut all: Vec<_> = self.lock().envelopes.values().cloned().collect();
        all.sort_by_key(|envelope| envelope.id);
        all
    }

    pub fn dead_letter_count(&self) -> usize {
        self.lock().dead_letters.len()
    }

    fn send_now(&self, mut envelope: Envelope) -> Result<SendOutcome, TransportError> {
        envelope.message.validate()?;
        envelope.transport_name = self.name.clone();

        let mut state = self.lock();
        if let Some(existing) = state.reserve(&envelope) {
            return Ok(SendOutcome::Duplicate(existing));
        }
        let id = envelope.id;
        state.envelopes.insert(id, envelope);
        Ok(SendOutcome::Created(id))
    }

    fn receive_now(&self, request: &ReceiveRequest, now: DateTime<Utc>) -> Vec<Envelope> {
        let mut state = self.lock();
        let mut candidates: Vec<&Envelope> = state
            .envelopes
            .values()
            .filter(|envelope| envelope.queue_name == request.queue && envelope.is_claimable_at(now))
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.available_at.cmp(&b.available_at))
                .then(a.id.cmp(&b.id))
        });
        let ids: Vec<EnvelopeId> = candidates
            .into_iter()
            .take(request.batch_size)
            .map(|envelope| envelope.id)
            .collect();

        ids.into_iter()
            .filter_map(|id| {
                let envelope = state.envelopes.get_mut(&id)?;
                envelope.claim(&request.worker_id, request.lock_duration, now);
                Some(envelope.clone())
            })
            .collect()
    }

    fn reject_now(
        &self,
        envelope: &Envelope,
        rejection: Rejection,
        now: DateTime<Utc>,
    ) -> Result<RejectOutcome, TransportError> {
        let mut state = self.lock();
        let stored = state.owned_mut(envelope)?;

        let retry_at = match rejection.disposition {
            Disposition::Retry { available_at } if stored.retry_count < stored.max_retries => {
                Some(available_at)
            }
            _ => None,
        };

        if let Some(available_at) = retry_at {
            stored.reschedule(&rejection.error, rejection.error_class, available_at, now);
            return Ok(RejectOutcome::Rescheduled { available_at });
        }

        stored.fail(&rejection.error, rejection.error_class, now);
        let failed = FailedMessage::from_envelope(stored);
        let failed_id = failed.id;
        let removed = state.envelopes.remove(&envelope.id);
        if let Some(removed) = removed {
            state.release_key(&removed);
        }
        state.dead_letters.insert(failed_id, failed);
        Ok(RejectOutcome::DeadLettered(failed_id))
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(&'a self, envelope: Envelope) -> BoxFuture<'a, Result<SendOutcome, TransportError>> {
        let result = self.send_now(envelope);
        Box::pin(async move { result })
    }

    fn receive<'a>(
        &'a self,
        request: &'a ReceiveRequest,
    ) -> BoxFuture<'a, Result<Vec<Envelope>, TransportError>> {
        let claimed = self.receive_now(request, Utc::now());
        Box::pin(async move { Ok(claimed) })
    }

    fn acknowledge<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<(), TransportError>> {
        let result = {
            let mut state = self.lock();
            let completed = state.owned_mut(envelope).map(|stored| {
                stored.complete(Utc::now());
                stored.clone()
            });
            completed.map(|completed| state.release_key(&completed))
        };
        Box::pin(async move { result })
    }

    fn reject<'a>(
        &'a self,
        envelope: &'a Envelope,
        rejection: Rejection,
    ) -> BoxFuture<'a, Result<RejectOutcome, TransportError>> {
        let result = self.reject_now(envelope, rejection, Utc::now());
        Box::pin(async move { result })
    }

    fn release<'a>(
        &'a self,
        envelope: &'a Envelope,
        available_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        let result = self
            .lock()
            .owned_mut(envelope)
            .map(|stored| stored.release(available_at, Utc::now()));
        Box::pin(async move { result })
    }

    fn extend_lock<'a>(
        &'a self,
        envelope: &'a Envelope,
        lock_duration: Duration,
    ) -> BoxFuture<'a, Result<DateTime<Utc>, TransportError>> {
        let now = Utc::now();
        let result = self.lock().owned_mut(envelope).map(|stored| {
            let expires = add_duration(now, lock_duration);
            stored.lock_expires_at = Some(expires);
            stored.updated_at = now;
            expires
        });
        Box::pin(async move { result })
    }

    fn queue_depth<'a>(&'a self, queue: Option<&'a str>) -> BoxFuture<'a, Result<u64, TransportError>> {
        let depth = self
            .lock()
            .envelopes
            .values()
            .filter(|envelope| !envelope.status.is_terminal())
            .filter(|envelope| queue.is_none_or(|queue| envelope.queue_name == queue))
            .count() as u64;
        Box::pin(async move { Ok(depth) })
    }

    fn purge_completed<'a>(
        &'a self,
        older_than: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<u64, TransportError>> {
        let mut state = self.lock();
        let before = state.envelopes.len();
        state.envelopes.retain(|_, envelope| {
            !(envelope.status == EnvelopeStatus::Completed
                && envelope.processed_at.is_some_and(|at| at < older_than))
        });
        let purged = (before - state.envelopes.len()) as u64;
        drop(state);
        Box::pin(async move { Ok(purged) })
    }
}

impl AdminStore for MemoryTransport {
    fn list_dead_letters<'a>(
        &'a self,
        limit: usize,
        offset: usize,
    ) -> BoxFuture<'a, Result<Page<FailedMessage>, TransportError>> {
        let state = self.lock();
        let items = state
            .dead_letters
            .values()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        let page = Page {
            items,
            total: state.dead_letters.len() as u64,
            limit,
            offset,
        };
        drop(state);
        Box::pin(async move { Ok(page) })
    }

    fn get_dead_letter<'a>(
        &'a self,
        id: FailedMessageId,
    ) -> BoxFuture<'a, Result<Option<FailedMessage>, TransportError>> {
        let found = self.lock().dead_letters.get(&id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn retry_dead_letter<'a>(
        &'a self,
        id: FailedMessageId,
    ) -> BoxFuture<'a, Result<Envelope, TransportError>> {
        let result = (|| {
            let mut state = self.lock();
            let failed = state
                .dead_letters
                .get(&id)
                .ok_or_else(|| TransportError::NotFound(format!("dead letter {id}")))?;
            let mut envelope = failed.to_retry_envelope();
            envelope.transport_name = self.name.clone();

            if let Some(holder) = state.reserve(&envelope) {
                return Err(TransportError::Conflict(format!(
                    "idempotency key is held by live envelope {holder}"
                )));
            }
            state.dead_letters.remove(&id);
            state.envelopes.insert(envelope.id, envelope.clone());
            Ok(envelope)
        })();
        Box::pin(async move { result })
    }

    fn delete_dead_letter<'a>(
        &'a self,
        id: FailedMessageId,
    ) -> BoxFuture<'a, Result<bool, TransportError>> {
        let removed = self.lock().dead_letters.remove(&id).is_some();
        Box::pin(async move { Ok(removed) })
    }

    fn get_envelope<'a>(
        &'a self,
        id: EnvelopeId,
    ) -> BoxFuture<'a, Result<Option<Envelope>, TransportError>> {
        let found = self.lock().envelopes.get(&id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn statistics<'a>(
        &'a self,
        filter: &'a StatsFilter,
    ) -> BoxFuture<'a, Result<Statistics, TransportError>> {
        let mut builder = StatisticsBuilder::new();
        {
            let state = self.lock();
            for envelope in state.envelopes.values().filter(|e| filter.matches_envelope(e)) {
                builder.add_envelope(envelope);
            }
            for failed in state.dead_letters.values().filter(|f| filter.matches_failed(f)) {
                builder.add_failed(failed);
            }
        }
        let stats = builder.build();
        Box::pin(async move { Ok(stats) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Priority;
    use crate::error::ErrorKind;
    use crate::message::Message;
    use serde_json::json;

    fn envelope(queue: &str) -> Envelope {
        Envelope::new(
            Message::new("email.send", json!({"to": "a@example.com"})).unwrap(),
            "memory",
            queue,
        )
    }

    fn request(worker: &str, batch_size: usize) -> ReceiveRequest {
        ReceiveRequest {
            queue: "emails".into(),
            batch_size,
            worker_id: worker.into(),
            lock_duration: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn duplicate_key_returns_existing_id() {
        let transport = MemoryTransport::new("memory");
        let first = transport
            .send(envelope("emails").with_idempotency_key("k"))
            .await
            .unwrap();
        let second = transport
            .send(envelope("emails").with_idempotency_key("k"))
            .await
            .unwrap();
        assert_eq!(second, SendOutcome::Duplicate(first.id()));
        assert_eq!(transport.envelopes().len(), 1);

        // Same key on another queue is independent.
        let other = transport
            .send(envelope("calendar").with_idempotency_key("k"))
            .await
            .unwrap();
        assert!(!other.is_duplicate());
    }

    #[tokio::test]
    async fn key_is_reusable_after_completion() {
        let transport = MemoryTransport::new("memory");
        transport
            .send(envelope("emails").with_idempotency_key("k"))
            .await
            .unwrap();
        let claimed = transport.receive(&request("w", 1)).await.unwrap();
        transport.acknowledge(&claimed[0]).await.unwrap();

        let again = transport
            .send(envelope("emails").with_idempotency_key("k"))
            .await
            .unwrap();
        assert!(!again.is_duplicate());
    }

    #[tokio::test]
    async fn receive_orders_by_priority_then_availability() {
        let transport = MemoryTransport::new("memory");
        let low = envelope("emails").with_priority(Priority::MIN);
        let high = envelope("emails").with_priority(Priority::MAX);
        let low_id = low.id;
        let high_id = high.id;
        transport.send(low).await.unwrap();
        transport.send(high).await.unwrap();

        let claimed = transport.receive(&request("w", 10)).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![high_id, low_id]);
        assert!(claimed.iter().all(|e| e.locked_by.as_deref() == Some("w")));
    }

    #[tokio::test]
    async fn claimed_envelopes_are_not_claimed_twice() {
        let transport = MemoryTransport::new("memory");
        for _ in 0..5 {
            transport.send(envelope("emails")).await.unwrap();
        }
        let a = transport.receive(&request("a", 3)).await.unwrap();
        let b = transport.receive(&request("b", 3)).await.unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 2);
        assert!(a.iter().all(|x| b.iter().all(|y| x.id != y.id)));
    }

    #[tokio::test]
    async fn expired_lock_is_reclaimed() {
        let transport = MemoryTransport::new("memory");
        transport.send(envelope("emails")).await.unwrap();
        let now = Utc::now();
        let first = transport.receive_now(&request("crashed", 1), now);
        assert_eq!(first.len(), 1);

        let later = now + chrono::Duration::seconds(31);
        let second = transport.receive_now(&request("rescuer", 1), later);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].delivery_count, 2);

        // The crashed worker no longer owns it.
        let err = transport.acknowledge(&first[0]).await.unwrap_err();
        assert!(matches!(err, TransportError::LockLost(_)));
    }

    #[tokio::test]
    async fn exhausted_retry_moves_to_dead_letters() {
        let transport = MemoryTransport::new("memory");
        transport
            .send(envelope("emails").with_max_retries(0))
            .await
            .unwrap();
        let claimed = transport.receive(&request("w", 1)).await.unwrap();
        let outcome = transport
            .reject(
                &claimed[0],
                Rejection {
                    error: "503".into(),
                    error_class: ErrorKind::Transient,
                    disposition: Disposition::Retry {
                        available_at: Utc::now(),
                    },
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, RejectOutcome::DeadLettered(_)));
        assert!(transport.envelopes().is_empty());
        assert_eq!(transport.dead_letter_count(), 1);
    }

    #[tokio::test]
    async fn dead_letter_retry_round_trip() {
        let transport = MemoryTransport::new("memory");
        transport
            .send(envelope("emails").with_idempotency_key("k"))
            .await
            .unwrap();
        let claimed = transport.receive(&request("w", 1)).await.unwrap();
        let RejectOutcome::DeadLettered(failed_id) = transport
            .reject(
                &claimed[0],
                Rejection {
                    error: "bad address".into(),
                    error_class: ErrorKind::Permanent,
                    disposition: Disposition::DeadLetter,
                },
            )
            .await
            .unwrap()
        else {
            panic!("expected dead letter");
        };

        let retried = transport.retry_dead_letter(failed_id).await.unwrap();
        assert_eq!(retried.retry_count, 0);
        assert_eq!(transport.dead_letter_count(), 0);
        assert_eq!(transport.envelopes().len(), 1);
        assert!(matches!(
            transport.retry_dead_letter(failed_id).await,
            Err(TransportError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn dead_letter_retry_conflicts_with_live_key() {
        let transport = MemoryTransport::new("memory");
        transport
            .send(envelope("emails").with_idempotency_key("k"))
            .await
            .unwrap();
        let claimed = transport.receive(&request("w", 1)).await.unwrap();
        let RejectOutcome::DeadLettered(failed_id) = transport
            .reject(
                &claimed[0],
                Rejection {
                    error: "x".into(),
                    error_class: ErrorKind::Permanent,
                    disposition: Disposition::DeadLetter,
                },
            )
            .await
            .unwrap()
        else {
            panic!("expected dead letter");
        };

        transport
            .send(envelope("emails").with_idempotency_key("k"))
            .await
            .unwrap();
        assert!(matches!(
            transport.retry_dead_letter(failed_id).await,
            Err(TransportError::Conflict(_))
        ));
        assert_eq!(transport.dead_letter_count(), 1);
    }

    #[tokio::test]
    async fn release_keeps_budget_and_defers() {
        let transport = MemoryTransport::new("memory");
        transport.send(envelope("emails")).await.unwrap();
        let claimed = transport.receive(&request("w", 1)).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(60);
        transport.release(&claimed[0], later).await.unwrap();

        assert!(transport.receive(&request("w", 1)).await.unwrap().is_empty());
        let stored = transport.get_envelope(claimed[0].id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.available_at, later);
        assert_eq!(transport.queue_depth(Some("emails")).await.unwrap(), 1);
    }
}
