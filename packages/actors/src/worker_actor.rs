//! Worker actor: polls one queue and runs handlers concurrently.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use symphony_core::{Envelope, ReceiveRequest, SymphonyEvent};
use tokio::sync::Semaphore;

use crate::messages::{WorkerMessage, WorkerStatus};
use crate::pipeline::Pipeline;

/// Worker actor arguments.
pub struct WorkerArgs {
    pub pipeline: Pipeline,
    pub transport_name: String,
    pub queue: String,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
}

/// State for the worker actor.
pub struct WorkerActorState {
    pipeline: Arc<Pipeline>,
    transport_name: String,
    queue: String,
    batch_size: usize,
    max_concurrency: usize,
    poll_interval: Duration,
    drain_timeout: Duration,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    processed: Arc<AtomicU64>,
    running: bool,
}

impl WorkerActorState {
    fn new(args: WorkerArgs) -> Self {
        let max_concurrency = args.max_concurrency.max(1);
        Self {
            pipeline: Arc::new(args.pipeline),
            transport_name: args.transport_name,
            queue: args.queue,
            batch_size: args.batch_size.max(1),
            max_concurrency,
            poll_interval: args.poll_interval,
            drain_timeout: args.drain_timeout,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            processed: Arc::new(AtomicU64::new(0)),
            running: true,
        }
    }

    fn worker_id(&self) -> &str {
        self.pipeline.worker_id()
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            worker_id: self.worker_id().to_string(),
            transport: self.transport_name.clone(),
            queue: self.queue.clone(),
            max_concurrency: self.max_concurrency,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            running: self.running,
        }
    }

    /// Claim up to the spare capacity. Returns (claimed, requested).
    async fn poll(&self) -> (usize, usize) {
        let capacity = self.permits.available_permits().min(self.batch_size);
        if capacity == 0 {
            return (0, 0);
        }

        let request = ReceiveRequest {
            queue: self.queue.clone(),
            batch_size: capacity,
            worker_id: self.worker_id().to_string(),
            lock_duration: self.pipeline.lock_duration,
        };
        match self.pipeline.transport().receive(&request).await {
            Ok(envelopes) => {
                let claimed = envelopes.len();
                if claimed > 0 {
                    tracing::debug!(worker_id = %self.worker_id(), claimed, "Claimed envelopes");
                }
                for envelope in envelopes {
                    self.spawn_processing(envelope).await;
                }
                (claimed, capacity)
            }
            Err(err) => {
                tracing::warn!(worker_id = %self.worker_id(), "Failed to claim envelopes: {}", err);
                (0, capacity)
            }
        }
    }

    async fn spawn_processing(&self, envelope: Envelope) {
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        let pipeline = self.pipeline.clone();
        let in_flight = self.in_flight.clone();
        let processed = self.processed.clone();

        in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let message_id = envelope.id;
            let outcome = pipeline.process(envelope).await;
            tracing::trace!(worker_id = %pipeline.worker_id(), %message_id, ?outcome, "Envelope settled");
            processed.fetch_add(1, Ordering::SeqCst);
            in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });
    }

    /// Wait for every permit, i.e. for all in-flight handlers to finish.
    async fn drain(&self) -> bool {
        let all = u32::try_from(self.max_concurrency).unwrap_or(u32::MAX);
        match tokio::time::timeout(self.drain_timeout, self.permits.acquire_many(all)).await {
            Ok(Ok(_permits)) => true,
            Ok(Err(_)) | Err(_) => false,
        }
    }
}

/// Worker actor that claims and processes envelopes.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let state = WorkerActorState::new(args);
        tracing::info!(
            "Starting worker {} on {}/{}",
            state.worker_id(),
            state.transport_name,
            state.queue
        );
        state.pipeline.observability.publish(SymphonyEvent::WorkerStarted {
            worker_id: state.worker_id().to_string(),
            transport: state.transport_name.clone(),
            queue: state.queue.clone(),
            timestamp: Utc::now(),
        });

        myself
            .send_message(WorkerMessage::Poll)
            .map_err(|e| ActorProcessingErr::from(format!("Failed to schedule first poll: {}", e)))?;
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                if !state.running {
                    return Ok(());
                }
                let (claimed, requested) = state.poll().await;
                // A full batch means more work is likely waiting.
                if claimed > 0 && claimed == requested {
                    let _ = myself.send_message(WorkerMessage::Poll);
                } else {
                    myself.send_after(state.poll_interval, || WorkerMessage::Poll);
                }
            }

            WorkerMessage::Status { reply } => {
                let _ = reply.send(state.status());
            }

            WorkerMessage::Drain { reply } => {
                state.running = false;
                tracing::info!(
                    "Draining worker {} ({} in flight)",
                    state.worker_id(),
                    state.in_flight.load(Ordering::SeqCst)
                );
                let drained = state.drain().await;
                if !drained {
                    tracing::warn!(
                        "Worker {} drain timed out, {} handlers abandoned",
                        state.worker_id(),
                        state.in_flight.load(Ordering::SeqCst)
                    );
                }
                state.pipeline.observability.publish(SymphonyEvent::WorkerStopped {
                    worker_id: state.worker_id().to_string(),
                    processed: state.processed.load(Ordering::SeqCst),
                    timestamp: Utc::now(),
                });
                let _ = reply.send(drained);
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!("Worker {} stopped", state.worker_id());
        Ok(())
    }
}
