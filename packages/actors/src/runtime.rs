//! Wiring of transports, stores and policies for one process.

use std::sync::Arc;

use symphony_core::{
    CircuitBreaker, ExponentialBackoff, MemoryScheduleStore, MemoryTransport, RateLimiter,
    RetryStrategy, ScheduleStore, Transport,
};
use symphony_db::{
    SurrealCircuitStore, SurrealRateLimitStore, SurrealScheduleStore, SurrealTransport,
};

use crate::admin::AdminService;
use crate::config::{SymphonyConfig, WorkerConfig};
use crate::dispatcher::{Dispatcher, TransportRegistry};
use crate::handler::HandlerRegistry;
use crate::messages::ActorError;
use crate::observability::{Observability, TracingMetricsSink};
use crate::pipeline::Pipeline;
use crate::scheduler::Scheduler;

/// Shared collaborators handed to the dispatcher, workers, scheduler and admin.
#[derive(Clone)]
pub struct Runtime {
    pub config: Arc<SymphonyConfig>,
    pub transports: TransportRegistry,
    pub handlers: Arc<HandlerRegistry>,
    pub retry: Arc<dyn RetryStrategy>,
    pub rate_limiter: RateLimiter,
    pub circuit_breaker: CircuitBreaker,
    pub schedules: Arc<dyn ScheduleStore>,
    pub observability: Observability,
}

impl Runtime {
    /// Single-process runtime: in-memory transports and state stores.
    pub fn in_memory(config: SymphonyConfig, handlers: HandlerRegistry) -> Self {
        let mut transports = TransportRegistry::new();
        for name in config.transport_names() {
            transports.register(MemoryTransport::new(name));
        }
        Self {
            transports,
            handlers: Arc::new(handlers),
            retry: Arc::new(ExponentialBackoff::new(config.retry.clone())),
            rate_limiter: RateLimiter::in_memory(config.rate_limits.clone()),
            circuit_breaker: CircuitBreaker::in_memory(config.circuit_breaker.clone()),
            schedules: Arc::new(MemoryScheduleStore::new()),
            observability: Observability::new(config.event_capacity, Arc::new(TracingMetricsSink)),
            config: Arc::new(config),
        }
    }

    /// Runtime over the shared database. Call `symphony_db::init` first.
    pub fn surreal(config: SymphonyConfig, handlers: HandlerRegistry) -> Self {
        let mut transports = TransportRegistry::new();
        for name in config.transport_names() {
            transports.register(SurrealTransport::new(name));
        }
        Self {
            transports,
            handlers: Arc::new(handlers),
            retry: Arc::new(ExponentialBackoff::new(config.retry.clone())),
            rate_limiter: RateLimiter::new(
                Arc::new(SurrealRateLimitStore),
                config.rate_limits.clone(),
            ),
            circuit_breaker: CircuitBreaker::new(
                Arc::new(SurrealCircuitStore),
                config.circuit_breaker.clone(),
            ),
            schedules: Arc::new(SurrealScheduleStore),
            observability: Observability::new(config.event_capacity, Arc::new(TracingMetricsSink)),
            config: Arc::new(config),
        }
    }

    pub fn with_observability(mut self, observability: Observability) -> Self {
        self.observability = observability;
        self
    }

    pub fn with_retry(mut self, retry: Arc<dyn RetryStrategy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.transports.clone(),
            self.retry.clone(),
            self.observability.clone(),
        )
        .with_routing(self.config.routing.clone())
        .with_defaults(
            self.config.default_transport.clone(),
            self.config.default_queue.clone(),
        )
    }

    pub fn admin(&self) -> AdminService {
        AdminService::new(
            self.transports.clone(),
            self.config.default_transport.clone(),
            self.schedules.clone(),
            self.circuit_breaker.clone(),
            self.observability.clone(),
        )
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.schedules.clone(),
            self.dispatcher(),
            self.transports.clone(),
            self.observability.clone(),
        )
        .with_batch_size(self.config.scheduler.batch_size)
        .with_completed_retention(self.config.scheduler.completed_retention())
    }

    /// Transport name a worker binding polls.
    pub fn worker_transport(&self, worker: &WorkerConfig) -> String {
        worker
            .transport
            .clone()
            .unwrap_or_else(|| self.config.default_transport.clone())
    }

    /// Processing pipeline for one worker.
    pub fn pipeline(
        &self,
        worker_id: impl Into<String>,
        worker: &WorkerConfig,
    ) -> Result<Pipeline, ActorError> {
        let name = self.worker_transport(worker);
        let transport: Arc<dyn Transport> = self
            .transports
            .get(&name)
            .ok_or(ActorError::UnknownTransport(name))?;
        Ok(Pipeline {
            transport,
            handlers: self.handlers.clone(),
            retry: self.retry.clone(),
            rate_limiter: self.rate_limiter.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            observability: self.observability.clone(),
            worker_id: worker_id.into(),
            lock_duration: worker.lock_duration(),
            handler_timeout: worker.handler_timeout(),
        })
    }
}
