//! Core domain types for the Symphony message queue.
//!
//! This crate contains the backend-agnostic pieces shared by every package:
//! - Message and Envelope for units of work
//! - Retry strategy, rate limiter and circuit breaker policies
//! - Transport and state-store traits with in-memory implementations
//! - Schedules, dead letters, statistics and lifecycle events

use std::future::Future;
use std::pin::Pin;

pub mod circuit_breaker;
pub mod envelope;
pub mod error;
mod events;
pub mod failed;
pub mod message;
pub mod rate_limit;
pub mod retry;
pub mod schedule;
mod stats;
pub mod transport;

/// Boxed future returned by the object-safe store and transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitSnapshot, CircuitState,
    CircuitStore, MemoryCircuitStore, Transition,
};
pub use envelope::{
    AUTH_REFRESH_HEADER, AttemptRecord, Envelope, EnvelopeId, EnvelopeStatus, Priority,
    SCHEDULE_HEADER,
};
pub use error::{ErrorKind, HandlerError, StoreError};
pub use events::SymphonyEvent;
pub use failed::{FailedMessage, FailedMessageId, Page};
pub use message::{Message, ValidationError};
pub use rate_limit::{
    LimiterKey, LimiterType, MemoryRateLimitStore, RateIncrement, RateLimitConfig,
    RateLimitDecision, RateLimitReason, RateLimitRule, RateLimitStore, RateLimited, RateLimiter,
    WindowEntry,
};
pub use retry::{ExponentialBackoff, RetryConfig, RetryDecision, RetryStrategy};
pub use schedule::{
    MemoryScheduleStore, ScheduleDefinition, ScheduleError, ScheduleId, ScheduleKind,
    ScheduleStore,
};
pub use stats::{Statistics, StatisticsBuilder, StatsFilter};
pub use transport::{
    AdminStore, Disposition, MemoryTransport, ReceiveRequest, RejectOutcome, Rejection,
    SendOutcome, Transport, TransportError,
};
