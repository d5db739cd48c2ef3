//! Running system for the Symphony message queue.
//!
//! This crate provides the producer API, the handler registry and the
//! Ractor-based actors that poll transports and fire schedules.
//!
//! # Architecture
//!
//! - `Supervisor` - Top-level actor owning workers and the scheduler
//! - `WorkerActor` - Claims envelopes from one queue and runs handlers concurrently
//! - `SchedulerActor` - Turns due schedule definitions into envelopes
//! - `Dispatcher` - Wraps messages in envelopes and stores them
//! - `AdminService` - Dead letters, statistics, schedules and circuits
//!
//! # Usage
//!
//! ```ignore
//! use symphony_actors::{HandlerRegistry, Runtime, SymphonyConfig, message_handler, start_supervisor};
//!
//! let handlers = HandlerRegistry::new()
//!     .with(message_handler!("email.send", |message, _ctx| send_email(message).await));
//! let runtime = Runtime::surreal(SymphonyConfig::from_env()?, handlers);
//!
//! let receipt = runtime.dispatcher().dispatch(message, DispatchOptions::new()).await?;
//! let (supervisor, handle) = start_supervisor(runtime).await?;
//! ```

mod admin;
mod config;
mod dispatcher;
mod handler;
mod messages;
mod observability;
mod pipeline;
mod runtime;
mod scheduler;
mod scheduler_actor;
mod supervisor;
mod worker_actor;

pub use admin::{AdminError, AdminService, MAX_PAGE_SIZE, merge_statistics};
pub use config::{ConfigError, RoutingRule, SchedulerConfig, SymphonyConfig, WorkerConfig};
pub use dispatcher::{DispatchError, DispatchOptions, DispatchReceipt, Dispatcher, TransportRegistry};
pub use handler::{FnHandler, HandlerContext, HandlerFuture, HandlerRegistry, MessageHandler};
pub use messages::{ActorError, SchedulerMessage, SupervisorMessage, WorkerMessage, WorkerStatus};
pub use observability::{
    InMemoryMetrics, MetricsSink, Observability, SEND_DURATION, SEND_FAILURE, SEND_SUCCESS,
    TracingMetricsSink,
};
pub use pipeline::{Pipeline, ProcessOutcome, increment_for};
pub use runtime::Runtime;
pub use scheduler::{Scheduler, SchedulerError};
pub use scheduler_actor::{SchedulerActor, SchedulerArgs};
pub use supervisor::{Supervisor, shutdown, start_supervisor};
pub use worker_actor::{WorkerActor, WorkerArgs};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
