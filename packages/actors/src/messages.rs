//! Message types for actor communication.

use ractor::RpcReplyPort;
use serde::Serialize;

use crate::config::ConfigError;

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Claim a batch if there is spare capacity.
    Poll,

    /// Report counters.
    Status { reply: RpcReplyPort<WorkerStatus> },

    /// Stop claiming, wait for in-flight handlers, then stop.
    /// Replies `true` when everything finished within the drain timeout.
    Drain { reply: RpcReplyPort<bool> },
}

/// Messages for the SchedulerActor.
#[derive(Debug)]
pub enum SchedulerMessage {
    /// Periodic tick: fire due schedules, purge history when due.
    Tick,

    /// Fire due schedules now and reply with how many fired.
    RunDue { reply: RpcReplyPort<usize> },
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Status of every running worker.
    ListWorkers {
        reply: RpcReplyPort<Vec<WorkerStatus>>,
    },

    /// Drain workers, stop the scheduler, flush observability.
    Shutdown { reply: RpcReplyPort<()> },
}

/// A worker's binding and counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub transport: String,
    pub queue: String,
    pub max_concurrency: usize,
    pub in_flight: usize,
    pub processed: u64,
    pub running: bool,
}

/// Error type for actor operations.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    #[error("Failed to spawn actor: {0}")]
    Spawn(#[from] ractor::SpawnErr),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Timeout")]
    Timeout,
}
