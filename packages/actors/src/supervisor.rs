//! Supervisor actor owning the workers and the scheduler.

use std::time::Duration;

use futures_util::future::join_all;
use ractor::{Actor, ActorCell, ActorProcessingErr, ActorRef, SupervisionEvent};
use ulid::Ulid;

use crate::config::WorkerConfig;
use crate::messages::{ActorError, SchedulerMessage, SupervisorMessage, WorkerMessage};
use crate::runtime::Runtime;
use crate::scheduler_actor::{SchedulerActor, SchedulerArgs};
use crate::worker_actor::{WorkerActor, WorkerArgs};

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

struct WorkerSlot {
    worker_id: String,
    config: WorkerConfig,
    actor: ActorRef<WorkerMessage>,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    runtime: Runtime,
    workers: Vec<WorkerSlot>,
    scheduler: Option<ActorRef<SchedulerMessage>>,
    /// Distinguishes this process's workers in `locked_by`.
    instance: String,
    worker_counter: u64,
    shutting_down: bool,
}

impl SupervisorState {
    fn new(runtime: Runtime) -> Self {
        let instance = Ulid::new().to_string().to_lowercase();
        Self {
            runtime,
            workers: Vec::new(),
            scheduler: None,
            instance,
            worker_counter: 0,
            shutting_down: false,
        }
    }

    /// Generate a worker ID unique across processes.
    fn next_worker_id(&mut self) -> String {
        self.worker_counter += 1;
        format!("worker-{}-{}", &self.instance[self.instance.len() - 8..], self.worker_counter)
    }
}

async fn spawn_worker(
    myself: &ActorRef<SupervisorMessage>,
    state: &SupervisorState,
    worker_id: String,
    config: WorkerConfig,
) -> Result<WorkerSlot, ActorProcessingErr> {
    let pipeline = state.runtime.pipeline(worker_id.clone(), &config)?;
    let args = WorkerArgs {
        pipeline,
        transport_name: state.runtime.worker_transport(&config),
        queue: config.queue.clone(),
        batch_size: config.batch_size,
        max_concurrency: config.max_concurrency,
        poll_interval: config.poll_interval(),
        drain_timeout: config.drain_timeout(),
    };

    let (actor, _handle) = Actor::spawn_linked(None, WorkerActor, args, myself.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;

    Ok(WorkerSlot {
        worker_id,
        config,
        actor,
    })
}

async fn spawn_scheduler(
    myself: &ActorRef<SupervisorMessage>,
    runtime: &Runtime,
) -> Result<ActorRef<SchedulerMessage>, ActorProcessingErr> {
    let config = &runtime.config.scheduler;
    let args = SchedulerArgs {
        scheduler: runtime.scheduler(),
        poll_interval: config.poll_interval(),
        purge_interval: config.purge_interval(),
    };
    let (scheduler, _handle) = Actor::spawn_linked(None, SchedulerActor, args, myself.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn scheduler: {}", e)))?;
    Ok(scheduler)
}

/// Supervisor actor that manages workers and the scheduler.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = Runtime;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting symphony supervisor");
        let mut state = SupervisorState::new(args);

        let bindings = state.runtime.config.workers.clone();
        for config in bindings {
            for _ in 0..config.instances.max(1) {
                let worker_id = state.next_worker_id();
                let slot = spawn_worker(&myself, &state, worker_id, config.clone()).await?;
                state.workers.push(slot);
            }
        }

        if state.runtime.config.scheduler.enabled {
            state.scheduler = Some(spawn_scheduler(&myself, &state.runtime).await?);
        }

        tracing::info!(
            "Supervisor started {} workers (scheduler {})",
            state.workers.len(),
            if state.scheduler.is_some() { "on" } else { "off" }
        );
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::ListWorkers { reply } => {
                let calls = state.workers.iter().map(|slot| {
                    ractor::rpc::call(
                        &slot.actor,
                        |reply| WorkerMessage::Status { reply },
                        Some(STATUS_TIMEOUT),
                    )
                });
                let statuses = join_all(calls)
                    .await
                    .into_iter()
                    .filter_map(|result| match result {
                        Ok(ractor::rpc::CallResult::Success(status)) => Some(status),
                        _ => None,
                    })
                    .collect();
                let _ = reply.send(statuses);
            }

            SupervisorMessage::Shutdown { reply } => {
                tracing::info!("Shutting down supervisor");
                state.shutting_down = true;

                if let Some(scheduler) = state.scheduler.take() {
                    scheduler.stop(None);
                }

                let drains = state.workers.iter().map(|slot| {
                    let timeout = slot.config.drain_timeout() + Duration::from_secs(1);
                    ractor::rpc::call(
                        &slot.actor,
                        |reply| WorkerMessage::Drain { reply },
                        Some(timeout),
                    )
                });
                for (slot, result) in state.workers.iter().zip(join_all(drains).await) {
                    match result {
                        Ok(ractor::rpc::CallResult::Success(true)) => {}
                        _ => tracing::warn!("Worker {} did not drain cleanly", slot.worker_id),
                    }
                }
                state.workers.clear();

                state.runtime.observability.flush();
                let _ = reply.send(());
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if state.shutting_down {
            return Ok(());
        }
        let cell: ActorCell = match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                tracing::warn!("Child actor {} terminated: {:?}", cell.get_id(), reason);
                cell
            }
            SupervisionEvent::ActorFailed(cell, err) => {
                tracing::error!("Child actor {} failed: {}", cell.get_id(), err);
                cell
            }
            _ => return Ok(()),
        };

        if state
            .scheduler
            .as_ref()
            .is_some_and(|scheduler| scheduler.get_id() == cell.get_id())
        {
            tracing::info!("Restarting scheduler");
            state.scheduler = Some(spawn_scheduler(&myself, &state.runtime).await?);
            return Ok(());
        }

        let Some(index) = state
            .workers
            .iter()
            .position(|slot| slot.actor.get_id() == cell.get_id())
        else {
            return Ok(());
        };
        let dead = state.workers.remove(index);
        tracing::info!("Restarting worker {}", dead.worker_id);
        let slot = spawn_worker(&myself, state, dead.worker_id, dead.config).await?;
        state.workers.push(slot);
        Ok(())
    }
}

/// Start the supervisor over `runtime`.
pub async fn start_supervisor(
    runtime: Runtime,
) -> Result<(ActorRef<SupervisorMessage>, tokio::task::JoinHandle<()>), ActorError> {
    runtime.config.validate()?;
    let (actor, handle) = Actor::spawn(None, Supervisor, runtime).await?;
    Ok((actor, handle))
}

/// Ask the supervisor to drain and stop, then wait for it to exit.
pub async fn shutdown(
    supervisor: &ActorRef<SupervisorMessage>,
    handle: tokio::task::JoinHandle<()>,
    timeout: Duration,
) -> Result<(), ActorError> {
    match ractor::rpc::call(supervisor, |reply| SupervisorMessage::Shutdown { reply }, Some(timeout))
        .await
    {
        Ok(ractor::rpc::CallResult::Success(())) => {}
        Ok(ractor::rpc::CallResult::Timeout) => return Err(ActorError::Timeout),
        Ok(ractor::rpc::CallResult::SenderError) => {
            return Err(ActorError::Actor("supervisor dropped the reply".into()));
        }
        Err(err) => return Err(ActorError::Actor(err.to_string())),
    }
    handle
        .await
        .map_err(|err| ActorError::Actor(err.to_string()))
}
