//! Scheduler actor driving [`Scheduler`] on a fixed tick.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::messages::SchedulerMessage;
use crate::scheduler::Scheduler;

/// Scheduler actor arguments.
pub struct SchedulerArgs {
    pub scheduler: Scheduler,
    pub poll_interval: Duration,
    pub purge_interval: Duration,
}

pub struct SchedulerState {
    scheduler: Scheduler,
    purge_interval: Duration,
    last_purge: Option<DateTime<Utc>>,
}

impl SchedulerState {
    fn purge_due(&self, now: DateTime<Utc>) -> bool {
        let Ok(interval) = chrono::Duration::from_std(self.purge_interval) else {
            return false;
        };
        self.last_purge.is_none_or(|last| now - last >= interval)
    }
}

/// Periodically fires due schedules.
pub struct SchedulerActor;

impl Actor for SchedulerActor {
    type Msg = SchedulerMessage;
    type State = SchedulerState;
    type Arguments = SchedulerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting scheduler, polling every {:?}", args.poll_interval);

        let myself_clone = myself.clone();
        let period = args.poll_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if myself_clone.send_message(SchedulerMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(SchedulerState {
            scheduler: args.scheduler,
            purge_interval: args.purge_interval,
            last_purge: None,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SchedulerMessage::Tick => {
                let now = Utc::now();
                if let Err(err) = state.scheduler.run_due(now).await {
                    tracing::warn!("Failed to load due schedules: {}", err);
                }
                if state.purge_due(now) {
                    state.scheduler.purge_completed(now).await;
                    state.last_purge = Some(now);
                }
            }

            SchedulerMessage::RunDue { reply } => {
                let fired = match state.scheduler.run_due(Utc::now()).await {
                    Ok(fired) => fired,
                    Err(err) => {
                        tracing::warn!("Failed to load due schedules: {}", err);
                        0
                    }
                };
                let _ = reply.send(fired);
            }
        }

        Ok(())
    }
}
