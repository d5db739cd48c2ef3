//! Demo handlers and the demo schedule seeded on an empty database.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use symphony_actors::{AdminService, HandlerRegistry, message_handler};
use symphony_core::{HandlerError, ScheduleDefinition, ScheduleKind};

pub fn handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        // Logs the payload.
        .with(message_handler!("echo", |message, _ctx| {
            tracing::info!("Echo message: {:?}", message.payload);
            Ok(())
        }))
        // Sleeps for `payload.seconds`, defaulting to five.
        .with(message_handler!("sleep", |message, _ctx| {
            let seconds = message
                .payload
                .get("seconds")
                .and_then(|v| v.as_u64())
                .unwrap_or(5);
            tracing::info!("Sleeping for {} seconds", seconds);
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            Ok(())
        }))
        // Fails transiently until the last attempt, for exercising retries.
        .with(message_handler!("fail", |message, ctx| {
            let permanent = message
                .payload
                .get("permanent")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if permanent {
                Err(HandlerError::permanent("Intentional permanent failure"))
            } else if ctx.is_last_attempt() {
                Ok(())
            } else {
                Err(HandlerError::transient(format!(
                    "Intentional failure on attempt {}",
                    ctx.retry_count + 1
                )))
            }
        }))
}

/// Create an `echo` heartbeat every minute if no schedules exist yet.
pub async fn seed_schedule(admin: &AdminService) -> Result<(), Box<dyn std::error::Error>> {
    if !admin.list_schedules().await?.is_empty() {
        return Ok(());
    }

    tracing::info!("Creating demo schedule...");
    let now = Utc::now();
    let heartbeat = ScheduleDefinition::new(
        "echo",
        ScheduleKind::Interval {
            every_ms: 60_000,
            start_at: None,
        },
        now,
    )?
    .with_body(json!({ "heartbeat": true }))?;
    let heartbeat = admin.create_schedule(heartbeat).await?;
    tracing::info!("Created demo schedule: {}", heartbeat.id);
    Ok(())
}
