use std::time::Duration;

use symphony_actors::{Runtime, SymphonyConfig, shutdown, start_supervisor};

mod demo;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Initializing symphony...");
    let config = SymphonyConfig::from_env()?;
    symphony_db::init(config.database.clone()).await?;

    let drain_timeout = config
        .workers
        .iter()
        .map(|worker| worker.drain_timeout())
        .max()
        .unwrap_or_default();

    let handlers = demo::handlers();
    tracing::info!("Registered handlers: {:?}", handlers.message_types());
    let runtime = Runtime::surreal(config, handlers);

    let (supervisor, handle) = start_supervisor(runtime.clone()).await?;
    if let Err(e) = demo::seed_schedule(&runtime.admin()).await {
        tracing::warn!("Failed to create demo schedule: {}", e);
    }
    tracing::info!("Symphony running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, draining workers");
    shutdown(&supervisor, handle, drain_timeout + SHUTDOWN_GRACE).await?;
    tracing::info!("Symphony stopped");
    Ok(())
}
