#![allow(dead_code)]

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use symphony_actors::{HandlerRegistry, InMemoryMetrics, Observability, Runtime, SymphonyConfig};
use symphony_core::{Envelope, Message, ReceiveRequest, SymphonyEvent};
use serde_json::json;
use tokio::sync::broadcast;

/// In-memory runtime whose metrics are recorded for inspection.
pub fn runtime(
    config: SymphonyConfig,
    handlers: HandlerRegistry,
) -> (Runtime, Arc<InMemoryMetrics>) {
    let metrics = Arc::new(InMemoryMetrics::new());
    let observability = Observability::new(config.event_capacity, metrics.clone());
    let runtime = Runtime::in_memory(config, handlers).with_observability(observability);
    (runtime, metrics)
}

pub fn email(to: &str) -> Message {
    Message::new("email.send", json!({ "to": to, "subject": "hello" }))
        .unwrap()
        .with_metadata("sender", "tenant-1")
}

/// Claim up to `batch_size` envelopes from the default transport.
pub async fn claim(
    runtime: &Runtime,
    queue: &str,
    worker_id: &str,
) -> Result<Vec<Envelope>, Box<dyn Error>> {
    let transport = runtime
        .transports
        .get(&runtime.config.default_transport)
        .ok_or("default transport missing")?;
    let request = ReceiveRequest {
        queue: queue.to_string(),
        batch_size: 10,
        worker_id: worker_id.to_string(),
        lock_duration: Duration::from_secs(30),
    };
    Ok(transport.receive(&request).await?)
}

/// Drain events already published to `events`.
pub fn drain(events: &mut broadcast::Receiver<SymphonyEvent>) -> Vec<SymphonyEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
