#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use symphony_actors::{
    FnHandler, HandlerFuture, HandlerRegistry, ProcessOutcome, SEND_FAILURE, SEND_SUCCESS,
    SymphonyConfig, WorkerConfig, message_handler,
};
use symphony_core::{
    CircuitBreakerConfig, CircuitState, Envelope, EnvelopeStatus, ErrorKind, HandlerError,
    RateLimitConfig, RateLimitRule, RetryConfig, SymphonyEvent,
};

const TAGS: [(&str, &str); 1] = [("message_type", "email.send")];

fn counting_handler(calls: Arc<AtomicUsize>) -> HandlerRegistry {
    HandlerRegistry::new().with(FnHandler::new("email.send", move |_message, _ctx| {
        let calls = calls.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<(), HandlerError>(())
        }) as HandlerFuture
    }))
}

#[tokio::test]
async fn test_success_acknowledges() -> Result<(), Box<dyn Error>> {
    let calls = Arc::new(AtomicUsize::new(0));
    let (runtime, metrics) = common::runtime(SymphonyConfig::default(), counting_handler(calls.clone()));
    let mut events = runtime.observability.subscribe();
    let receipt = runtime
        .dispatcher()
        .dispatch(common::email("a@example.com"), Default::default())
        .await?;

    let pipeline = runtime.pipeline("worker-a", &WorkerConfig::default())?;
    let claimed = common::claim(&runtime, "default", "worker-a").await?;
    assert_eq!(claimed.len(), 1);
    assert_eq!(pipeline.process(claimed[0].clone()).await, ProcessOutcome::Acknowledged);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stored = runtime.admin().get_envelope(receipt.message_id).await?.unwrap();
    assert_eq!(stored.status, EnvelopeStatus::Completed);
    assert!(stored.locked_by.is_none());
    assert!(stored.processed_at.is_some());

    assert_eq!(metrics.counter(SEND_SUCCESS, &TAGS), 1);
    assert_eq!(metrics.counter(SEND_FAILURE, &TAGS), 0);
    assert_eq!(metrics.counter("email_send_success", &TAGS), 1);
    assert_eq!(metrics.timings("email_send_duration", &TAGS).len(), 1);

    let seen = common::drain(&mut events);
    assert!(seen.iter().any(|event| matches!(event, SymphonyEvent::MessageReceived { delivery_count: 1, .. })));
    assert!(seen.iter().any(|event| matches!(event, SymphonyEvent::MessageSent { worker_id, .. } if worker_id == "worker-a")));
    Ok(())
}

#[tokio::test]
async fn test_transient_failure_is_rescheduled() -> Result<(), Box<dyn Error>> {
    let handlers = HandlerRegistry::new().with(message_handler!("email.send", |_message, _ctx| {
        Err(HandlerError::transient("smtp 421"))
    }));
    let (runtime, metrics) = common::runtime(SymphonyConfig::default(), handlers);
    let receipt = runtime
        .dispatcher()
        .dispatch(common::email("a@example.com"), Default::default())
        .await?;
    let pipeline = runtime.pipeline("worker-a", &WorkerConfig::default())?;

    let claimed = common::claim(&runtime, "default", "worker-a").await?;
    let before = Utc::now();
    let ProcessOutcome::Rescheduled { available_at } = pipeline.process(claimed[0].clone()).await
    else {
        panic!("expected a retry");
    };
    // Default backoff starts at one second.
    assert!(available_at > before);

    let stored = runtime.admin().get_envelope(receipt.message_id).await?.unwrap();
    assert_eq!(stored.status, EnvelopeStatus::Pending);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some("smtp 421"));
    assert_eq!(stored.error_class, Some(ErrorKind::Transient));
    assert_eq!(stored.attempts.len(), 1);
    assert_eq!(metrics.counter(SEND_FAILURE, &TAGS), 1);

    // Not claimable until the backoff elapses.
    assert!(common::claim(&runtime, "default", "worker-a").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter() -> Result<(), Box<dyn Error>> {
    let config = SymphonyConfig {
        retry: RetryConfig {
            initial_delay_ms: 0,
            default_max_retries: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let handlers = HandlerRegistry::new().with(message_handler!("email.send", |_message, _ctx| {
        Err(HandlerError::transient("smtp 421"))
    }));
    let (runtime, _) = common::runtime(config, handlers);
    runtime
        .dispatcher()
        .dispatch(common::email("a@example.com"), Default::default())
        .await?;
    let pipeline = runtime.pipeline("worker-a", &WorkerConfig::default())?;

    let claimed = common::claim(&runtime, "default", "worker-a").await?;
    assert!(matches!(
        pipeline.process(claimed[0].clone()).await,
        ProcessOutcome::Rescheduled { .. }
    ));
    let claimed = common::claim(&runtime, "default", "worker-a").await?;
    assert_eq!(claimed[0].retry_count, 1);
    let ProcessOutcome::DeadLettered(failed_id) = pipeline.process(claimed[0].clone()).await else {
        panic!("expected a dead letter");
    };

    let failed = runtime.admin().get_dead_letter(failed_id).await?.unwrap();
    assert_eq!(failed.error_class, ErrorKind::Transient);
    assert_eq!(failed.error_trace.len(), 2);
    assert_eq!(runtime.admin().queue_depth(None, None).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_permanent_failure_and_missing_handler() -> Result<(), Box<dyn Error>> {
    let handlers = HandlerRegistry::new().with(message_handler!("email.send", |_message, _ctx| {
        Err(HandlerError::permanent("mailbox does not exist"))
    }));
    let (runtime, _) = common::runtime(SymphonyConfig::default(), handlers);
    let dispatcher = runtime.dispatcher();
    dispatcher
        .dispatch(common::email("nobody@example.com"), Default::default())
        .await?;
    let orphan = symphony_core::Message::new("push.send", serde_json::json!({ "token": "abc" }))?;
    dispatcher.dispatch(orphan, Default::default()).await?;
    let pipeline = runtime.pipeline("worker-a", &WorkerConfig::default())?;

    let claimed = common::claim(&runtime, "default", "worker-a").await?;
    assert_eq!(claimed.len(), 2);
    for envelope in claimed {
        let outcome = pipeline.process(envelope).await;
        assert!(matches!(outcome, ProcessOutcome::DeadLettered(_)), "{outcome:?}");
    }

    let page = runtime.admin().list_dead_letters(None, 10, 0).await?;
    assert_eq!(page.total, 2);
    assert!(page.items.iter().all(|failed| failed.error_class == ErrorKind::Permanent));
    assert!(page.items.iter().all(|failed| failed.retry_count == 0));
    let orphaned = page
        .items
        .iter()
        .find(|failed| failed.body.message_type == "push.send")
        .unwrap();
    assert!(orphaned.error.contains("no handler registered"));
    Ok(())
}

#[tokio::test]
async fn test_authentication_failure_refreshes_once() -> Result<(), Box<dyn Error>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = seen.clone();
    let handlers = HandlerRegistry::new().with(FnHandler::new("email.send", move |_message, ctx| {
        recorded.lock().unwrap().push(ctx.auth_refresh);
        Box::pin(async { Err::<(), _>(HandlerError::authentication("token expired")) }) as HandlerFuture
    }));
    let (runtime, _) = common::runtime(SymphonyConfig::default(), handlers);
    runtime
        .dispatcher()
        .dispatch(common::email("a@example.com"), Default::default())
        .await?;
    let pipeline = runtime.pipeline("worker-a", &WorkerConfig::default())?;

    let claimed = common::claim(&runtime, "default", "worker-a").await?;
    assert!(matches!(
        pipeline.process(claimed[0].clone()).await,
        ProcessOutcome::Rescheduled { .. }
    ));

    // The refresh attempt is available straight away.
    let claimed = common::claim(&runtime, "default", "worker-a").await?;
    assert_eq!(claimed.len(), 1);
    assert!(claimed[0].auth_refresh_requested());
    assert!(matches!(
        pipeline.process(claimed[0].clone()).await,
        ProcessOutcome::DeadLettered(_)
    ));

    assert_eq!(*seen.lock().unwrap(), vec![false, true]);
    Ok(())
}

#[tokio::test]
async fn test_rate_limited_envelope_is_deferred() -> Result<(), Box<dyn Error>> {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = SymphonyConfig {
        rate_limits: RateLimitConfig {
            sender_rules: Vec::new(),
            global_rules: vec![RateLimitRule::count_per(60_000, 1)],
        },
        ..Default::default()
    };
    let (runtime, _) = common::runtime(config, counting_handler(calls.clone()));
    let dispatcher = runtime.dispatcher();
    dispatcher
        .dispatch(common::email("a@example.com"), Default::default())
        .await?;
    dispatcher
        .dispatch(common::email("b@example.com"), Default::default())
        .await?;
    let pipeline = runtime.pipeline("worker-a", &WorkerConfig::default())?;
    let mut events = runtime.observability.subscribe();

    let claimed = common::claim(&runtime, "default", "worker-a").await?;
    assert_eq!(claimed.len(), 2);
    let mut outcomes = Vec::new();
    for envelope in claimed {
        outcomes.push((envelope.id, pipeline.process(envelope).await));
    }
    assert_eq!(outcomes[0].1, ProcessOutcome::Acknowledged);
    let ProcessOutcome::Deferred { available_at } = outcomes[1].1 else {
        panic!("expected a deferral, got {:?}", outcomes[1].1);
    };
    assert!(available_at > Utc::now());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Deferral does not consume retry budget.
    let deferred = runtime.admin().get_envelope(outcomes[1].0).await?.unwrap();
    assert_eq!(deferred.status, EnvelopeStatus::Pending);
    assert_eq!(deferred.retry_count, 0);
    assert!(deferred.locked_by.is_none());

    let seen = common::drain(&mut events);
    assert!(seen.iter().any(|event| matches!(event, SymphonyEvent::MessageDeferred { reason, .. } if reason.contains("rate limited"))));
    Ok(())
}

#[tokio::test]
async fn test_open_circuit_defers_destination() -> Result<(), Box<dyn Error>> {
    let config = SymphonyConfig {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            reset_timeout_ms: 60_000,
        },
        ..Default::default()
    };
    let handlers = HandlerRegistry::new().with(message_handler!("email.send", |_message, _ctx| {
        Err(HandlerError::transient("connection refused"))
    }));
    let (runtime, _) = common::runtime(config, handlers);
    let dispatcher = runtime.dispatcher();
    for to in ["a@example.com", "b@example.com"] {
        let message = common::email(to).with_metadata("destination", "smtp.example.com");
        dispatcher.dispatch(message, Default::default()).await?;
    }
    let pipeline = runtime.pipeline("worker-a", &WorkerConfig::default())?;
    let mut events = runtime.observability.subscribe();

    let claimed = common::claim(&runtime, "default", "worker-a").await?;
    assert!(matches!(
        pipeline.process(claimed[0].clone()).await,
        ProcessOutcome::Rescheduled { .. }
    ));
    let outcome = pipeline.process(claimed[1].clone()).await;
    assert!(matches!(outcome, ProcessOutcome::Deferred { .. }), "{outcome:?}");

    let circuits = runtime.admin().circuits().await?;
    let (destination, snapshot) = &circuits[0];
    assert_eq!(destination, "smtp.example.com");
    assert_eq!(snapshot.state, CircuitState::Open);

    let seen = common::drain(&mut events);
    assert!(seen.iter().any(|event| matches!(
        event,
        SymphonyEvent::CircuitStateChanged { to: CircuitState::Open, .. }
    )));
    Ok(())
}

#[tokio::test]
async fn test_oversized_message_is_dead_lettered() -> Result<(), Box<dyn Error>> {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = SymphonyConfig {
        rate_limits: RateLimitConfig {
            sender_rules: Vec::new(),
            global_rules: vec![RateLimitRule::count_per(60_000, 100).with_size(10)],
        },
        ..Default::default()
    };
    let (runtime, _) = common::runtime(config, counting_handler(calls.clone()));
    let receipt = runtime
        .dispatcher()
        .dispatch(common::email(&"x".repeat(500)), Default::default())
        .await?;
    let pipeline = runtime.pipeline("worker-a", &WorkerConfig::default())?;

    let claimed = common::claim(&runtime, "default", "worker-a").await?;
    let ProcessOutcome::DeadLettered(failed_id) = pipeline.process(claimed[0].clone()).await else {
        panic!("an oversized message can never be sent");
    };
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(runtime.admin().get_envelope(receipt.message_id).await?.is_none());
    assert!(common::claim(&runtime, "default", "worker-a").await?.is_empty());

    let failed = runtime.admin().get_dead_letter(failed_id).await?.unwrap();
    assert_eq!(failed.error_class, ErrorKind::Permanent);
    assert!(failed.error.contains("10-byte limit"), "{}", failed.error);
    Ok(())
}

#[tokio::test]
async fn test_circuit_deferral_keeps_rate_budget() -> Result<(), Box<dyn Error>> {
    let config = SymphonyConfig {
        rate_limits: RateLimitConfig {
            sender_rules: Vec::new(),
            global_rules: vec![RateLimitRule::count_per(60_000, 2)],
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            reset_timeout_ms: 60_000,
        },
        ..Default::default()
    };
    let handlers = HandlerRegistry::new().with(message_handler!("email.send", |message, _ctx| {
        if message.metadata.get("destination") == Some(&serde_json::json!("smtp.example.com")) {
            Err(HandlerError::transient("connection refused"))
        } else {
            Ok(())
        }
    }));
    let (runtime, _) = common::runtime(config, handlers);
    let dispatcher = runtime.dispatcher();
    for (to, destination) in [
        ("a@example.com", "smtp.example.com"),
        ("b@example.com", "smtp.example.com"),
        ("c@example.com", "relay.example.com"),
    ] {
        let message = common::email(to).with_metadata("destination", destination);
        dispatcher.dispatch(message, Default::default()).await?;
    }
    let pipeline = runtime.pipeline("worker-a", &WorkerConfig::default())?;

    let (failing, healthy): (Vec<Envelope>, Vec<Envelope>) =
        common::claim(&runtime, "default", "worker-a")
            .await?
            .into_iter()
            .partition(|envelope| envelope.message.metadata["destination"] == "smtp.example.com");
    assert_eq!((failing.len(), healthy.len()), (2, 1));

    assert!(matches!(
        pipeline.process(failing[0].clone()).await,
        ProcessOutcome::Rescheduled { .. }
    ));
    assert!(matches!(
        pipeline.process(failing[1].clone()).await,
        ProcessOutcome::Deferred { .. }
    ));
    // Only one send went out, so the second slot of the window is still free.
    assert_eq!(
        pipeline.process(healthy[0].clone()).await,
        ProcessOutcome::Acknowledged
    );
    Ok(())
}

#[tokio::test]
async fn test_timed_out_handler_is_abandoned() -> Result<(), Box<dyn Error>> {
    let handlers = HandlerRegistry::new().with(
        message_handler!("email.send", |_message, _ctx| {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .with_timeout(Duration::from_millis(50)),
    );
    let (runtime, _) = common::runtime(SymphonyConfig::default(), handlers);
    let receipt = runtime
        .dispatcher()
        .dispatch(common::email("a@example.com"), Default::default())
        .await?;
    let pipeline = runtime.pipeline("worker-a", &WorkerConfig::default())?;

    let claimed = common::claim(&runtime, "default", "worker-a").await?;
    assert_eq!(pipeline.process(claimed[0].clone()).await, ProcessOutcome::Abandoned);

    // The lock is left to lapse; the envelope is redelivered after expiry.
    let stored = runtime.admin().get_envelope(receipt.message_id).await?.unwrap();
    assert_eq!(stored.status, EnvelopeStatus::Processing);
    assert_eq!(stored.locked_by.as_deref(), Some("worker-a"));
    assert_eq!(stored.retry_count, 0);
    Ok(())
}

#[tokio::test]
async fn test_repeatedly_claimed_envelope_is_dead_lettered() -> Result<(), Box<dyn Error>> {
    let calls = Arc::new(AtomicUsize::new(0));
    let (runtime, _) = common::runtime(SymphonyConfig::default(), counting_handler(calls.clone()));
    let transport = runtime.transports.get("default").unwrap();

    // Simulates a message that crashed its workers on every previous claim.
    let mut envelope = Envelope::new(common::email("a@example.com"), "default", "default")
        .with_max_retries(1);
    envelope.delivery_count = 2;
    transport.send(envelope).await?;

    let pipeline = runtime.pipeline("worker-a", &WorkerConfig::default())?;
    let claimed = common::claim(&runtime, "default", "worker-a").await?;
    assert_eq!(claimed[0].delivery_count, 3);
    let ProcessOutcome::DeadLettered(failed_id) = pipeline.process(claimed[0].clone()).await else {
        panic!("expected a dead letter");
    };
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let failed = runtime.admin().get_dead_letter(failed_id).await?.unwrap();
    assert_eq!(failed.error_class, ErrorKind::DeliveryExhausted);
    Ok(())
}

#[tokio::test]
async fn test_unknown_worker_transport() {
    let (runtime, _) = common::runtime(SymphonyConfig::default(), HandlerRegistry::new());
    let worker = WorkerConfig {
        transport: Some("missing".into()),
        ..Default::default()
    };
    assert!(runtime.pipeline("worker-a", &worker).is_err());
}
