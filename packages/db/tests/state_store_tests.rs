#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use symphony_core::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, LimiterKey, RateIncrement,
    RateLimitReason, RateLimitRule, RateLimitStore, ScheduleDefinition, ScheduleKind,
    ScheduleStore,
};
use symphony_db::{SurrealCircuitStore, SurrealRateLimitStore, SurrealScheduleStore};

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
}

#[tokio::test]
async fn test_schedule_store() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;
    let store = SurrealScheduleStore;
    let now = at(9, 0);

    let interval = ScheduleDefinition::new(
        "calendar.sync",
        ScheduleKind::Interval {
            every_ms: 60_000,
            start_at: Some(now),
        },
        now,
    )?
    .with_queue("sync");
    let later = ScheduleDefinition::new("report.send", ScheduleKind::Once { at: at(12, 0) }, now)?;
    store.insert(&interval).await?;
    store.insert(&later).await?;
    assert!(store.insert(&interval).await.is_err());

    let loaded = store.get(interval.id).await?.unwrap();
    assert_eq!(loaded, interval);
    assert_eq!(store.list().await?.len(), 2);

    let due = store.due(now, 10).await?;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, interval.id);

    // Two schedulers race to advance the same slot; only one wins.
    let expected = due[0].next_run_at;
    let mut first = due[0].clone();
    first.advance(now)?;
    let mut second = due[0].clone();
    second.advance(now)?;
    assert!(store.advance(&first, expected).await?);
    assert!(!store.advance(&second, expected).await?);

    let advanced = store.get(interval.id).await?.unwrap();
    assert_eq!(advanced.run_count, 1);
    assert_eq!(advanced.next_run_at, Some(at(9, 1)));
    assert!(store.due(now, 10).await?.is_empty());

    let mut disabled = advanced.clone();
    disabled.set_enabled(false, now)?;
    store.update(&disabled).await?;
    assert!(store.due(at(23, 0), 10).await?.iter().all(|d| d.id != interval.id));

    assert!(store.delete(later.id).await?);
    assert!(!store.delete(later.id).await?);
    assert!(store.get(later.id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_rate_limit_store() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;
    let store = SurrealRateLimitStore;
    let key = LimiterKey::sender("mailbox-1");
    let rules = [RateLimitRule::count_per(60_000, 2)];
    let start = Utc.timestamp_millis_opt(1_700_000_040_000).unwrap();

    for offset in 0..2 {
        let decision = store
            .check_and_increment(
                &key,
                RateIncrement::one(),
                &rules,
                start + chrono::Duration::seconds(offset),
            )
            .await?;
        assert!(decision.allowed);
    }

    let denied = store
        .check_and_increment(&key, RateIncrement::one(), &rules, start + chrono::Duration::seconds(5))
        .await?;
    assert!(!denied.allowed);
    assert_eq!(denied.reason, Some(RateLimitReason::CountExceeded));
    assert_eq!(denied.current, Some(2));

    // Other keys have their own windows.
    let other = store
        .check_and_increment(&LimiterKey::global(), RateIncrement::one(), &rules, start)
        .await?;
    assert!(other.allowed);

    let reset = store
        .check_and_increment(&key, RateIncrement::one(), &rules, denied.reset_at.unwrap())
        .await?;
    assert!(reset.allowed);
    Ok(())
}

#[tokio::test]
async fn test_circuit_store() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;
    let breaker = CircuitBreaker::new(
        Arc::new(SurrealCircuitStore),
        CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            reset_timeout_ms: 1_000,
        },
    );
    let start = at(9, 0);

    breaker.acquire_at("smtp", start).await?;
    breaker.record_failure_at("smtp", start).await?;
    assert_eq!(breaker.state("smtp").await?, CircuitState::Closed);
    breaker.record_failure_at("smtp", start).await?;
    assert_eq!(breaker.state("smtp").await?, CircuitState::Open);
    assert!(breaker.acquire_at("smtp", start).await.is_err());

    // Another breaker over the same table sees the open circuit.
    let peer = CircuitBreaker::new(Arc::new(SurrealCircuitStore), breaker.config().clone());
    assert!(peer.acquire_at("smtp", start).await.is_err());

    let later = start + chrono::Duration::seconds(2);
    peer.acquire_at("smtp", later).await?;
    assert_eq!(breaker.state("smtp").await?, CircuitState::HalfOpen);
    peer.record_success("smtp").await?;
    assert_eq!(breaker.state("smtp").await?, CircuitState::Closed);

    let listed = breaker.list().await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].0, "smtp");
    Ok(())
}
