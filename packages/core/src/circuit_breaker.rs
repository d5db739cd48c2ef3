//! Per-destination circuit breaker.
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open --(reset_timeout elapsed, next acquire)--> HalfOpen (one trial in flight)
//! HalfOpen --(success_threshold successes)--> Closed
//! HalfOpen --(failure)--> Open (timer restarts)
//! ```
//!
//! State lives behind a [`CircuitStore`] so several worker processes can share
//! one view of a destination. Updates are optimistic: load, apply the
//! transition, then compare-and-swap on the snapshot version.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::BoxFuture;
use crate::envelope::add_duration;
use crate::error::StoreError;

const MAX_CAS_ATTEMPTS: usize = 16;

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes needed to close again.
    pub success_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    #[default]
    Closed,
    /// Calls are rejected without reaching the destination.
    Open,
    /// A single trial call probes the destination.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state for one destination key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub opened_at: Option<DateTime<Utc>>,
    /// Start of the in-flight half-open trial, if any.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub trial_started_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token. 0 means never stored.
    #[serde(default)]
    pub version: u64,
}

/// A state change worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

impl CircuitSnapshot {
    fn transition_to(&mut self, to: CircuitState) -> Option<Transition> {
        let from = self.state;
        self.state = to;
        (from != to).then_some(Transition { from, to })
    }

    /// Ask to make a call at `now`. `Err` carries when the next attempt may succeed.
    pub fn try_acquire(
        &mut self,
        config: &CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> (Result<(), DateTime<Utc>>, Option<Transition>) {
        let timeout = config.reset_timeout();
        match self.state {
            CircuitState::Closed => (Ok(()), None),
            CircuitState::Open => {
                let reopen_at = add_duration(self.opened_at.unwrap_or(now), timeout);
                if now >= reopen_at {
                    self.consecutive_successes = 0;
                    self.trial_started_at = Some(now);
                    (Ok(()), self.transition_to(CircuitState::HalfOpen))
                } else {
                    (Err(reopen_at), None)
                }
            }
            CircuitState::HalfOpen => match self.trial_started_at {
                // A trial that never reported back within the timeout is abandoned.
                Some(started) if now < add_duration(started, timeout) => {
                    (Err(add_duration(started, timeout)), None)
                }
                _ => {
                    self.trial_started_at = Some(now);
                    (Ok(()), None)
                }
            },
        }
    }

    pub fn record_success(&mut self, config: &CircuitBreakerConfig) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                self.trial_started_at = None;
                if self.consecutive_successes >= config.success_threshold.max(1) {
                    self.consecutive_failures = 0;
                    self.consecutive_successes = 0;
                    self.opened_at = None;
                    self.transition_to(CircuitState::Closed)
                } else {
                    None
                }
            }
            // Late result from a call admitted before the circuit opened.
            CircuitState::Open => None,
        }
    }

    pub fn record_failure(
        &mut self,
        config: &CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= config.failure_threshold.max(1) {
                    self.opened_at = Some(now);
                    self.transition_to(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;
                self.trial_started_at = None;
                self.opened_at = Some(now);
                self.transition_to(CircuitState::Open)
            }
            CircuitState::Open => None,
        }
    }
}

/// Storage for circuit snapshots.
pub trait CircuitStore: Send + Sync + 'static {
    fn load<'a>(&'a self, key: &'a str)
    -> BoxFuture<'a, Result<Option<CircuitSnapshot>, StoreError>>;

    /// Store `next` only if the stored version still equals `expected_version`.
    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        expected_version: u64,
        next: &'a CircuitSnapshot,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    fn list<'a>(&'a self) -> BoxFuture<'a, Result<Vec<(String, CircuitSnapshot)>, StoreError>>;
}

/// Single-process circuit store.
#[derive(Debug, Default)]
pub struct MemoryCircuitStore {
    circuits: Mutex<HashMap<String, CircuitSnapshot>>,
}

impl MemoryCircuitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CircuitStore for MemoryCircuitStore {
    fn load<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<CircuitSnapshot>, StoreError>> {
        let snapshot = self
            .circuits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        Box::pin(async move { Ok(snapshot) })
    }

    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        expected_version: u64,
        next: &'a CircuitSnapshot,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        let current = circuits.get(key).map_or(0, |snapshot| snapshot.version);
        let swapped = current == expected_version;
        if swapped {
            circuits.insert(key.to_string(), next.clone());
        }
        Box::pin(async move { Ok(swapped) })
    }

    fn list<'a>(&'a self) -> BoxFuture<'a, Result<Vec<(String, CircuitSnapshot)>, StoreError>> {
        let mut all: Vec<_> = self
            .circuits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, snapshot)| (key.clone(), snapshot.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Box::pin(async move { Ok(all) })
    }
}

/// Errors from guarded calls.
#[derive(Debug, Error)]
pub enum CircuitError {
    #[error("circuit for '{key}' is open until {retry_at}")]
    Open {
        key: String,
        retry_at: DateTime<Utc>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Circuit breakers keyed by destination, sharing one store and config.
#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn CircuitStore>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn CircuitStore>, config: CircuitBreakerConfig) -> Self {
        Self { store, config }
    }

    pub fn in_memory(config: CircuitBreakerConfig) -> Self {
        Self::new(Arc::new(MemoryCircuitStore::new()), config)
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    async fn modify<R>(
        &self,
        key: &str,
        mut apply: impl FnMut(&mut CircuitSnapshot) -> (R, Option<Transition>),
    ) -> Result<R, StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.load(key).await?.unwrap_or_default();
            let mut next = current.clone();
            let (result, transition) = apply(&mut next);
            if next == current {
                return Ok(result);
            }

            next.version = current.version + 1;
            if self.store.compare_and_swap(key, current.version, &next).await? {
                if let Some(Transition { from, to }) = transition {
                    match to {
                        CircuitState::Open => tracing::warn!(
                            destination = %key,
                            %from,
                            failures = next.consecutive_failures,
                            reset_timeout_ms = self.config.reset_timeout_ms,
                            "Circuit breaker opened"
                        ),
                        _ => tracing::info!(destination = %key, %from, %to, "Circuit breaker state changed"),
                    }
                }
                return Ok(result);
            }
        }
        Err(StoreError::Conflict(format!(
            "circuit '{key}' kept changing under concurrent updates"
        )))
    }

    /// Admit or reject a call to `key` at `now`.
    pub async fn acquire_at(&self, key: &str, now: DateTime<Utc>) -> Result<(), CircuitError> {
        let config = &self.config;
        let admitted = self
            .modify(key, |snapshot| snapshot.try_acquire(config, now))
            .await?;
        admitted.map_err(|retry_at| CircuitError::Open {
            key: key.to_string(),
            retry_at,
        })
    }

    /// Whether `acquire_at` would admit a call, without taking the half-open trial.
    pub async fn check_at(&self, key: &str, now: DateTime<Utc>) -> Result<(), CircuitError> {
        let mut snapshot = self.snapshot(key).await?;
        let (admitted, _) = snapshot.try_acquire(&self.config, now);
        admitted.map_err(|retry_at| CircuitError::Open {
            key: key.to_string(),
            retry_at,
        })
    }

    pub async fn acquire(&self, key: &str) -> Result<(), CircuitError> {
        self.acquire_at(key, Utc::now()).await
    }

    /// Record a successful call. Returns the state change it caused, if any.
    pub async fn record_success(&self, key: &str) -> Result<Option<Transition>, StoreError> {
        let config = &self.config;
        self.modify(key, |snapshot| {
            let transition = snapshot.record_success(config);
            (transition, transition)
        })
        .await
    }

    pub async fn record_failure_at(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, StoreError> {
        let config = &self.config;
        self.modify(key, |snapshot| {
            let transition = snapshot.record_failure(config, now);
            (transition, transition)
        })
        .await
    }

    /// Record a failed call. Returns the state change it caused, if any.
    pub async fn record_failure(&self, key: &str) -> Result<Option<Transition>, StoreError> {
        self.record_failure_at(key, Utc::now()).await
    }

    pub async fn snapshot(&self, key: &str) -> Result<CircuitSnapshot, StoreError> {
        Ok(self.store.load(key).await?.unwrap_or_default())
    }

    pub async fn state(&self, key: &str) -> Result<CircuitState, StoreError> {
        Ok(self.snapshot(key).await?.state)
    }

    pub async fn list(&self) -> Result<Vec<(String, CircuitSnapshot)>, StoreError> {
        self.store.list().await
    }

    /// Run `call` through the breaker. Every `Err` counts as a failure.
    pub async fn call<T, E, F>(&self, key: &str, call: F) -> Result<Result<T, E>, CircuitError>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.acquire(key).await?;
        let result = call.await;
        match &result {
            Ok(_) => self.record_success(key).await?,
            Err(_) => self.record_failure(key).await?,
        };
        Ok(result)
    }
}
