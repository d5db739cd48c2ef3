//! Retry classification and exponential backoff.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::envelope::Envelope;
use crate::error::{ErrorKind, HandlerError};

/// Configuration for exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Growth factor per retry.
    pub multiplier: f64,
    /// Upper bound for any computed delay.
    pub max_delay_ms: u64,
    /// Retry budget for message types without an override.
    pub default_max_retries: u32,
    /// Per message type retry budgets.
    pub max_retries_by_type: HashMap<String, u32>,
    /// Fraction (0.0-1.0) of the delay that may be shaved off at random.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
            default_max_retries: 3,
            max_retries_by_type: HashMap::new(),
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// What to do with an envelope whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reschedule after `delay`, consuming one retry.
    Retry { delay: Duration },
    /// Move to the dead-letter store.
    DeadLetter,
}

/// Pluggable retry policy.
pub trait RetryStrategy: Send + Sync + 'static {
    /// Whether an error of `kind` may be retried for this envelope at all.
    fn is_retryable(&self, kind: ErrorKind, envelope: &Envelope) -> bool;

    /// Delay before the retry that follows `retry_count` previous retries.
    fn get_delay(&self, retry_count: u32) -> Duration;

    /// Retry budget for newly dispatched messages of this type.
    fn get_max_retries(&self, message_type: &str) -> u32;

    /// Combine classification, remaining budget and backoff into a decision.
    fn decide(&self, error: &HandlerError, kind: ErrorKind, envelope: &Envelope) -> RetryDecision {
        if !self.is_retryable(kind, envelope) || envelope.retry_count >= envelope.max_retries {
            return RetryDecision::DeadLetter;
        }

        // The refresh path retries straight away; the handler renews credentials first.
        let computed = if kind == ErrorKind::Authentication {
            Duration::ZERO
        } else {
            self.get_delay(envelope.retry_count)
        };
        let delay = error.retry_after.map_or(computed, |hint| hint.max(computed));

        RetryDecision::Retry { delay }
    }
}

/// `delay = min(initial * multiplier^retry_count, max_delay)`, optionally jittered downwards.
#[derive(Debug, Clone, Default)]
pub struct ExponentialBackoff {
    config: RetryConfig,
}

impl ExponentialBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Un-jittered delay for `retry_count`.
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        let initial_ms = self.config.initial_delay_ms as f64;
        let max_ms = self.config.max_delay_ms as f64;
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let delay_ms = (initial_ms * self.config.multiplier.powi(exponent)).min(max_ms);

        if delay_ms.is_finite() && delay_ms >= 0.0 {
            Duration::from_millis(delay_ms as u64)
        } else {
            self.config.max_delay()
        }
    }

    /// Delay with an explicit jitter sample in `[0.0, 1.0)`.
    pub fn delay_with_jitter(&self, retry_count: u32, sample: f64) -> Duration {
        let base = self.base_delay(retry_count);
        let factor = self.config.jitter_factor.clamp(0.0, 1.0);
        if factor == 0.0 {
            return base;
        }
        base.mul_f64(1.0 - factor * sample.clamp(0.0, 1.0))
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn is_retryable(&self, kind: ErrorKind, envelope: &Envelope) -> bool {
        match kind {
            ErrorKind::Transient => true,
            ErrorKind::Authentication => !envelope.auth_refresh_requested(),
            ErrorKind::Permanent | ErrorKind::DeliveryExhausted => false,
        }
    }

    fn get_delay(&self, retry_count: u32) -> Duration {
        self.delay_with_jitter(retry_count, jitter_sample())
    }

    fn get_max_retries(&self, message_type: &str) -> u32 {
        self.config
            .max_retries_by_type
            .get(message_type)
            .copied()
            .unwrap_or(self.config.default_max_retries)
    }
}

/// Uniform sample in `[0.0, 1.0)` taken from the 80 random bits of a fresh ULID.
fn jitter_sample() -> f64 {
    let random = Ulid::new().random();
    random as f64 / (1u128 << 80) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use serde_json::json;

    fn envelope() -> Envelope {
        Envelope::new(
            Message::new("email.send", json!({})).unwrap(),
            "default",
            "emails",
        )
    }

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(RetryConfig {
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1_000,
            ..Default::default()
        })
    }

    #[test]
    fn delays_grow_and_cap() {
        let b = backoff();
        assert_eq!(b.get_delay(0), Duration::from_millis(100));
        assert_eq!(b.get_delay(1), Duration::from_millis(200));
        assert_eq!(b.get_delay(3), Duration::from_millis(800));
        assert_eq!(b.get_delay(4), Duration::from_millis(1_000));
        assert_eq!(b.get_delay(500), Duration::from_millis(1_000));
    }

    #[test]
    fn delays_are_monotonic_and_bounded() {
        let b = backoff();
        let mut previous = Duration::ZERO;
        for retry in 0..64 {
            let delay = b.get_delay(retry);
            assert!(delay >= previous, "retry {retry} went backwards");
            assert!(delay <= Duration::from_millis(1_000));
            previous = delay;
        }
    }

    #[test]
    fn jitter_never_exceeds_max() {
        let b = ExponentialBackoff::new(RetryConfig {
            jitter_factor: 0.5,
            ..backoff().config().clone()
        });
        for retry in 0..10 {
            assert!(b.get_delay(retry) <= Duration::from_millis(1_000));
        }
        assert_eq!(b.delay_with_jitter(0, 1.0), Duration::from_millis(50));
    }

    #[test]
    fn permanent_errors_skip_budget() {
        let b = backoff();
        let env = envelope();
        let decision = b.decide(&HandlerError::permanent("bad address"), ErrorKind::Permanent, &env);
        assert_eq!(decision, RetryDecision::DeadLetter);
    }

    #[test]
    fn exhausted_budget_dead_letters() {
        let b = backoff();
        let mut env = envelope();
        env.retry_count = env.max_retries;
        let decision = b.decide(&HandlerError::transient("503"), ErrorKind::Transient, &env);
        assert_eq!(decision, RetryDecision::DeadLetter);
    }

    #[test]
    fn authentication_retries_once() {
        let b = backoff();
        let mut env = envelope();
        let err = HandlerError::authentication("token expired");
        assert_eq!(
            b.decide(&err, ErrorKind::Authentication, &env),
            RetryDecision::Retry {
                delay: Duration::ZERO
            }
        );

        env.headers.insert(
            crate::envelope::AUTH_REFRESH_HEADER.to_string(),
            "true".to_string(),
        );
        assert_eq!(
            b.decide(&err, ErrorKind::Authentication, &env),
            RetryDecision::DeadLetter
        );
    }

    #[test]
    fn retry_after_hint_extends_delay() {
        let b = backoff();
        let env = envelope();
        let err = HandlerError::transient("429").with_retry_after(Duration::from_secs(30));
        assert_eq!(
            b.decide(&err, ErrorKind::Transient, &env),
            RetryDecision::Retry {
                delay: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn per_type_budget() {
        let mut config = RetryConfig::default();
        config.max_retries_by_type.insert("calendar.sync".into(), 8);
        let b = ExponentialBackoff::new(config);
        assert_eq!(b.get_max_retries("calendar.sync"), 8);
        assert_eq!(b.get_max_retries("email.send"), 3);
    }
}
