//! Windowed rate limiting over count, recipients and byte size.
//!
//! Each rule covers a window of `duration_ms`, bucketed at `precision_ms`
//! granularity (defaults to the full duration, i.e. a fixed window). A rule
//! is evaluated against the sum of the buckets that started within the last
//! `duration_ms`. Rules are checked in order and the first violation wins;
//! counters only move when every rule passes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::BoxFuture;
use crate::error::StoreError;

/// Which limiter a window belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterType {
    Sender,
    Global,
}

impl LimiterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterType::Sender => "sender",
            LimiterType::Global => "global",
        }
    }
}

/// Identifies one set of counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LimiterKey {
    pub limiter_type: LimiterType,
    pub identifier: String,
}

impl LimiterKey {
    pub fn sender(identifier: impl Into<String>) -> Self {
        Self {
            limiter_type: LimiterType::Sender,
            identifier: identifier.into(),
        }
    }

    pub fn global() -> Self {
        Self {
            limiter_type: LimiterType::Global,
            identifier: "global".to_string(),
        }
    }
}

impl std::fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.limiter_type.as_str(), self.identifier)
    }
}

/// A single limit over a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub duration_ms: u64,
    #[serde(default)]
    pub precision_ms: Option<u64>,
    /// Maximum sends in the window.
    #[serde(default)]
    pub count: Option<u64>,
    /// Maximum recipients in the window.
    #[serde(default)]
    pub recipients: Option<u64>,
    /// Per-message size ceiling in bytes.
    #[serde(default)]
    pub size: Option<u64>,
    /// Maximum cumulative bytes in the window.
    #[serde(default)]
    pub total_size: Option<u64>,
}

impl RateLimitRule {
    /// A count-only fixed window.
    pub fn count_per(duration_ms: u64, count: u64) -> Self {
        Self {
            duration_ms,
            precision_ms: None,
            count: Some(count),
            recipients: None,
            size: None,
            total_size: None,
        }
    }

    pub fn with_precision(mut self, precision_ms: u64) -> Self {
        self.precision_ms = Some(precision_ms);
        self
    }

    pub fn with_recipients(mut self, recipients: u64) -> Self {
        self.recipients = Some(recipients);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_total_size(mut self, total_size: u64) -> Self {
        self.total_size = Some(total_size);
        self
    }

    /// Bucket granularity, clamped to `1..=duration_ms`.
    pub fn precision(&self) -> u64 {
        let duration = self.duration_ms.max(1);
        self.precision_ms.unwrap_or(duration).clamp(1, duration)
    }

    /// Start of the bucket containing `now_ms`.
    pub fn window_start(&self, now_ms: i64) -> i64 {
        let precision = self.precision() as i64;
        now_ms.div_euclid(precision) * precision
    }
}

/// What a single send adds to the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateIncrement {
    pub count: u64,
    pub recipients: u64,
    pub size: u64,
}

impl RateIncrement {
    pub fn one() -> Self {
        Self {
            count: 1,
            ..Default::default()
        }
    }

    pub fn with_recipients(mut self, recipients: u64) -> Self {
        self.recipients = recipients;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }
}

/// Why a send was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitReason {
    CountExceeded,
    RecipientsExceeded,
    SizeExceeded,
    TotalSizeExceeded,
}

impl RateLimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitReason::CountExceeded => "COUNT_EXCEEDED",
            RateLimitReason::RecipientsExceeded => "RECIPIENTS_EXCEEDED",
            RateLimitReason::SizeExceeded => "SIZE_EXCEEDED",
            RateLimitReason::TotalSizeExceeded => "TOTAL_SIZE_EXCEEDED",
        }
    }
}

impl std::fmt::Display for RateLimitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub reason: Option<RateLimitReason>,
    pub limit: Option<u64>,
    pub current: Option<u64>,
    /// When the violated window frees up capacity. `None` for per-message size violations.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            limit: None,
            current: None,
            reset_at: None,
        }
    }
}

/// Running totals for one bucket of one rule window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub duration_ms: u64,
    pub precision_ms: u64,
    /// Bucket start, epoch milliseconds.
    pub window_start: i64,
    pub count: u64,
    pub recipients: u64,
    /// Largest single message seen in the bucket.
    pub size: u64,
    pub total_size: u64,
    /// `window_start + duration_ms`, epoch milliseconds.
    pub expires_at: i64,
}

impl WindowEntry {
    fn new(rule: &RateLimitRule, window_start: i64) -> Self {
        Self {
            duration_ms: rule.duration_ms,
            precision_ms: rule.precision(),
            window_start,
            count: 0,
            recipients: 0,
            size: 0,
            total_size: 0,
            expires_at: window_start.saturating_add(rule.duration_ms as i64),
        }
    }

    fn belongs_to(&self, rule: &RateLimitRule) -> bool {
        self.duration_ms == rule.duration_ms && self.precision_ms == rule.precision()
    }

    /// Whether this bucket still counts toward its window at `now_ms`.
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }
}

/// Result of evaluating rules against existing windows.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: RateLimitDecision,
    /// Buckets to upsert when the decision allows the send. Empty otherwise.
    pub updates: Vec<WindowEntry>,
}

fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Evaluate `rules` in order against `entries` (live or not) at `now`.
///
/// Pure so that every store implementation applies identical semantics.
pub fn evaluate(
    rules: &[RateLimitRule],
    entries: &[WindowEntry],
    increment: RateIncrement,
    now: DateTime<Utc>,
) -> Evaluation {
    let now_ms = now.timestamp_millis();

    for rule in rules {
        let live: Vec<&WindowEntry> = entries
            .iter()
            .filter(|entry| entry.belongs_to(rule) && entry.is_live(now_ms))
            .collect();

        let count: u64 = live.iter().map(|entry| entry.count).sum();
        let recipients: u64 = live.iter().map(|entry| entry.recipients).sum();
        let total_size: u64 = live.iter().map(|entry| entry.total_size).sum();

        let window_reset = live
            .iter()
            .map(|entry| entry.expires_at)
            .min()
            .unwrap_or_else(|| rule.window_start(now_ms) + rule.duration_ms as i64);

        let violation = if let Some(limit) = rule.count
            && count.saturating_add(increment.count) > limit
        {
            Some((RateLimitReason::CountExceeded, limit, count, Some(window_reset)))
        } else if let Some(limit) = rule.recipients
            && recipients.saturating_add(increment.recipients) > limit
        {
            Some((
                RateLimitReason::RecipientsExceeded,
                limit,
                recipients,
                Some(window_reset),
            ))
        } else if let Some(limit) = rule.size
            && increment.size > limit
        {
            Some((RateLimitReason::SizeExceeded, limit, increment.size, None))
        } else if let Some(limit) = rule.total_size
            && total_size.saturating_add(increment.size) > limit
        {
            Some((
                RateLimitReason::TotalSizeExceeded,
                limit,
                total_size,
                Some(window_reset),
            ))
        } else {
            None
        };

        if let Some((reason, limit, current, reset_ms)) = violation {
            return Evaluation {
                decision: RateLimitDecision {
                    allowed: false,
                    reason: Some(reason),
                    limit: Some(limit),
                    current: Some(current),
                    reset_at: reset_ms.and_then(ms_to_datetime),
                },
                updates: Vec::new(),
            };
        }
    }

    // Rules sharing a window share one bucket, so each bucket moves once.
    let mut updates: Vec<WindowEntry> = Vec::new();
    for rule in rules {
        let start = rule.window_start(now_ms);
        if updates
            .iter()
            .any(|entry| entry.belongs_to(rule) && entry.window_start == start)
        {
            continue;
        }

        let mut bucket = entries
            .iter()
            .find(|entry| entry.belongs_to(rule) && entry.window_start == start)
            .cloned()
            .unwrap_or_else(|| WindowEntry::new(rule, start));

        bucket.count = bucket.count.saturating_add(increment.count);
        bucket.recipients = bucket.recipients.saturating_add(increment.recipients);
        bucket.total_size = bucket.total_size.saturating_add(increment.size);
        bucket.size = bucket.size.max(increment.size);
        updates.push(bucket);
    }

    Evaluation {
        decision: RateLimitDecision::allow(),
        updates,
    }
}

/// Storage for window counters. `check_and_increment` must be atomic per call.
pub trait RateLimitStore: Send + Sync + 'static {
    fn check_and_increment<'a>(
        &'a self,
        key: &'a LimiterKey,
        increment: RateIncrement,
        rules: &'a [RateLimitRule],
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<RateLimitDecision, StoreError>>;
}

/// Minimum gap between sweeps of keys other than the one being checked.
const SWEEP_INTERVAL_MS: i64 = 1_000;

#[derive(Debug, Default)]
struct Windows {
    by_key: HashMap<LimiterKey, Vec<WindowEntry>>,
    swept_at: i64,
}

/// Single-process window store. Keys whose buckets have all expired are dropped.
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    windows: Mutex<Windows>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live buckets held for `key`.
    pub fn bucket_count(&self, key: &LimiterKey) -> usize {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.by_key.get(key).map_or(0, Vec::len)
    }

    /// Number of keys currently holding buckets.
    pub fn key_count(&self) -> usize {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.by_key.len()
    }

    fn check_now(
        &self,
        key: &LimiterKey,
        increment: RateIncrement,
        rules: &[RateLimitRule],
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let now_ms = now.timestamp_millis();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        if now_ms.saturating_sub(windows.swept_at) >= SWEEP_INTERVAL_MS {
            windows.by_key.retain(|_, entries| {
                entries.retain(|entry| entry.is_live(now_ms));
                !entries.is_empty()
            });
            windows.swept_at = now_ms;
        }

        let mut entries = windows.by_key.remove(key).unwrap_or_default();
        entries.retain(|entry| entry.is_live(now_ms));

        let evaluation = evaluate(rules, &entries, increment, now);
        for update in evaluation.updates {
            match entries.iter_mut().find(|entry| {
                entry.duration_ms == update.duration_ms
                    && entry.precision_ms == update.precision_ms
                    && entry.window_start == update.window_start
            }) {
                Some(existing) => *existing = update,
                None => entries.push(update),
            }
        }
        if !entries.is_empty() {
            windows.by_key.insert(key.clone(), entries);
        }

        evaluation.decision
    }
}

impl RateLimitStore for MemoryRateLimitStore {
    fn check_and_increment<'a>(
        &'a self,
        key: &'a LimiterKey,
        increment: RateIncrement,
        rules: &'a [RateLimitRule],
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<RateLimitDecision, StoreError>> {
        let decision = self.check_now(key, increment, rules, now);
        Box::pin(async move { Ok(decision) })
    }
}

/// Sender and global rule sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub sender_rules: Vec<RateLimitRule>,
    pub global_rules: Vec<RateLimitRule>,
}

impl RateLimitConfig {
    pub fn is_empty(&self) -> bool {
        self.sender_rules.is_empty() && self.global_rules.is_empty()
    }
}

/// Which limiter rejected a send.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimited {
    pub key: LimiterKey,
    pub decision: RateLimitDecision,
}

/// Applies the per-sender and global limiters before a handler invocation.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// In-process limiter backed by a [`MemoryRateLimitStore`].
    pub fn in_memory(config: RateLimitConfig) -> Self {
        Self::new(Arc::new(MemoryRateLimitStore::new()), config)
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check one key against explicit rules.
    pub async fn check_rate_limit(
        &self,
        key: &LimiterKey,
        increment: RateIncrement,
        rules: &[RateLimitRule],
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, StoreError> {
        if rules.is_empty() {
            return Ok(RateLimitDecision::allow());
        }
        self.store
            .check_and_increment(key, increment, rules, now)
            .await
    }

    /// Apply the sender limiter (when a sender is known) and then the global limiter.
    ///
    /// Returns `Ok(None)` when the send may proceed.
    pub async fn check_send(
        &self,
        sender: Option<&str>,
        increment: RateIncrement,
        now: DateTime<Utc>,
    ) -> Result<Option<RateLimited>, StoreError> {
        if let Some(sender) = sender
            && !self.config.sender_rules.is_empty()
        {
            let key = LimiterKey::sender(sender);
            let decision = self
                .check_rate_limit(&key, increment, &self.config.sender_rules, now)
                .await?;
            if !decision.allowed {
                return Ok(Some(RateLimited { key, decision }));
            }
        }

        if !self.config.global_rules.is_empty() {
            let key = LimiterKey::global();
            let decision = self
                .check_rate_limit(&key, increment, &self.config.global_rules, now)
                .await?;
            if !decision.allowed {
                return Ok(Some(RateLimited { key, decision }));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(ms: i64) -> DateTime<Utc> {
        ms_to_datetime(ms).unwrap()
    }

    #[tokio::test]
    async fn sixth_send_in_minute_is_rejected() {
        let limiter = RateLimiter::in_memory(RateLimitConfig::default());
        let key = LimiterKey::sender("mailbox-1");
        let rules = [RateLimitRule::count_per(60_000, 5)];
        let start = at(1_700_000_040_000);

        for i in 0..5 {
            let decision = limiter
                .check_rate_limit(&key, RateIncrement::one(), &rules, start + Duration::seconds(i))
                .await
                .unwrap();
            assert!(decision.allowed, "send {i} should pass");
        }

        let sixth = limiter
            .check_rate_limit(&key, RateIncrement::one(), &rules, start + Duration::seconds(6))
            .await
            .unwrap();
        assert!(!sixth.allowed);
        assert_eq!(sixth.reason, Some(RateLimitReason::CountExceeded));
        assert_eq!(sixth.limit, Some(5));
        assert_eq!(sixth.current, Some(5));

        let reset_at = sixth.reset_at.unwrap();
        let after_reset = limiter
            .check_rate_limit(&key, RateIncrement::one(), &rules, reset_at)
            .await
            .unwrap();
        assert!(after_reset.allowed);
    }

    #[test]
    fn rejection_does_not_increment_any_rule() {
        let rules = [
            RateLimitRule::count_per(60_000, 100),
            RateLimitRule::count_per(3_600_000, 1_000).with_recipients(2),
        ];
        let now = at(0);
        let eval = evaluate(&rules, &[], RateIncrement::one().with_recipients(3), now);
        assert!(!eval.decision.allowed);
        assert_eq!(eval.decision.reason, Some(RateLimitReason::RecipientsExceeded));
        assert!(eval.updates.is_empty());
    }

    #[test]
    fn first_violated_rule_wins() {
        let rules = [
            RateLimitRule::count_per(60_000, 10).with_size(100),
            RateLimitRule::count_per(60_000, 0),
        ];
        let eval = evaluate(&rules, &[], RateIncrement::one().with_size(500), at(0));
        assert_eq!(eval.decision.reason, Some(RateLimitReason::SizeExceeded));
        assert_eq!(eval.decision.reset_at, None);
    }

    #[test]
    fn total_size_accumulates() {
        let store = MemoryRateLimitStore::new();
        let key = LimiterKey::global();
        let rules = [RateLimitRule {
            duration_ms: 60_000,
            precision_ms: None,
            count: None,
            recipients: None,
            size: None,
            total_size: Some(1_000),
        }];
        let inc = RateIncrement::one().with_size(400);
        assert!(store.check_now(&key, inc, &rules, at(0)).allowed);
        assert!(store.check_now(&key, inc, &rules, at(1)).allowed);
        let third = store.check_now(&key, inc, &rules, at(2));
        assert_eq!(third.reason, Some(RateLimitReason::TotalSizeExceeded));
        assert_eq!(third.current, Some(800));
    }

    #[test]
    fn sliding_buckets_expire_individually() {
        let store = MemoryRateLimitStore::new();
        let key = LimiterKey::sender("s");
        let rules = [RateLimitRule::count_per(60_000, 2).with_precision(10_000)];

        assert!(store.check_now(&key, RateIncrement::one(), &rules, at(0)).allowed);
        assert!(store.check_now(&key, RateIncrement::one(), &rules, at(30_000)).allowed);
        let denied = store.check_now(&key, RateIncrement::one(), &rules, at(45_000));
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at, Some(at(60_000)));

        // The bucket at t=0 has expired; the one at t=30s still counts.
        assert!(store.check_now(&key, RateIncrement::one(), &rules, at(60_000)).allowed);
        assert!(!store.check_now(&key, RateIncrement::one(), &rules, at(61_000)).allowed);
    }

    #[test]
    fn expired_windows_are_evicted_on_access() {
        let store = MemoryRateLimitStore::new();
        let key = LimiterKey::sender("s");
        let rules = [RateLimitRule::count_per(1_000, 10)];
        store.check_now(&key, RateIncrement::one(), &rules, at(0));
        assert_eq!(store.bucket_count(&key), 1);
        store.check_now(&key, RateIncrement::one(), &rules, at(5_000));
        assert_eq!(store.bucket_count(&key), 1);
    }

    #[test]
    fn idle_keys_are_dropped() {
        let store = MemoryRateLimitStore::new();
        let rules = [RateLimitRule::count_per(1_000, 10)];
        for sender in ["a", "b", "c"] {
            store.check_now(&LimiterKey::sender(sender), RateIncrement::one(), &rules, at(0));
        }
        assert_eq!(store.key_count(), 3);

        store.check_now(&LimiterKey::sender("d"), RateIncrement::one(), &rules, at(5_000));
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.bucket_count(&LimiterKey::sender("a")), 0);

        // A rejected first send leaves nothing behind.
        let sized = [RateLimitRule::count_per(1_000, 10).with_size(10)];
        let oversized = RateIncrement::one().with_size(500);
        let denied = store.check_now(&LimiterKey::sender("e"), oversized, &sized, at(5_001));
        assert!(!denied.allowed);
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test]
    async fn global_limiter_applies_without_sender() {
        let limiter = RateLimiter::in_memory(RateLimitConfig {
            sender_rules: vec![RateLimitRule::count_per(60_000, 100)],
            global_rules: vec![RateLimitRule::count_per(60_000, 1)],
        });
        let now = at(0);
        assert!(
            limiter
                .check_send(None, RateIncrement::one(), now)
                .await
                .unwrap()
                .is_none()
        );
        let limited = limiter
            .check_send(Some("mailbox-1"), RateIncrement::one(), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(limited.key, LimiterKey::global());
    }
}
