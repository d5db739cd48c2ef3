//! Process configuration.
//!
//! Loaded from an optional JSON file named by `SYMPHONY_CONFIG`, with a few
//! environment overrides applied on top.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use symphony_core::{CircuitBreakerConfig, RateLimitConfig, RateLimitRule, RetryConfig};
use symphony_db::DbConfig;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Routes a message type to a transport and queue when the producer names neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Exact type, or a prefix ending in `*` such as `email.*`.
    pub message_type: String,
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
}

impl RoutingRule {
    pub fn matches(&self, message_type: &str) -> bool {
        match self.message_type.strip_suffix('*') {
            Some(prefix) => message_type.starts_with(prefix),
            None => self.message_type == message_type,
        }
    }
}

/// One worker binding: which queue to poll and how hard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Transport to poll. Falls back to `default_transport`.
    pub transport: Option<String>,
    pub queue: String,
    /// Worker actors to start for this binding.
    pub instances: usize,
    /// Concurrent handler invocations per worker.
    pub max_concurrency: usize,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub lock_duration_secs: u64,
    pub handler_timeout_secs: u64,
    pub drain_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            transport: None,
            queue: "default".to_string(),
            instances: 1,
            max_concurrency: 10,
            batch_size: 10,
            poll_interval_ms: 1_000,
            lock_duration_secs: 300,
            handler_timeout_secs: 60,
            drain_timeout_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Scheduler loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    /// Due schedules fired per tick.
    pub batch_size: usize,
    /// Completed envelopes older than this are purged. `None` keeps them.
    pub completed_retention_secs: Option<u64>,
    pub purge_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 1_000,
            batch_size: 100,
            completed_retention_secs: None,
            purge_interval_secs: 3_600,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn completed_retention(&self) -> Option<Duration> {
        self.completed_retention_secs.map(Duration::from_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymphonyConfig {
    pub database: DbConfig,
    pub default_transport: String,
    pub default_queue: String,
    pub workers: Vec<WorkerConfig>,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limits: RateLimitConfig,
    pub routing: Vec<RoutingRule>,
    /// Capacity of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for SymphonyConfig {
    fn default() -> Self {
        Self {
            database: DbConfig::default(),
            default_transport: "default".to_string(),
            default_queue: "default".to_string(),
            workers: vec![WorkerConfig::default()],
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limits: RateLimitConfig::default(),
            routing: Vec::new(),
            event_capacity: 1_024,
        }
    }
}

impl SymphonyConfig {
    /// Load from `SYMPHONY_CONFIG` (if set) and apply environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = match std::env::var("SYMPHONY_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.with_overrides(|var| std::env::var(var).ok())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Apply `SYMPHONY_DB_ENDPOINT`, `SYMPHONY_WORKER_CONCURRENCY` and
    /// `SYMPHONY_BATCH_SIZE` as read through `lookup`, then validate.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(endpoint) = lookup("SYMPHONY_DB_ENDPOINT") {
            self.database.endpoint = endpoint;
        }
        if let Some(concurrency) = parse_var(&lookup, "SYMPHONY_WORKER_CONCURRENCY")? {
            for worker in &mut self.workers {
                worker.max_concurrency = concurrency;
            }
        }
        if let Some(batch_size) = parse_var(&lookup, "SYMPHONY_BATCH_SIZE")? {
            for worker in &mut self.workers {
                worker.batch_size = batch_size;
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_transport.trim().is_empty() {
            return Err(ConfigError::Invalid("default_transport must not be empty".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive".into()));
        }
        for worker in &self.workers {
            if worker.batch_size == 0 || worker.max_concurrency == 0 || worker.instances == 0 {
                return Err(ConfigError::Invalid(format!(
                    "worker for queue '{}' needs a positive batch size, concurrency and instance count",
                    worker.queue
                )));
            }
            if worker.lock_duration_secs == 0 || worker.poll_interval_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "worker for queue '{}' needs a positive lock duration and poll interval",
                    worker.queue
                )));
            }
        }
        if self.scheduler.batch_size == 0 || self.scheduler.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler needs a positive batch size and poll interval".into(),
            ));
        }
        if !(self.retry.multiplier > 0.0) {
            return Err(ConfigError::Invalid("retry multiplier must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ConfigError::Invalid("retry jitter_factor must be within 0..=1".into()));
        }
        let rules = self
            .rate_limits
            .sender_rules
            .iter()
            .chain(&self.rate_limits.global_rules);
        if rules.clone().any(|rule: &RateLimitRule| rule.duration_ms == 0) {
            return Err(ConfigError::Invalid("rate limit windows must be non-empty".into()));
        }
        Ok(())
    }

    /// Every transport name the process refers to, default first.
    pub fn transport_names(&self) -> Vec<String> {
        let mut names = vec![self.default_transport.clone()];
        let referenced = self
            .workers
            .iter()
            .filter_map(|worker| worker.transport.clone())
            .chain(self.routing.iter().filter_map(|rule| rule.transport.clone()));
        for name in referenced {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

fn parse_var(
    lookup: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
) -> Result<Option<usize>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_to_every_worker() {
        let mut config = SymphonyConfig::default();
        config.workers.push(WorkerConfig::for_queue("emails"));
        let config = config
            .with_overrides(|var| match var {
                "SYMPHONY_DB_ENDPOINT" => Some("rocksdb://data".into()),
                "SYMPHONY_WORKER_CONCURRENCY" => Some("4".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.database.endpoint, "rocksdb://data");
        assert!(config.workers.iter().all(|w| w.max_concurrency == 4));
        assert!(config.workers.iter().all(|w| w.batch_size == 10));
    }

    #[test]
    fn bad_override_is_reported() {
        let err = SymphonyConfig::default()
            .with_overrides(|var| (var == "SYMPHONY_BATCH_SIZE").then(|| "lots".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "SYMPHONY_BATCH_SIZE", .. }));
    }

    #[test]
    fn zero_values_are_rejected() {
        let err = SymphonyConfig::default()
            .with_overrides(|var| (var == "SYMPHONY_BATCH_SIZE").then(|| "0".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let mut config = SymphonyConfig::default();
        config.retry.multiplier = 0.0;
        assert!(config.validate().is_err());

        let mut config = SymphonyConfig::default();
        config.rate_limits.global_rules.push(RateLimitRule::count_per(0, 5));
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: SymphonyConfig = serde_json::from_str(
            r#"{"workers": [{"queue": "emails", "max_concurrency": 3}],
                "routing": [{"message_type": "email.*", "queue": "emails"}]}"#,
        )
        .unwrap();
        assert_eq!(config.workers[0].queue, "emails");
        assert_eq!(config.workers[0].batch_size, 10);
        assert_eq!(config.default_transport, "default");
        assert!(config.routing[0].matches("email.send"));
        assert!(!config.routing[0].matches("sms.send"));
    }

    #[test]
    fn transport_names_are_deduplicated() {
        let mut config = SymphonyConfig::default();
        config.workers.push(WorkerConfig {
            transport: Some("bulk".into()),
            ..WorkerConfig::for_queue("newsletters")
        });
        config.routing.push(RoutingRule {
            message_type: "newsletter.*".into(),
            transport: Some("bulk".into()),
            queue: None,
            priority: None,
        });
        assert_eq!(config.transport_names(), vec!["default", "bulk"]);
    }
}
