//! Recurring and one-shot schedule definitions.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use ulid::Ulid;

use crate::BoxFuture;
use crate::envelope::Priority;
use crate::error::StoreError;
use crate::message::{Message, ValidationError};

/// Unique identifier for a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(pub Ulid);

impl ScheduleId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors building or advancing a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),
    #[error("interval must be greater than zero")]
    InvalidInterval,
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// How a schedule computes its fire times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schedule_type", content = "schedule_config", rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Fire once at `at`.
    Once {
        #[serde(with = "chrono::serde::ts_milliseconds")]
        at: DateTime<Utc>,
    },
    /// Fire every `every_ms`, first at `start_at` (or one interval after creation).
    Interval {
        every_ms: u64,
        #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
        start_at: Option<DateTime<Utc>>,
    },
    /// Fire per a cron expression evaluated in the schedule's timezone.
    ///
    /// Five-field expressions use unix numbering for the day of week (0 or 7
    /// is Sunday) and run at second zero. Six- and seven-field expressions are
    /// passed through with the `cron` crate's numbering (1 is Sunday).
    Cron { expression: String },
}

impl ScheduleKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ScheduleKind::Once { .. } => "once",
            ScheduleKind::Interval { .. } => "interval",
            ScheduleKind::Cron { .. } => "cron",
        }
    }
}

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

fn weekday_name(token: &str) -> Option<&'static str> {
    token
        .parse::<usize>()
        .ok()
        .and_then(|day| WEEKDAYS.get(day).copied())
}

/// Rewrite a unix day-of-week field (0-7, Sunday is 0 or 7) into day names.
fn unix_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let range = match range.split_once('-') {
                Some((start, end)) => match (weekday_name(start), weekday_name(end)) {
                    (Some(first), _) if start == end => first.to_string(),
                    (Some(first), Some(_)) if end == "7" => {
                        if start == "0" || step.is_some() {
                            format!("{first}-SAT")
                        } else {
                            format!("{first}-SAT,SUN")
                        }
                    }
                    (Some(first), Some(last)) => format!("{first}-{last}"),
                    _ => range.to_string(),
                },
                None => weekday_name(range).map_or_else(|| range.to_string(), str::to_string),
            };
            match step {
                Some(step) => format!("{range}/{step}"),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_cron(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = match fields.as_slice() {
        [minute, hour, day, month, weekday] => format!(
            "0 {minute} {hour} {day} {month} {}",
            unix_day_of_week(weekday)
        ),
        _ => fields.join(" "),
    };
    cron::Schedule::from_str(&normalized).map_err(|err| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason: err.to_string(),
    })
}

fn parse_timezone(timezone: &str) -> Result<Tz, ScheduleError> {
    timezone
        .parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))
}

fn interval_delta(every_ms: u64) -> Result<chrono::Duration, ScheduleError> {
    let millis = i64::try_from(every_ms).map_err(|_| ScheduleError::InvalidInterval)?;
    if millis <= 0 {
        return Err(ScheduleError::InvalidInterval);
    }
    Ok(chrono::Duration::milliseconds(millis))
}

/// A definition the scheduler materializes into envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: ScheduleId,
    pub message_type: String,
    #[serde(default)]
    pub transport_name: Option<String>,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub body: Map<String, Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub priority: Priority,
    pub schedule: ScheduleKind,
    /// IANA timezone name for cron evaluation.
    pub timezone: String,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u32,
    #[serde(default)]
    pub max_runs: Option<u32>,
    pub enabled: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl ScheduleDefinition {
    /// Create an enabled UTC schedule with its first fire time computed from `now`.
    pub fn new(
        message_type: impl Into<String>,
        schedule: ScheduleKind,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        let message_type = message_type.into();
        if message_type.trim().is_empty() {
            return Err(ValidationError::EmptyType.into());
        }

        let mut definition = Self {
            id: ScheduleId::new(),
            message_type,
            transport_name: None,
            queue_name: None,
            body: Map::new(),
            headers: BTreeMap::new(),
            priority: Priority::default(),
            schedule,
            timezone: "UTC".to_string(),
            next_run_at: None,
            last_run_at: None,
            run_count: 0,
            max_runs: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        };
        definition.next_run_at = definition.first_run(now)?;
        Ok(definition)
    }

    pub fn with_body(mut self, body: Value) -> Result<Self, ScheduleError> {
        match body {
            Value::Object(map) => {
                self.body = map;
                Ok(self)
            }
            _ => Err(ValidationError::PayloadNotObject("non-object").into()),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_transport(mut self, transport_name: impl Into<String>) -> Self {
        self.transport_name = Some(transport_name.into());
        self
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    /// Switch timezone and recompute the first fire time.
    pub fn with_timezone(
        mut self,
        timezone: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        let timezone = timezone.into();
        parse_timezone(&timezone)?;
        self.timezone = timezone;
        self.next_run_at = self.first_run(now)?;
        Ok(self)
    }

    /// Check the cron expression, interval and timezone.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.message_type.trim().is_empty() {
            return Err(ValidationError::EmptyType.into());
        }
        parse_timezone(&self.timezone)?;
        match &self.schedule {
            ScheduleKind::Once { .. } => Ok(()),
            ScheduleKind::Interval { every_ms, .. } => interval_delta(*every_ms).map(|_| ()),
            ScheduleKind::Cron { expression } => parse_cron(expression).map(|_| ()),
        }
    }

    fn first_run(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match &self.schedule {
            ScheduleKind::Once { at } => Ok(Some(*at)),
            ScheduleKind::Interval { every_ms, start_at } => {
                let every = interval_delta(*every_ms)?;
                Ok(start_at.or_else(|| now.checked_add_signed(every)))
            }
            ScheduleKind::Cron { expression } => self.next_cron_after(expression, now),
        }
    }

    fn next_cron_after(
        &self,
        expression: &str,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let schedule = parse_cron(expression)?;
        let tz = parse_timezone(&self.timezone)?;
        Ok(schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|next| next.with_timezone(&Utc)))
    }

    /// Whether the schedule should fire at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|next| next <= now)
    }

    /// Idempotency key for the envelope produced by the pending fire.
    ///
    /// Two scheduler instances firing the same slot produce the same key.
    pub fn fire_key(&self) -> String {
        let slot = self.next_run_at.map_or(0, |next| next.timestamp_millis());
        format!("schedule:{}:{}", self.id, slot)
    }

    /// The message a fire dispatches.
    pub fn to_message(&self) -> Result<Message, ValidationError> {
        let mut message = Message::new(self.message_type.clone(), Value::Object(self.body.clone()))?;
        message
            .metadata
            .insert("schedule_id".into(), Value::from(self.id.to_string()));
        Ok(message)
    }

    /// Record a fire at `now` and move `next_run_at` forward.
    ///
    /// Missed interval and cron slots are skipped rather than replayed.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        let fired_slot = self.next_run_at.unwrap_or(now);
        self.last_run_at = Some(now);
        self.run_count = self.run_count.saturating_add(1);
        self.updated_at = now;

        if self.max_runs.is_some_and(|max| self.run_count >= max) {
            self.disable(now);
            return Ok(());
        }

        let next = match &self.schedule {
            ScheduleKind::Once { .. } => None,
            ScheduleKind::Interval { every_ms, .. } => {
                let every = interval_delta(*every_ms)?;
                let elapsed = (now - fired_slot).num_milliseconds().max(0);
                let steps = elapsed / every.num_milliseconds() + 1;
                every
                    .checked_mul(i32::try_from(steps).unwrap_or(i32::MAX))
                    .and_then(|delta| fired_slot.checked_add_signed(delta))
            }
            ScheduleKind::Cron { expression } => {
                let expression = expression.clone();
                self.next_cron_after(&expression, now.max(fired_slot))?
            }
        };

        match next {
            Some(next) => self.next_run_at = Some(next),
            None => self.disable(now),
        }
        Ok(())
    }

    fn disable(&mut self, now: DateTime<Utc>) {
        self.enabled = false;
        self.next_run_at = None;
        self.updated_at = now;
    }

    /// Enable or disable from the admin surface.
    ///
    /// Re-enabling recomputes the next fire time from `now`; a finished
    /// one-shot or a schedule that reached `max_runs` stays disabled.
    pub fn set_enabled(&mut self, enabled: bool, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        if !enabled {
            self.disable(now);
            return Ok(());
        }

        let finished = self.max_runs.is_some_and(|max| self.run_count >= max)
            || (matches!(self.schedule, ScheduleKind::Once { .. }) && self.run_count > 0);
        if finished {
            return Ok(());
        }

        self.next_run_at = match &self.schedule {
            ScheduleKind::Once { at } => Some(*at),
            ScheduleKind::Interval { every_ms, .. } => {
                let every = interval_delta(*every_ms)?;
                now.checked_add_signed(every)
            }
            ScheduleKind::Cron { expression } => {
                let expression = expression.clone();
                self.next_cron_after(&expression, now)?
            }
        };
        self.enabled = self.next_run_at.is_some();
        self.updated_at = now;
        Ok(())
    }
}

/// Storage for schedule definitions.
pub trait ScheduleStore: Send + Sync + 'static {
    fn insert<'a>(&'a self, definition: &'a ScheduleDefinition)
    -> BoxFuture<'a, Result<(), StoreError>>;

    fn get<'a>(
        &'a self,
        id: ScheduleId,
    ) -> BoxFuture<'a, Result<Option<ScheduleDefinition>, StoreError>>;

    fn list<'a>(&'a self) -> BoxFuture<'a, Result<Vec<ScheduleDefinition>, StoreError>>;

    /// Enabled schedules with `next_run_at <= now`, earliest first.
    fn due<'a>(
        &'a self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<ScheduleDefinition>, StoreError>>;

    /// Persist an advanced definition only if the stored `next_run_at` still
    /// equals `expected_next_run`. Returns false when another scheduler won.
    fn advance<'a>(
        &'a self,
        definition: &'a ScheduleDefinition,
        expected_next_run: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Unconditional save.
    fn update<'a>(&'a self, definition: &'a ScheduleDefinition)
    -> BoxFuture<'a, Result<(), StoreError>>;

    fn delete<'a>(&'a self, id: ScheduleId) -> BoxFuture<'a, Result<bool, StoreError>>;
}

/// Single-process schedule store.
#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    schedules: Mutex<HashMap<ScheduleId, ScheduleDefinition>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ScheduleId, ScheduleDefinition>> {
        self.schedules.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ScheduleStore for MemoryScheduleStore {
    fn insert<'a>(
        &'a self,
        definition: &'a ScheduleDefinition,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        let result = {
            let mut schedules = self.lock();
            if schedules.contains_key(&definition.id) {
                Err(StoreError::Conflict(format!(
                    "schedule {} already exists",
                    definition.id
                )))
            } else {
                schedules.insert(definition.id, definition.clone());
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn get<'a>(
        &'a self,
        id: ScheduleId,
    ) -> BoxFuture<'a, Result<Option<ScheduleDefinition>, StoreError>> {
        let found = self.lock().get(&id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn list<'a>(&'a self) -> BoxFuture<'a, Result<Vec<ScheduleDefinition>, StoreError>> {
        let mut all: Vec<_> = self.lock().values().cloned().collect();
        all.sort_by_key(|definition| definition.id);
        Box::pin(async move { Ok(all) })
    }

    fn due<'a>(
        &'a self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<ScheduleDefinition>, StoreError>> {
        let mut due: Vec<_> = self
            .lock()
            .values()
            .filter(|definition| definition.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|definition| (definition.next_run_at, definition.id));
        due.truncate(limit);
        Box::pin(async move { Ok(due) })
    }

    fn advance<'a>(
        &'a self,
        definition: &'a ScheduleDefinition,
        expected_next_run: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        let advanced = {
            let mut schedules = self.lock();
            match schedules.get_mut(&definition.id) {
                Some(stored) if stored.enabled && stored.next_run_at == expected_next_run => {
                    *stored = definition.clone();
                    true
                }
                _ => false,
            }
        };
        Box::pin(async move { Ok(advanced) })
    }

    fn update<'a>(
        &'a self,
        definition: &'a ScheduleDefinition,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        let result = {
            let mut schedules = self.lock();
            match schedules.get_mut(&definition.id) {
                Some(stored) => {
                    *stored = definition.clone();
                    Ok(())
                }
                None => Err(StoreError::NotFound(format!("schedule {}", definition.id))),
            }
        };
        Box::pin(async move { result })
    }

    fn delete<'a>(&'a self, id: ScheduleId) -> BoxFuture<'a, Result<bool, StoreError>> {
        let removed = self.lock().remove(&id).is_some();
        Box::pin(async move { Ok(removed) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    #[test]
    fn once_disables_after_fire() {
        let now = at(9, 0);
        let mut def =
            ScheduleDefinition::new("report.send", ScheduleKind::Once { at: at(10, 0) }, now)
                .unwrap();
        assert!(!def.is_due(now));
        assert!(def.is_due(at(10, 0)));
        def.advance(at(10, 0)).unwrap();
        assert!(!def.enabled);
        assert_eq!(def.next_run_at, None);
        assert_eq!(def.run_count, 1);
    }

    #[test]
    fn interval_with_max_runs_stops() {
        let now = at(9, 0);
        let mut def = ScheduleDefinition::new(
            "calendar.sync",
            ScheduleKind::Interval {
                every_ms: 60_000,
                start_at: Some(now),
            },
            now,
        )
        .unwrap()
        .with_max_runs(3);

        let mut fires = 0;
        let mut clock = now;
        while def.enabled && fires < 10 {
            if def.is_due(clock) {
                def.advance(clock).unwrap();
                fires += 1;
            }
            clock += chrono::Duration::minutes(1);
        }
        assert_eq!(fires, 3);
        assert!(!def.enabled);
    }

    #[test]
    fn interval_skips_missed_slots() {
        let now = at(9, 0);
        let mut def = ScheduleDefinition::new(
            "t",
            ScheduleKind::Interval {
                every_ms: 60_000,
                start_at: Some(now),
            },
            now,
        )
        .unwrap();
        def.advance(at(9, 5) + chrono::Duration::seconds(30)).unwrap();
        assert_eq!(def.next_run_at, Some(at(9, 6)));
    }

    #[test]
    fn cron_respects_timezone() {
        let now = at(0, 0);
        let def = ScheduleDefinition::new(
            "digest.send",
            ScheduleKind::Cron {
                expression: "0 9 * * *".into(),
            },
            now,
        )
        .unwrap()
        .with_timezone("America/New_York", now)
        .unwrap();
        // 09:00 EST is 14:00 UTC in early March.
        assert_eq!(def.next_run_at, Some(at(14, 0)));
    }

    #[test]
    fn five_field_weekdays_use_unix_numbering() {
        assert_eq!(unix_day_of_week("1"), "MON");
        assert_eq!(unix_day_of_week("0,6"), "SUN,SAT");
        assert_eq!(unix_day_of_week("1-5"), "MON-FRI");
        assert_eq!(unix_day_of_week("5-7"), "FRI-SAT,SUN");
        assert_eq!(unix_day_of_week("0-7"), "SUN-SAT");
        assert_eq!(unix_day_of_week("*/2"), "*/2");
        assert_eq!(unix_day_of_week("MON-FRI"), "MON-FRI");

        // Monday 2026-03-02 10:00 UTC.
        let now = at(10, 0);
        let next = |expression: &str| {
            ScheduleDefinition::new(
                "digest.send",
                ScheduleKind::Cron {
                    expression: expression.into(),
                },
                now,
            )
            .unwrap()
            .next_run_at
            .unwrap()
        };
        let day = |d: u32| Utc.with_ymd_and_hms(2026, 3, d, 9, 0, 0).unwrap();
        assert_eq!(next("0 9 * * 1"), day(9));
        assert_eq!(next("0 9 * * 0"), day(8));
        assert_eq!(next("0 9 * * 7"), day(8));
        assert_eq!(next("0 9 * * 1-5"), day(3));
        assert_eq!(next("0 9 * * 5-7"), day(6));
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        let now = at(0, 0);
        assert!(matches!(
            ScheduleDefinition::new(
                "t",
                ScheduleKind::Cron {
                    expression: "not a cron".into()
                },
                now
            ),
            Err(ScheduleError::InvalidCron { .. })
        ));
        assert_eq!(
            ScheduleDefinition::new(
                "t",
                ScheduleKind::Interval {
                    every_ms: 0,
                    start_at: None
                },
                now
            )
            .unwrap_err(),
            ScheduleError::InvalidInterval
        );
        let def = ScheduleDefinition::new("t", ScheduleKind::Once { at: now }, now).unwrap();
        assert!(matches!(
            def.with_timezone("Mars/Olympus", now),
            Err(ScheduleError::InvalidTimezone(_))
        ));
    }

    #[tokio::test]
    async fn conditional_advance_lets_one_scheduler_win() {
        let store = MemoryScheduleStore::new();
        let now = at(9, 0);
        let def = ScheduleDefinition::new(
            "t",
            ScheduleKind::Interval {
                every_ms: 60_000,
                start_at: Some(now),
            },
            now,
        )
        .unwrap();
        store.insert(&def).await.unwrap();

        let expected = def.next_run_at;
        let mut first = def.clone();
        first.advance(now).unwrap();
        let mut second = def.clone();
        second.advance(now).unwrap();

        assert!(store.advance(&first, expected).await.unwrap());
        assert!(!store.advance(&second, expected).await.unwrap());
        assert_eq!(store.get(def.id).await.unwrap().unwrap().run_count, 1);
    }
}
