use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Primary key of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Primary key of a trigger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(pub i64);

impl TriggerId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TriggerId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// How a trigger derives its fire times.
///
/// Stored as an integer column: `1` = cron, `2` = fixed interval. Any other
/// value survives deserialization as [`TriggerType::Unrecognized`] so the
/// calculator can report it against the offending trigger instead of the
/// whole batch failing to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum TriggerType {
    Cron,
    FixedInterval,
    Unrecognized(i32),
}

impl From<i32> for TriggerType {
    fn from(v: i32) -> Self {
        match v {
            1 => TriggerType::Cron,
            2 => TriggerType::FixedInterval,
            other => TriggerType::Unrecognized(other),
        }
    }
}

impl From<TriggerType> for i32 {
    fn from(t: TriggerType) -> Self {
        match t {
            TriggerType::Cron => 1,
            TriggerType::FixedInterval => 2,
            TriggerType::Unrecognized(v) => v,
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerType::Cron => write!(f, "cron"),
            TriggerType::FixedInterval => write!(f, "fixed_interval"),
            TriggerType::Unrecognized(v) => write!(f, "unrecognized({v})"),
        }
    }
}

/// What to do when a whole cycle was skipped.
///
/// `1` = ignore the missed occurrence, `2` = fire once immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum MisfireStrategy {
    #[default]
    Ignore,
    FireNow,
    Unrecognized(i32),
}

impl From<i32> for MisfireStrategy {
    fn from(v: i32) -> Self {
        match v {
            1 => MisfireStrategy::Ignore,
            2 => MisfireStrategy::FireNow,
            other => MisfireStrategy::Unrecognized(other),
        }
    }
}

impl From<MisfireStrategy> for i32 {
    fn from(s: MisfireStrategy) -> Self {
        match s {
            MisfireStrategy::Ignore => 1,
            MisfireStrategy::FireNow => 2,
            MisfireStrategy::Unrecognized(v) => v,
        }
    }
}

/// Read-only snapshot of a persisted trigger row.
///
/// The scheduler core never mutates or stores this; it only derives fire
/// times from it. Every field the store may leave NULL is an `Option` so
/// configuration defects surface as calculation errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTrigger {
    pub id: TriggerId,
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub trigger_type: Option<TriggerType>,
    #[serde(default)]
    pub cron: Option<String>,
    /// Interval in seconds for fixed-interval triggers.
    #[serde(default)]
    pub fixed_interval: Option<i64>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub misfire_strategy: MisfireStrategy,
}

impl JobTrigger {
    /// A cron trigger starting at `start_time`.
    pub fn cron(
        id: i64,
        job_id: i64,
        expression: &str,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TriggerId(id),
            job_id: JobId(job_id),
            trigger_type: Some(TriggerType::Cron),
            cron: Some(expression.to_string()),
            fixed_interval: None,
            start_time: Some(start_time),
            end_time: None,
            last_fire_time: None,
            next_fire_time: None,
            misfire_strategy: MisfireStrategy::default(),
        }
    }

    /// A fixed-interval trigger firing every `every_secs` seconds from `start_time`.
    pub fn fixed_interval(
        id: i64,
        job_id: i64,
        every_secs: i64,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TriggerId(id),
            job_id: JobId(job_id),
            trigger_type: Some(TriggerType::FixedInterval),
            cron: None,
            fixed_interval: Some(every_secs),
            start_time: Some(start_time),
            end_time: None,
            last_fire_time: None,
            next_fire_time: None,
            misfire_strategy: MisfireStrategy::default(),
        }
    }

    pub fn with_next_fire_time(mut self, at: DateTime<Utc>) -> Self {
        self.next_fire_time = Some(at);
        self
    }

    pub fn with_last_fire_time(mut self, at: DateTime<Utc>) -> Self {
        self.last_fire_time = Some(at);
        self
    }

    pub fn with_end_time(mut self, at: DateTime<Utc>) -> Self {
        self.end_time = Some(at);
        self
    }

    pub fn with_misfire_strategy(mut self, strategy: MisfireStrategy) -> Self {
        self.misfire_strategy = strategy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_type_round_trips_through_integer_column() {
        assert_eq!(TriggerType::from(1), TriggerType::Cron);
        assert_eq!(TriggerType::from(2), TriggerType::FixedInterval);
        assert_eq!(TriggerType::from(7), TriggerType::Unrecognized(7));
        assert_eq!(i32::from(TriggerType::Unrecognized(7)), 7);
    }

    #[test]
    fn trigger_snapshot_deserializes_from_row_json() {
        let json = r#"{
            "id": 11,
            "jobId": 3,
            "type": 2,
            "fixedInterval": 60,
            "startTime": "2024-01-01T00:00:00Z",
            "nextFireTime": "2024-01-01T00:01:00Z",
            "misfireStrategy": 2
        }"#;
        let trigger: JobTrigger = serde_json::from_str(json).unwrap();
        assert_eq!(trigger.id, TriggerId(11));
        assert_eq!(trigger.job_id, JobId(3));
        assert_eq!(trigger.trigger_type, Some(TriggerType::FixedInterval));
        assert_eq!(trigger.fixed_interval, Some(60));
        assert!(trigger.cron.is_none());
        assert!(trigger.last_fire_time.is_none());
        assert_eq!(trigger.misfire_strategy, MisfireStrategy::FireNow);
    }

    #[test]
    fn unknown_type_survives_deserialization() {
        let json = r#"{"id": 1, "jobId": 1, "type": 9}"#;
        let trigger: JobTrigger = serde_json::from_str(json).unwrap();
        assert_eq!(trigger.trigger_type, Some(TriggerType::Unrecognized(9)));
        assert_eq!(trigger.misfire_strategy, MisfireStrategy::Ignore);
    }
}
