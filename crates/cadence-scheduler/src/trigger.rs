//! Fire-time arithmetic for persisted triggers.
//!
//! Every function here is pure: it reads a [`JobTrigger`] snapshot and a
//! reference time and returns a derived instant. Results are truncated to
//! whole seconds so that stored and freshly computed times compare equal.
//!
//! Two entry points exist on purpose:
//!
//! | Function               | Anchor                               | May return a past time? |
//! |------------------------|--------------------------------------|-------------------------|
//! | [`next_fire_time`]     | `max(last_fire_time, start_time)`    | yes (catch-up needed)   |
//! | [`next_fire_time_at`]  | `next_fire_time`, relative to db now | no                      |

use cadence_core::{JobTrigger, MisfireStrategy, TriggerType};
use chrono::{DateTime, SubsecRound, Utc};
use croner::parser::{CronParser, Seconds, Year};
use croner::Cron;

use crate::error::{Result, SchedulerError};

/// Outcome of checking a due trigger against its misfire strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireDecision {
    /// Run the job; `fire_time` becomes the trigger's new `last_fire_time`.
    Fire { fire_time: DateTime<Utc> },
    /// A whole cycle was missed and the strategy says to drop it.
    Skip,
}

/// Cron dialect of persisted rows: Quartz-style, with optional leading
/// seconds and trailing year fields, `?` placeholders, and numeric weekdays
/// `1-7` counted from Sunday.
fn quartz_parser() -> CronParser {
    CronParser::builder()
        .seconds(Seconds::Optional)
        .year(Year::Optional)
        .alternative_weekdays(true)
        .build()
}

/// Validated firing rule extracted from a trigger snapshot.
enum Rule {
    Cron(Cron),
    /// Interval in milliseconds, always > 0.
    FixedInterval(i64),
}

impl Rule {
    fn of(trigger: &JobTrigger) -> Result<Self> {
        let kind = trigger
            .trigger_type
            .ok_or_else(|| SchedulerError::invalid_trigger(trigger.id, "type is required"))?;

        match kind {
            TriggerType::Cron => {
                let expr = trigger
                    .cron
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        SchedulerError::invalid_trigger(trigger.id, "cron expression is required")
                    })?;
                let cron = quartz_parser().parse(expr).map_err(|e| {
                    SchedulerError::invalid_trigger(
                        trigger.id,
                        format!("invalid cron expression '{expr}': {e}"),
                    )
                })?;
                Ok(Rule::Cron(cron))
            }
            TriggerType::FixedInterval => {
                let ms = trigger
                    .fixed_interval
                    .filter(|secs| *secs > 0)
                    .and_then(|secs| secs.checked_mul(1000))
                    .ok_or_else(|| {
                        SchedulerError::invalid_trigger(
                            trigger.id,
                            format!("fixed_interval must be > 0, got {:?}", trigger.fixed_interval),
                        )
                    })?;
                Ok(Rule::FixedInterval(ms))
            }
            TriggerType::Unrecognized(v) => Err(SchedulerError::invalid_trigger(
                trigger.id,
                format!("unrecognized trigger type {v}"),
            )),
        }
    }

    /// The occurrence strictly after `reference`.
    fn after(&self, trigger: &JobTrigger, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Rule::Cron(cron) => cron.find_next_occurrence(&reference, false).map_err(|e| {
                SchedulerError::invalid_trigger(
                    trigger.id,
                    format!("no cron occurrence after {reference}: {e}"),
                )
            }),
            Rule::FixedInterval(ms) => {
                let at = reference
                    .timestamp_millis()
                    .checked_add(*ms)
                    .ok_or_else(|| out_of_range(trigger))?;
                from_millis(trigger, at)
            }
        }
    }
}

/// Compute the first fire time of a trigger that is being (re)scheduled.
///
/// The reference point is `max(last_fire_time, start_time)`. The result can
/// lie before "now", which tells the caller a catch-up fire is due.
pub fn next_fire_time(trigger: &JobTrigger) -> Result<DateTime<Utc>> {
    let start = trigger
        .start_time
        .ok_or_else(|| SchedulerError::invalid_trigger(trigger.id, "start_time is required"))?;
    let rule = Rule::of(trigger)?;

    let reference = match trigger.last_fire_time {
        Some(last) if last > start => last,
        _ => start,
    };
    let next = rule.after(trigger, reference)?;
    Ok(floor_to_second(next))
}

/// Re-arm a trigger during steady-state operation.
///
/// Cron triggers take the next occurrence after `db_now`. Fixed-interval
/// triggers stay on the grid anchored at `next_fire_time`: the result is the
/// first grid point strictly after `max(db_now, next_fire_time)`, so delays
/// never shift the phase.
///
/// Returns `Ok(None)` when the candidate lies after `end_time`.
pub fn next_fire_time_at(db_now: DateTime<Utc>, trigger: &JobTrigger) -> Result<Option<DateTime<Utc>>> {
    let rule = Rule::of(trigger)?;
    let anchor = require_next_fire_time(trigger)?;

    let candidate = match &rule {
        Rule::Cron(_) => rule.after(trigger, db_now)?,
        Rule::FixedInterval(ms) => {
            let anchor_ms = anchor.timestamp_millis();
            let elapsed = db_now
                .timestamp_millis()
                .saturating_sub(anchor_ms)
                .max(0);
            let at = (elapsed / ms + 1)
                .checked_mul(*ms)
                .and_then(|offset| anchor_ms.checked_add(offset))
                .ok_or_else(|| out_of_range(trigger))?;
            from_millis(trigger, at)?
        }
    };

    if trigger.end_time.is_some_and(|end| candidate > end) {
        return Ok(None);
    }
    Ok(Some(floor_to_second(candidate)))
}

/// Whether a whole cycle was skipped: true iff `db_now` is at or past the
/// occurrence that follows `next_fire_time`.
///
/// Ordinary lateness within one cycle is jitter, not a misfire.
pub fn is_misfire(db_now: DateTime<Utc>, trigger: &JobTrigger) -> Result<bool> {
    let rule = Rule::of(trigger)?;
    let anchor = require_next_fire_time(trigger)?;
    let following = rule.after(trigger, anchor)?;
    Ok(db_now >= following)
}

/// Apply the trigger's misfire strategy to a due trigger.
pub fn misfire_decision(db_now: DateTime<Utc>, trigger: &JobTrigger) -> Result<FireDecision> {
    let scheduled = require_next_fire_time(trigger)?;
    if !is_misfire(db_now, trigger)? {
        return Ok(FireDecision::Fire {
            fire_time: scheduled,
        });
    }

    match trigger.misfire_strategy {
        MisfireStrategy::Ignore => Ok(FireDecision::Skip),
        MisfireStrategy::FireNow => Ok(FireDecision::Fire {
            fire_time: floor_to_second(db_now),
        }),
        MisfireStrategy::Unrecognized(v) => Err(SchedulerError::invalid_trigger(
            trigger.id,
            format!("unrecognized misfire strategy {v}"),
        )),
    }
}

/// Drop the sub-second component.
pub fn floor_to_second(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(0)
}

/// Seconds since the Unix epoch, rounding toward negative infinity.
pub fn epoch_second(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

fn require_next_fire_time(trigger: &JobTrigger) -> Result<DateTime<Utc>> {
    trigger
        .next_fire_time
        .ok_or_else(|| SchedulerError::invalid_trigger(trigger.id, "next_fire_time is required"))
}

fn from_millis(trigger: &JobTrigger, ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| out_of_range(trigger))
}

fn out_of_range(trigger: &JobTrigger) -> SchedulerError {
    SchedulerError::invalid_trigger(trigger.id, "fire time out of range")
}
