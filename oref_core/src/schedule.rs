//! Time-of-day schedules keyed by minute offsets.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;

use oref_config::MINUTES_PER_DAY;

/// One step of a basal / ISF / carb-ratio schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScheduleStep {
    pub offset: u32,
    pub value: f64,
}

/// One step of the BG target schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TargetStep {
    pub offset: u32,
    pub low: f64,
    pub high: f64,
}

/// Minutes since local midnight for `t`.
pub fn minute_of_day(t: DateTime<Utc>, utc_offset_minutes: i32) -> u32 {
    let local = t.naive_utc() + Duration::minutes(i64::from(utc_offset_minutes));
    local.hour() * 60 + local.minute()
}

/// Look up the value in effect at `minute`.
///
/// Windows are half-open `[offset, next_offset)`. When no window matches, the
/// last entry applies if its value is nonzero.
pub fn lookup(steps: &[ScheduleStep], minute: u32) -> Option<f64> {
    let minute = minute % MINUTES_PER_DAY;
    for pair in steps.windows(2) {
        if minute >= pair[0].offset && minute < pair[1].offset {
            return Some(pair[0].value);
        }
    }
    let last = steps.last()?;
    if minute >= last.offset || last.value != 0.0 {
        return Some(last.value);
    }
    None
}

/// Target window in effect at `minute`, same rules as [`lookup`].
pub fn lookup_target(steps: &[TargetStep], minute: u32) -> Option<TargetStep> {
    let minute = minute % MINUTES_PER_DAY;
    for pair in steps.windows(2) {
        if minute >= pair[0].offset && minute < pair[1].offset {
            return Some(pair[0]);
        }
    }
    steps.last().copied()
}

/// Largest value in the schedule (max daily basal).
pub fn max_value(steps: &[ScheduleStep]) -> f64 {
    steps.iter().map(|s| s.value).fold(0.0, f64::max)
}

/// Offsets at which the schedule value changes, ascending.
pub fn boundaries(steps: &[ScheduleStep]) -> impl Iterator<Item = u32> + '_ {
    steps.iter().map(|s| s.offset).filter(|o| *o > 0)
}
