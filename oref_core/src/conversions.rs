//! `From` implementations bridging `oref_config` records to core types.

use crate::schedule::{ScheduleStep, TargetStep};

// ── Schedules ────────────────────────────────────────────────────────────────

impl From<&oref_config::ScheduleEntry> for ScheduleStep {
    fn from(e: &oref_config::ScheduleEntry) -> Self {
        Self {
            offset: e.offset,
            value: e.value,
        }
    }
}

impl From<&oref_config::TargetEntry> for TargetStep {
    fn from(e: &oref_config::TargetEntry) -> Self {
        Self {
            offset: e.offset,
            low: e.low,
            high: e.high,
        }
    }
}

// ── Glucose ──────────────────────────────────────────────────────────────────

impl From<&oref_config::GlucoseReading> for crate::glucose::Sample {
    fn from(r: &oref_config::GlucoseReading) -> Self {
        Self {
            date: r.timestamp,
            glucose: r.glucose,
        }
    }
}
