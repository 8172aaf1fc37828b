//! Current glucose and its short/long trends.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::util::round_to;

/// Readings at or below this are sensor error codes.
pub const SENSOR_ERROR_MAX: f64 = 38.0;

/// A glucose sample as the engines see it (mg/dL).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub date: DateTime<Utc>,
    pub glucose: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GlucoseStatus {
    pub glucose: f64,
    /// Average 5-minute change over the last 2.5–7.5 minutes.
    pub delta: f64,
    pub short_avgdelta: f64,
    pub long_avgdelta: f64,
    pub date: DateTime<Utc>,
}

impl GlucoseStatus {
    pub fn min_delta(&self) -> f64 {
        self.delta.min(self.short_avgdelta)
    }

    pub fn min_avg_delta(&self) -> f64 {
        self.short_avgdelta.min(self.long_avgdelta)
    }

    pub fn max_delta(&self) -> f64 {
        self.delta.max(self.short_avgdelta).max(self.long_avgdelta)
    }

    /// Minutes between the reading and `now`, one decimal.
    pub fn age_minutes(&self, now: DateTime<Utc>) -> f64 {
        round_to((now - self.date).num_milliseconds() as f64 / 60_000.0, 1)
    }
}

fn mean(v: &[f64]) -> f64 {
    if v.is_empty() {
        0.0
    } else {
        v.iter().sum::<f64>() / v.len() as f64
    }
}

/// Glucose status from readings in any order. `None` when no valid reading exists.
pub fn glucose_status(readings: &[Sample]) -> Option<GlucoseStatus> {
    let mut data: Vec<Sample> = readings
        .iter()
        .filter(|r| r.glucose > SENSOR_ERROR_MAX)
        .copied()
        .collect();
    data.sort_by(|a, b| b.date.cmp(&a.date));
    let (first, rest) = data.split_first()?;

    let mut now_bg = first.glucose;
    let mut now_date = first.date;
    let mut last_deltas = Vec::new();
    let mut short_deltas = Vec::new();
    let mut long_deltas = Vec::new();

    for then in rest {
        let minutes_ago = ((now_date - then.date).num_milliseconds() as f64 / 60_000.0).round();
        if minutes_ago < 2.5 && minutes_ago > -2.0 {
            // Near-duplicate of the newest reading: fold it in.
            now_bg = (now_bg + then.glucose) / 2.0;
            now_date = then.date + Duration::milliseconds((now_date - then.date).num_milliseconds() / 2);
            continue;
        }
        let avgdelta = (now_bg - then.glucose) / minutes_ago * 5.0;
        if minutes_ago > 2.5 && minutes_ago < 17.5 {
            short_deltas.push(avgdelta);
            if minutes_ago < 7.5 {
                last_deltas.push(avgdelta);
            }
        } else if minutes_ago > 17.5 && minutes_ago < 42.5 {
            long_deltas.push(avgdelta);
        }
    }

    let status = GlucoseStatus {
        glucose: round_to(now_bg, 2),
        delta: round_to(mean(&last_deltas), 2),
        short_avgdelta: round_to(mean(&short_deltas), 2),
        long_avgdelta: round_to(mean(&long_deltas), 2),
        date: now_date,
    };
    tracing::debug!(
        glucose = status.glucose,
        delta = status.delta,
        short_avgdelta = status.short_avgdelta,
        long_avgdelta = status.long_avgdelta,
        "glucose status"
    );
    Some(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(start: &str, values: &[f64]) -> Vec<Sample> {
        let t0 = DateTime::parse_from_rfc3339(start).unwrap().with_timezone(&Utc);
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Sample { date: t0 - Duration::minutes(5 * i as i64), glucose: *v })
            .collect()
    }

    #[test]
    fn steady_fall_gives_matching_deltas() {
        let s = series("2024-05-01T08:00:00Z", &[100.0, 105.0, 110.0, 115.0, 120.0, 125.0, 130.0, 135.0, 140.0]);
        let g = glucose_status(&s).unwrap();
        assert_eq!(g.glucose, 100.0);
        assert_eq!(g.delta, -5.0);
        assert_eq!(g.short_avgdelta, -5.0);
        assert_eq!(g.long_avgdelta, -5.0);
    }

    #[test]
    fn sensor_errors_are_skipped() {
        let s = series("2024-05-01T08:00:00Z", &[38.0, 120.0, 115.0]);
        let g = glucose_status(&s).unwrap();
        assert_eq!(g.glucose, 120.0);
        assert_eq!(g.delta, 5.0);
    }

    #[test]
    fn empty_is_none() {
        assert!(glucose_status(&[]).is_none());
        assert!(glucose_status(&series("2024-05-01T08:00:00Z", &[10.0])).is_none());
    }
}
