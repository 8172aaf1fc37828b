//! Carb absorption and carbs on board.
//!
//! Glucose is bucketed into roughly 5-minute samples, each bucket's observed
//! delta is compared with the delta insulin activity alone would produce, and
//! the excess (the deviation) is attributed to carbs.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use oref_config::CarbEntry;

use crate::glucose::Sample;
use crate::iob::{self, Timeline};
use crate::profile::Profile;
use crate::util::round_to;

/// Carbs older than this are considered fully absorbed (hours).
pub const MAX_MEAL_ABSORPTION_HOURS: f64 = 6.0;
/// Interpolation across a single gap stops after this many minutes.
pub const MAX_GAP_INTERPOLATION_MIN: f64 = 240.0;
/// Deviation window ending at the carb-impact time (minutes).
pub const CI_WINDOW_MIN: f64 = 45.0;
/// Readings below this are not used for absorption.
const MIN_VALID_BG: f64 = 39.0;

fn minutes(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 60_000.0
}

/// Bucket glucose (any order) into ~5-minute samples, newest first.
///
/// Readings sharing a timestamp are kept once.
/// Gaps over 8 minutes are interpolated at 5-minute steps (at most 240
/// minutes per gap); samples within 2 minutes of the previous bucket are
/// averaged into it. Samples more than six hours after `meal_time` are
/// skipped, and accumulation stops after the first sample preceding
/// `meal_time` (that sample is still kept). With `ci_time`, only the 45
/// minutes before it are used.
pub fn bucket(
    samples: &[Sample],
    meal_time: DateTime<Utc>,
    ci_time: Option<DateTime<Utc>>,
) -> Vec<Sample> {
    let mut data: Vec<Sample> = samples
        .iter()
        .filter(|s| s.glucose >= MIN_VALID_BG)
        .copied()
        .collect();
    data.sort_by(|a, b| b.date.cmp(&a.date));
    data.dedup_by_key(|s| s.date);
    let Some(first) = data.first() else {
        return Vec::new();
    };
    let mut out = vec![*first];
    let mut last_raw = *first;
    let mut found_pre_meal = false;

    for s in &data[1..] {
        let hours_after_meal = minutes(s.date - meal_time) / 60.0;
        if hours_after_meal > MAX_MEAL_ABSORPTION_HOURS || found_pre_meal {
            continue;
        } else if hours_after_meal < 0.0 {
            found_pre_meal = true;
        }
        if let Some(ci) = ci_time {
            let windows_ago = minutes(ci - s.date) / CI_WINDOW_MIN;
            if !(0.0..=1.0).contains(&windows_ago) {
                continue;
            }
        }
        let Some(last) = out.last().copied() else {
            continue;
        };
        let elapsed = minutes(s.date - last.date).abs();
        if elapsed > 8.0 {
            let mut last_bg = last_raw.glucose;
            let mut last_time = last.date;
            let mut remaining = elapsed.min(MAX_GAP_INTERPOLATION_MIN);
            while remaining > 5.0 {
                let prev_time = last_time - Duration::minutes(5);
                let gap_delta = s.glucose - last_bg;
                let prev_bg = last_bg + 5.0 / remaining * gap_delta;
                out.push(Sample { date: prev_time, glucose: prev_bg.round() });
                remaining -= 5.0;
                last_bg = prev_bg;
                last_time = prev_time;
            }
        } else if elapsed > 2.0 {
            out.push(*s);
        } else if let Some(b) = out.last_mut() {
            b.glucose = (b.glucose + s.glucose) / 2.0;
        }
        last_raw = *s;
    }
    out
}

/// Output of one absorption pass.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Absorption {
    pub carbs_absorbed: f64,
    pub current_deviation: Option<f64>,
    pub max_deviation: f64,
    pub min_deviation: f64,
    pub slope_from_max_deviation: f64,
    pub slope_from_min_deviation: f64,
    pub all_deviations: Vec<f64>,
}

/// Deviation and absorbed-carb analysis over bucketed glucose.
pub fn detect_absorption(
    glucose: &[Sample],
    timeline: &Timeline,
    profile: &Profile,
    meal_time: DateTime<Utc>,
    ci_time: Option<DateTime<Utc>>,
) -> Absorption {
    let buckets = bucket(glucose, meal_time, ci_time);
    let floor = profile.preferences.min_5m_carbimpact;

    let mut out = Absorption {
        max_deviation: 0.0,
        min_deviation: 999.0,
        slope_from_max_deviation: 0.0,
        slope_from_min_deviation: 999.0,
        ..Absorption::default()
    };
    let mut current: Option<f64> = None;

    for i in 0..buckets.len().saturating_sub(3) {
        let bg_time = buckets[i].date;
        let bg = buckets[i].glucose;
        if bg < MIN_VALID_BG || buckets[i + 3].glucose < MIN_VALID_BG {
            continue;
        }
        let sens = profile.sens_at(bg_time);
        let avg_delta = (bg - buckets[i + 3].glucose) / 3.0;
        let delta = bg - buckets[i + 1].glucose;
        let activity = iob::sum_doses(&timeline.doses, profile, bg_time).activity;
        let bgi = round_to(-activity * sens * 5.0, 2);
        let deviation = delta - bgi;
        let in_ci_window = ci_time.is_some_and(|ci| ci > bg_time);

        if i == 0 {
            let cd = round_to(avg_delta - bgi, 3);
            current = Some(cd);
            if in_ci_window {
                out.all_deviations.push(cd.round());
            }
        } else if let (true, Some(ci), Some(cd)) = (in_ci_window, ci_time, current) {
            let avg_deviation = round_to(avg_delta - bgi, 3);
            let slope = (avg_deviation - cd) / minutes(bg_time - ci) * 5.0;
            if avg_deviation > out.max_deviation {
                out.slope_from_max_deviation = slope.min(0.0);
                out.max_deviation = avg_deviation;
            }
            if avg_deviation < out.min_deviation {
                out.slope_from_min_deviation = slope.max(0.0);
                out.min_deviation = avg_deviation;
            }
            out.all_deviations.push(avg_deviation.round());
        }

        if bg_time > meal_time {
            let ci = deviation.max(current.unwrap_or(0.0) / 2.0);
            if ci > floor {
                out.carbs_absorbed += ci * profile.carb_ratio / sens;
            }
        }
    }
    out.current_deviation = current;
    tracing::trace!(
        buckets = buckets.len(),
        carbs_absorbed = out.carbs_absorbed,
        current_deviation = ?out.current_deviation,
        "absorption pass"
    );
    out
}

/// Meal state for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputedCarbs {
    pub carbs: f64,
    #[serde(rename = "mealCOB")]
    pub meal_cob: f64,
    pub current_deviation: Option<f64>,
    pub max_deviation: f64,
    pub min_deviation: f64,
    pub slope_from_max_deviation: f64,
    pub slope_from_min_deviation: f64,
    pub all_deviations: Vec<f64>,
    pub last_carb_time: Option<DateTime<Utc>>,
}

impl ComputedCarbs {
    /// No carbs and no deviation history.
    pub const fn empty() -> Self {
        Self {
            carbs: 0.0,
            meal_cob: 0.0,
            current_deviation: None,
            max_deviation: 0.0,
            min_deviation: 999.0,
            slope_from_max_deviation: 0.0,
            slope_from_min_deviation: 999.0,
            all_deviations: Vec::new(),
            last_carb_time: None,
        }
    }
}

/// Carbs on board at `now`.
///
/// Each entry from the last six hours gets its own absorption pass, newest
/// first; entries whose pass yields less COB than the running maximum are
/// dropped from the carb total. A final pass over the last six hours supplies
/// the deviation statistics. COB is capped at `max_cob` and zeroed when no
/// current deviation could be computed.
pub fn meal_totals(
    carbs: &[CarbEntry],
    glucose: &[Sample],
    timeline: &Timeline,
    profile: &Profile,
    now: DateTime<Utc>,
) -> ComputedCarbs {
    let window_start = now - Duration::hours(MAX_MEAL_ABSORPTION_HOURS as i64);
    let mut entries: Vec<&CarbEntry> = carbs
        .iter()
        .filter(|c| c.timestamp > window_start && c.timestamp <= now && c.carbs >= 1.0)
        .collect();
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut total = 0.0;
    let mut meal_cob: f64 = 0.0;
    let mut to_remove = 0.0;
    let mut last_carb_time: Option<DateTime<Utc>> = None;
    for entry in entries {
        total += entry.carbs;
        last_carb_time = Some(last_carb_time.map_or(entry.timestamp, |t| t.max(entry.timestamp)));
        let pass = detect_absorption(glucose, timeline, profile, entry.timestamp, None);
        let cob = (total - pass.carbs_absorbed).max(0.0);
        meal_cob = meal_cob.max(cob);
        if cob < meal_cob {
            to_remove += entry.carbs;
        } else {
            to_remove = 0.0;
        }
    }
    total -= to_remove;

    let stats = detect_absorption(glucose, timeline, profile, window_start, Some(now));
    meal_cob = meal_cob.min(profile.preferences.max_cob);
    if stats.current_deviation.is_none() {
        meal_cob = 0.0;
    }

    let out = ComputedCarbs {
        carbs: round_to(total, 3),
        meal_cob: meal_cob.round(),
        current_deviation: stats.current_deviation.map(|d| round_to(d, 2)),
        max_deviation: round_to(stats.max_deviation, 2),
        min_deviation: round_to(stats.min_deviation, 2),
        slope_from_max_deviation: round_to(stats.slope_from_max_deviation, 3),
        slope_from_min_deviation: round_to(stats.slope_from_min_deviation, 3),
        all_deviations: stats.all_deviations,
        last_carb_time,
    };
    tracing::debug!(
        carbs = out.carbs,
        cob = out.meal_cob,
        current_deviation = ?out.current_deviation,
        "meal totals"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleStep;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn series(start: DateTime<Utc>, step_min: i64, values: &[f64]) -> Vec<Sample> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Sample { date: start - Duration::minutes(step_min * i as i64), glucose: *v })
            .collect()
    }

    fn profile() -> Profile {
        crate::test_support::profile_with_basal(vec![ScheduleStep { offset: 0, value: 1.0 }])
    }

    #[test]
    fn gaps_are_interpolated_at_five_minutes() {
        let t0 = at("2024-05-01T08:00:00Z");
        let s = vec![
            Sample { date: t0, glucose: 120.0 },
            Sample { date: t0 - Duration::minutes(20), glucose: 100.0 },
        ];
        let b = bucket(&s, t0 - Duration::hours(1), None);
        let dates: Vec<i64> = b.iter().map(|x| (t0 - x.date).num_minutes()).collect();
        assert_eq!(dates, vec![0, 5, 10, 15]);
        assert_eq!(b[1].glucose, 115.0);
    }

    #[test]
    fn close_samples_are_averaged() {
        let t0 = at("2024-05-01T08:00:00Z");
        let s = vec![
            Sample { date: t0, glucose: 120.0 },
            Sample { date: t0 - Duration::minutes(1), glucose: 110.0 },
            Sample { date: t0 - Duration::minutes(5), glucose: 100.0 },
        ];
        let b = bucket(&s, t0 - Duration::hours(1), None);
        assert_eq!(b.len(), 2);
        assert_eq!(b[0].glucose, 115.0);
    }

    #[test]
    fn keeps_one_pre_meal_sample() {
        let t0 = at("2024-05-01T08:00:00Z");
        let s = series(t0, 5, &[120.0, 118.0, 116.0, 114.0, 112.0]);
        let b = bucket(&s, t0 - Duration::minutes(7), None);
        // 0, 5 are after the meal; 10 precedes it and is the last one kept.
        assert_eq!(b.len(), 3);
    }

    #[test]
    fn rising_glucose_absorbs_carbs() {
        let now = at("2024-05-01T08:00:00Z");
        let glucose = series(now, 5, &[180.0, 165.0, 150.0, 135.0, 120.0, 110.0, 100.0]);
        let carbs = [CarbEntry { timestamp: now - Duration::minutes(40), carbs: 40.0 }];
        let meal = meal_totals(&carbs, &glucose, &Timeline::default(), &profile(), now);
        assert_eq!(meal.carbs, 40.0);
        assert!(meal.meal_cob > 0.0 && meal.meal_cob < 40.0);
        assert_eq!(meal.current_deviation, Some(15.0));
        assert_eq!(meal.last_carb_time, Some(now - Duration::minutes(40)));
    }

    #[test]
    fn input_order_does_not_change_totals() {
        let now = at("2024-05-01T08:00:00Z");
        let values: Vec<f64> = (0..24).map(|i| 200.0 - 3.0 * f64::from(i)).collect();
        let newest_first = series(now, 5, &values);
        let mut oldest_first = newest_first.clone();
        oldest_first.reverse();
        let mut with_dup = oldest_first.clone();
        with_dup.push(newest_first[0]);
        let carbs = [CarbEntry { timestamp: now - Duration::minutes(60), carbs: 40.0 }];
        let p = profile();
        let a = meal_totals(&carbs, &newest_first, &Timeline::default(), &p, now);
        let b = meal_totals(&carbs, &oldest_first, &Timeline::default(), &p, now);
        let c = meal_totals(&carbs, &with_dup, &Timeline::default(), &p, now);
        assert_eq!(a.current_deviation, Some(3.0));
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn flat_glucose_absorbs_nothing() {
        let now = at("2024-05-01T08:00:00Z");
        let glucose = series(now, 5, &[100.0; 8]);
        let carbs = [CarbEntry { timestamp: now - Duration::minutes(30), carbs: 20.0 }];
        let meal = meal_totals(&carbs, &glucose, &Timeline::default(), &profile(), now);
        assert_eq!(meal.meal_cob, 20.0);
    }

    #[test]
    fn cob_is_zero_without_deviation_data() {
        let now = at("2024-05-01T08:00:00Z");
        let carbs = [CarbEntry { timestamp: now - Duration::minutes(30), carbs: 20.0 }];
        let meal = meal_totals(&carbs, &[], &Timeline::default(), &profile(), now);
        assert_eq!(meal.meal_cob, 0.0);
        assert_eq!(meal.carbs, 20.0);
    }

    #[test]
    fn cob_is_capped() {
        let now = at("2024-05-01T08:00:00Z");
        let glucose = series(now, 5, &[100.0; 8]);
        let carbs = [CarbEntry { timestamp: now - Duration::minutes(30), carbs: 300.0 }];
        let meal = meal_totals(&carbs, &glucose, &Timeline::default(), &profile(), now);
        assert_eq!(meal.meal_cob, 120.0);
    }
}
