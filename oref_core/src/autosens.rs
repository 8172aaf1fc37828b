//! Sensitivity detection from glucose deviations over the last day.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;

use oref_config::{CarbEntry, PumpEventKind, PumpHistoryEvent, TempTarget};

use crate::glucose::Sample;
use crate::iob::{self, Timeline};
use crate::profile::Profile;
use crate::util::{percentile, round_to};

/// Most deviations considered (24 h of 5-minute samples).
pub const MAX_DEVIATIONS: usize = 288;
/// Lookback when no site change bounds it (hours).
pub const DEFAULT_LOOKBACK_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Autosens {
    pub ratio: f64,
    /// ISF implied by the ratio.
    #[serde(rename = "newisf", skip_serializing_if = "Option::is_none")]
    pub new_isf: Option<f64>,
}

impl Autosens {
    pub const NEUTRAL: Self = Self { ratio: 1.0, new_isf: None };
}

impl Default for Autosens {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

/// Start of the autosens lookback.
///
/// With `rewind_resets_autosens` the most recent rewind inside the default
/// window bounds it; otherwise it is 24 hours before `now`.
pub fn determine_last_site_change(
    history: &[PumpHistoryEvent],
    rewind_resets_autosens: bool,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let default = now - Duration::hours(DEFAULT_LOOKBACK_HOURS);
    if !rewind_resets_autosens {
        return default;
    }
    history
        .iter()
        .filter(|e| matches!(e.kind, PumpEventKind::Rewind) && e.timestamp <= now)
        .map(|e| e.timestamp)
        .max()
        .map_or(default, |rewind| rewind.max(default))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Period {
    CarbAbsorption,
    Unannounced,
    NonMeal,
}

fn temp_target_at(temp_targets: &[TempTarget], t: DateTime<Utc>) -> Option<f64> {
    let mut sorted: Vec<&TempTarget> = temp_targets.iter().filter(|tt| tt.created_at <= t).collect();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let tt = sorted.first()?;
    if tt.duration_min <= 0.0 {
        return None;
    }
    let expires = tt.created_at + Duration::seconds((tt.duration_min * 60.0) as i64);
    (t < expires).then(|| (tt.target_top + tt.target_bottom) / 2.0)
}

/// Oldest-first buckets: samples within 2 minutes are averaged.
fn bucket(glucose: &[Sample], since: DateTime<Utc>) -> Vec<Sample> {
    let mut data: Vec<Sample> = glucose.iter().filter(|s| s.glucose >= 39.0).copied().collect();
    data.sort_by_key(|s| s.date);
    let mut out: Vec<Sample> = Vec::with_capacity(data.len());
    for s in data {
        match out.last_mut() {
            Some(last) if (s.date - last.date).num_seconds().abs() <= 120 => {
                last.glucose = (last.glucose + s.glucose) / 2.0;
            }
            _ => out.push(s),
        }
    }
    out.retain(|s| s.date >= since);
    out
}

/// Inputs of one autosens run.
#[derive(Debug, Clone, Copy)]
pub struct AutosensInputs<'a> {
    pub glucose: &'a [Sample],
    pub timeline: &'a Timeline,
    pub history: &'a [PumpHistoryEvent],
    pub carbs: &'a [CarbEntry],
    pub temp_targets: &'a [TempTarget],
    pub now: DateTime<Utc>,
}

/// Deviations that count toward sensitivity, oldest first.
fn collect_deviations(inputs: &AutosensInputs<'_>, profile: &Profile) -> Vec<f64> {
    let prefs = &profile.preferences;
    let since = determine_last_site_change(inputs.history, prefs.rewind_resets_autosens, inputs.now);
    let buckets = bucket(inputs.glucose, since);

    let mut meals: Vec<&CarbEntry> = inputs
        .carbs
        .iter()
        .filter(|c| c.timestamp >= since && c.timestamp <= inputs.now)
        .collect();
    meals.sort_by_key(|c| c.timestamp);
    let mut meals = meals.into_iter().peekable();

    let mut deviations = Vec::new();
    let mut meal_cob = 0.0_f64;
    let mut meal_carbs = 0.0_f64;
    let mut absorbing = false;
    let mut uam = false;

    for i in 3..buckets.len() {
        let bg_time = buckets[i].date;
        let bg = buckets[i].glucose;
        if bg < 40.0 || buckets[i - 3].glucose < 40.0 {
            continue;
        }
        let sens = profile.sens_at(bg_time);
        let delta = bg - buckets[i - 1].glucose;
        let totals = iob::sum_doses(&inputs.timeline.doses, profile, bg_time);
        let bgi = round_to(-totals.activity * sens * 5.0, 2);
        let mut deviation = delta - bgi;
        if bg < 80.0 && deviation > 0.0 {
            deviation = 0.0;
        }
        let deviation = round_to(deviation, 2);

        while let Some(meal) = meals.next_if(|m| m.timestamp <= bg_time) {
            meal_cob += meal.carbs;
            meal_carbs += meal.carbs;
        }
        if meal_cob > 0.0 {
            let ci = deviation.max(prefs.min_5m_carbimpact);
            meal_cob = (meal_cob - ci * profile.carb_ratio / sens).max(0.0);
        }

        let period = if meal_cob > 0.0 || absorbing || meal_carbs > 0.0 {
            absorbing = deviation > 0.0;
            if !absorbing && meal_cob <= 0.0 {
                meal_carbs = 0.0;
            }
            Period::CarbAbsorption
        } else {
            let basal = profile.basal_at(bg_time).unwrap_or(profile.current_basal);
            if totals.iob > 2.0 * basal || uam {
                uam = deviation > 0.0;
                Period::Unannounced
            } else {
                Period::NonMeal
            }
        };

        if period != Period::CarbAbsorption {
            match temp_target_at(inputs.temp_targets, bg_time) {
                Some(tt) => {
                    let raises = prefs.high_temptarget_raises_sensitivity && tt > 100.0;
                    let lowers = prefs.low_temptarget_lowers_sensitivity && tt < 100.0;
                    if raises || lowers {
                        deviations.push(-(tt - 100.0) / 20.0);
                    }
                }
                None => deviations.push(deviation),
            }
        }

        let local = bg_time.naive_utc() + Duration::minutes(i64::from(profile.utc_offset_minutes));
        if local.minute() < 5 {
            deviations.push(0.0);
        }
        tracing::trace!(at = %bg_time, bg, deviation, ?period, "autosens bucket");
    }

    if deviations.len() > MAX_DEVIATIONS {
        deviations.drain(..deviations.len() - MAX_DEVIATIONS);
    }
    deviations
}

/// Sensitivity ratio from the median deviation, clamped to the autosens bounds.
///
/// No usable deviations yields a neutral ratio of 1.0.
pub fn compute_ratio(inputs: &AutosensInputs<'_>, profile: &Profile) -> Autosens {
    let mut deviations = collect_deviations(inputs, profile);
    if deviations.is_empty() {
        tracing::debug!("autosens: no deviations, ratio 1.0");
        return Autosens::NEUTRAL;
    }
    deviations.sort_by(f64::total_cmp);
    ratio_from_sorted(&deviations, profile)
}

fn ratio_from_sorted(sorted: &[f64], profile: &Profile) -> Autosens {
    let prefs = &profile.preferences;
    let median = percentile(sorted, 0.5);
    let basal_off = median * (60.0 / 5.0) / profile.sens;
    let raw = 1.0 + basal_off / profile.max_daily_basal;
    let ratio = round_to(raw.clamp(prefs.autosens_min, prefs.autosens_max), 2)
        .clamp(prefs.autosens_min, prefs.autosens_max);
    let new_isf = (profile.sens / ratio).round();
    tracing::debug!(samples = sorted.len(), median, ratio, new_isf, "autosens");
    Autosens {
        ratio,
        new_isf: Some(new_isf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleStep;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn profile() -> Profile {
        crate::test_support::profile_with_basal(vec![ScheduleStep { offset: 0, value: 1.0 }])
    }

    fn steady(now: DateTime<Utc>, per_5m: f64, n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| Sample {
                date: now - Duration::minutes(5 * i as i64),
                glucose: 150.0 - per_5m * i as f64,
            })
            .collect()
    }

    fn run(glucose: &[Sample], now: DateTime<Utc>) -> Autosens {
        let tl = Timeline::default();
        compute_ratio(
            &AutosensInputs {
                glucose,
                timeline: &tl,
                history: &[],
                carbs: &[],
                temp_targets: &[],
                now,
            },
            &profile(),
        )
    }

    #[test]
    fn no_data_is_neutral() {
        assert_eq!(run(&[], at("2024-05-01T08:00:00Z")), Autosens::NEUTRAL);
    }

    #[test]
    fn rising_without_insulin_means_resistance() {
        let now = at("2024-05-01T08:02:00Z");
        let a = run(&steady(now, 1.0, 60), now);
        assert!(a.ratio > 1.0);
        assert!(a.ratio <= 1.2);
    }

    #[test]
    fn falling_without_insulin_means_sensitivity() {
        let now = at("2024-05-01T08:02:00Z");
        let a = run(&steady(now, -1.0, 60), now);
        assert!(a.ratio < 1.0);
        assert!(a.ratio >= 0.7);
        assert_eq!(a.new_isf, Some((50.0 / a.ratio).round()));
    }

    #[test]
    fn rewind_bounds_the_lookback() {
        let now = at("2024-05-01T08:00:00Z");
        let h = [PumpHistoryEvent {
            id: String::new(),
            timestamp: at("2024-05-01T06:00:00Z"),
            kind: PumpEventKind::Rewind,
        }];
        assert_eq!(determine_last_site_change(&h, true, now), at("2024-05-01T06:00:00Z"));
        assert_eq!(determine_last_site_change(&h, false, now), at("2024-04-30T08:00:00Z"));
        assert_eq!(determine_last_site_change(&[], true, now), at("2024-04-30T08:00:00Z"));
    }

    #[test]
    fn temp_target_without_flags_is_excluded() {
        let now = at("2024-05-01T08:02:00Z");
        let tt = [TempTarget {
            created_at: now - Duration::hours(6),
            duration_min: 600.0,
            target_top: 140.0,
            target_bottom: 140.0,
        }];
        let tl = Timeline::default();
        let g = steady(now, 1.0, 60);
        let inputs = AutosensInputs {
            glucose: &g,
            timeline: &tl,
            history: &[],
            carbs: &[],
            temp_targets: &tt,
            now,
        };
        // Only the hourly zero pads remain.
        assert_eq!(compute_ratio(&inputs, &profile()).ratio, 1.0);
    }
}
