//! Profile resolution: one immutable `Profile` per cycle from settings,
//! overrides and temp targets.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use oref_config::{
    CustomOrefVariables, GlucoseUnits, InsulinCurve, Preferences, Settings, TargetOverride,
    TempTarget,
};

use crate::error::{ProfileError, Result};
use crate::schedule::{self, ScheduleStep, TargetStep};
use crate::util::round_to;

/// Shortest DIA (hours) a profile may carry.
pub const MIN_DIA_HOURS: f64 = 1.0;
/// Smallest acceptable `max_basal` (U/h).
pub const MIN_MAX_BASAL: f64 = 0.1;
/// Smallest acceptable ISF (mg/dL per U).
pub const MIN_ISF: f64 = 5.0;
/// Hard safety band for BG targets (mg/dL).
pub const TARGET_FLOOR: f64 = 80.0;
pub const TARGET_CEILING: f64 = 200.0;

/// Resolved per-cycle configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    /// Basal in effect now, after override scaling.
    pub current_basal: f64,
    /// Basal in effect now, before override scaling.
    pub scheduled_basal: f64,
    pub max_daily_basal: f64,
    pub max_basal: f64,
    pub max_iob: f64,
    pub max_bolus: f64,
    pub bolus_increment: f64,
    pub dia: f64,
    /// ISF in effect now.
    pub sens: f64,
    pub carb_ratio: f64,
    pub min_bg: f64,
    pub max_bg: f64,
    pub temptarget_set: bool,
    pub utc_offset_minutes: i32,
    pub basal_schedule: Vec<ScheduleStep>,
    pub isf_schedule: Vec<ScheduleStep>,
    pub curve: InsulinCurve,
    pub out_units: GlucoseUnits,
    pub pump_model: Option<String>,
    /// Override percentage in effect (100 when none).
    pub override_percentage: f64,
    pub preferences: Preferences,
}

impl Profile {
    /// Midpoint of the target range.
    pub fn target_bg(&self) -> f64 {
        (self.min_bg + self.max_bg) / 2.0
    }

    /// Scheduled basal at `t`.
    pub fn basal_at(&self, t: DateTime<Utc>) -> Option<f64> {
        schedule::lookup(
            &self.basal_schedule,
            schedule::minute_of_day(t, self.utc_offset_minutes),
        )
    }

    /// ISF at `t`, falling back to the current ISF.
    pub fn sens_at(&self, t: DateTime<Utc>) -> f64 {
        schedule::lookup(
            &self.isf_schedule,
            schedule::minute_of_day(t, self.utc_offset_minutes),
        )
        .unwrap_or(self.sens)
    }

    pub fn minute_of_day(&self, t: DateTime<Utc>) -> u32 {
        schedule::minute_of_day(t, self.utc_offset_minutes)
    }
}

/// Scale factors an active override applies to basal, ISF and carb ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OverrideScale {
    basal: f64,
    isf: f64,
    cr: f64,
}

impl OverrideScale {
    fn from_custom(custom: &CustomOrefVariables) -> Self {
        if !custom.use_override || custom.override_percentage == 100.0 {
            return Self { basal: 1.0, isf: 1.0, cr: 1.0 };
        }
        let pct = custom.override_percentage / 100.0;
        let (isf, cr) = if custom.isf_and_cr {
            (true, true)
        } else {
            (custom.isf, custom.cr)
        };
        Self {
            basal: if custom.basal { pct } else { 1.0 },
            isf: if isf { pct } else { 1.0 },
            cr: if cr { pct } else { 1.0 },
        }
    }
}

/// The target range before clamping, plus whether a temp target set it.
fn resolve_targets(
    settings: &Settings,
    temp_targets: &[TempTarget],
    custom: &CustomOrefVariables,
    minute: u32,
    now: DateTime<Utc>,
) -> Result<(f64, f64, bool)> {
    let steps: Vec<TargetStep> = settings.targets.iter().map(TargetStep::from).collect();
    let window = schedule::lookup_target(&steps, minute)
        .ok_or_else(|| eyre::Report::new(ProfileError::EmptySchedule("targets")))?;
    let (mut low, mut high) = (window.low, window.high);

    let explicit = match (custom.use_override, custom.override_target) {
        (true, Some(t)) if t > 0.0 => TargetOverride::Target(t),
        _ => settings.preferences.target_bg,
    };
    if let TargetOverride::Target(t) = explicit {
        low = t;
        high = t;
    }

    let mut sorted: Vec<&TempTarget> = temp_targets.iter().collect();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let mut temptarget_set = false;
    for tt in sorted {
        if now < tt.created_at {
            continue;
        }
        if tt.duration_min <= 0.0 {
            // Explicit cancellation: the schedule stands.
            break;
        }
        let expires = tt.created_at + Duration::seconds((tt.duration_min * 60.0).round() as i64);
        if now < expires {
            low = tt.target_bottom;
            high = tt.target_top;
            temptarget_set = true;
            break;
        }
    }

    let low = low.clamp(TARGET_FLOOR, TARGET_CEILING);
    let high = high.clamp(TARGET_FLOOR, TARGET_CEILING);
    Ok((low, high.max(low), temptarget_set))
}

/// Resolve the profile in effect at `now`.
///
/// Fails without producing a partial profile when any invariant is violated.
pub fn resolve(
    settings: &Settings,
    temp_targets: &[TempTarget],
    custom: &CustomOrefVariables,
    now: DateTime<Utc>,
) -> Result<Profile> {
    let prefs = &settings.preferences;
    let pump = &settings.pump;
    if !(pump.dia >= MIN_DIA_HOURS) {
        return Err(eyre::Report::new(ProfileError::InvalidDia {
            dia: pump.dia,
            min: MIN_DIA_HOURS,
        }));
    }
    if settings.basal.is_empty() {
        return Err(eyre::Report::new(ProfileError::EmptySchedule("basal")));
    }
    if settings.isf.is_empty() {
        return Err(eyre::Report::new(ProfileError::EmptySchedule("isf")));
    }
    if settings.carb_ratio.is_empty() {
        return Err(eyre::Report::new(ProfileError::EmptySchedule("carb_ratio")));
    }
    if settings.targets.is_empty() {
        return Err(eyre::Report::new(ProfileError::EmptySchedule("targets")));
    }

    let scale = OverrideScale::from_custom(custom);
    let minute = schedule::minute_of_day(now, settings.utc_offset_minutes);

    let raw_basal: Vec<ScheduleStep> = settings.basal.iter().map(ScheduleStep::from).collect();
    let scheduled_basal = round_to(schedule::lookup(&raw_basal, minute).unwrap_or(0.0), 3);
    let basal_schedule: Vec<ScheduleStep> = raw_basal
        .iter()
        .map(|s| ScheduleStep { offset: s.offset, value: s.value * scale.basal })
        .collect();
    let current_basal = round_to(schedule::lookup(&basal_schedule, minute).unwrap_or(0.0), 3);
    if !(current_basal > 0.0) {
        return Err(eyre::Report::new(ProfileError::InvalidCurrentBasal(current_basal)));
    }
    let max_daily_basal = round_to(schedule::max_value(&basal_schedule), 3);
    if !(max_daily_basal > 0.0) {
        return Err(eyre::Report::new(ProfileError::InvalidMaxDailyBasal(max_daily_basal)));
    }
    if !(pump.max_basal >= MIN_MAX_BASAL) {
        return Err(eyre::Report::new(ProfileError::InvalidMaxBasal {
            max_basal: pump.max_basal,
            min: MIN_MAX_BASAL,
        }));
    }

    let isf_schedule: Vec<ScheduleStep> = settings
        .isf
        .iter()
        .map(|s| ScheduleStep { offset: s.offset, value: s.value / scale.isf })
        .collect();
    let sens = schedule::lookup(&isf_schedule, minute).unwrap_or(0.0);
    if !(sens >= MIN_ISF) {
        return Err(eyre::Report::new(ProfileError::InvalidIsf { isf: sens, min: MIN_ISF }));
    }

    let cr_schedule: Vec<ScheduleStep> =
        settings.carb_ratio.iter().map(ScheduleStep::from).collect();
    let carb_ratio = schedule::lookup(&cr_schedule, minute).unwrap_or(0.0) / scale.cr;
    if !(carb_ratio > 0.0) || !carb_ratio.is_finite() {
        return Err(eyre::Report::new(ProfileError::InvalidCarbRatio(carb_ratio)));
    }

    let (min_bg, max_bg, temptarget_set) =
        resolve_targets(settings, temp_targets, custom, minute, now)?;

    let profile = Profile {
        current_basal,
        scheduled_basal,
        max_daily_basal,
        max_basal: pump.max_basal,
        max_iob: prefs.max_iob,
        max_bolus: pump.max_bolus,
        bolus_increment: pump.bolus_increment,
        dia: pump.dia,
        sens,
        carb_ratio,
        min_bg,
        max_bg,
        temptarget_set,
        utc_offset_minutes: settings.utc_offset_minutes,
        basal_schedule,
        isf_schedule,
        curve: prefs.curve,
        out_units: prefs.out_units,
        pump_model: pump.model.clone(),
        override_percentage: if custom.use_override {
            custom.override_percentage
        } else {
            100.0
        },
        preferences: prefs.clone(),
    };
    tracing::debug!(
        current_basal = profile.current_basal,
        max_daily_basal = profile.max_daily_basal,
        sens = profile.sens,
        carb_ratio = profile.carb_ratio,
        min_bg = profile.min_bg,
        max_bg = profile.max_bg,
        temptarget_set,
        "profile resolved"
    );
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        oref_config::load_json(
            r#"{
            "basal": [{"start":"00:00:00","offset":0,"value":1.0},{"start":"06:00:00","offset":360,"value":1.5}],
            "isf": [{"offset":0,"value":50}],
            "carb_ratio": [{"offset":0,"value":10}],
            "targets": [{"offset":0,"low":100,"high":110}],
            "pump": {"max_basal": 3.0, "dia": 5}
        }"#,
        )
        .unwrap()
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn resolves_current_values() {
        let p = resolve(&settings(), &[], &CustomOrefVariables::default(), at("2024-05-01T07:00:00Z"))
            .unwrap();
        assert_eq!(p.current_basal, 1.5);
        assert_eq!(p.max_daily_basal, 1.5);
        assert_eq!(p.sens, 50.0);
        assert_eq!(p.target_bg(), 105.0);
        assert!(!p.temptarget_set);
    }

    #[test]
    fn newest_active_temp_target_wins() {
        let tts = [
            TempTarget {
                created_at: at("2024-05-01T06:00:00Z"),
                duration_min: 120.0,
                target_top: 140.0,
                target_bottom: 140.0,
            },
            TempTarget {
                created_at: at("2024-05-01T06:30:00Z"),
                duration_min: 60.0,
                target_top: 150.0,
                target_bottom: 150.0,
            },
        ];
        let p = resolve(&settings(), &tts, &CustomOrefVariables::default(), at("2024-05-01T07:00:00Z"))
            .unwrap();
        assert_eq!((p.min_bg, p.max_bg), (150.0, 150.0));
        assert!(p.temptarget_set);
    }

    #[test]
    fn zero_duration_temp_target_cancels() {
        let tts = [
            TempTarget {
                created_at: at("2024-05-01T06:00:00Z"),
                duration_min: 120.0,
                target_top: 140.0,
                target_bottom: 140.0,
            },
            TempTarget {
                created_at: at("2024-05-01T06:30:00Z"),
                duration_min: 0.0,
                target_top: 0.0,
                target_bottom: 0.0,
            },
        ];
        let p = resolve(&settings(), &tts, &CustomOrefVariables::default(), at("2024-05-01T07:00:00Z"))
            .unwrap();
        assert_eq!((p.min_bg, p.max_bg), (100.0, 110.0));
        assert!(!p.temptarget_set);
    }

    #[test]
    fn targets_are_clamped_to_safety_band() {
        let tts = [TempTarget {
            created_at: at("2024-05-01T06:00:00Z"),
            duration_min: 120.0,
            target_top: 250.0,
            target_bottom: 60.0,
        }];
        let p = resolve(&settings(), &tts, &CustomOrefVariables::default(), at("2024-05-01T07:00:00Z"))
            .unwrap();
        assert_eq!((p.min_bg, p.max_bg), (80.0, 200.0));
    }

    #[test]
    fn override_scales_basal_isf_and_cr() {
        let custom = CustomOrefVariables {
            use_override: true,
            override_percentage: 120.0,
            override_target: Some(90.0),
            ..CustomOrefVariables::default()
        };
        let p = resolve(&settings(), &[], &custom, at("2024-05-01T07:00:00Z")).unwrap();
        assert_eq!(p.current_basal, 1.8);
        assert_eq!(p.scheduled_basal, 1.5);
        assert!((p.sens - 50.0 / 1.2).abs() < 1e-9);
        assert!((p.carb_ratio - 10.0 / 1.2).abs() < 1e-9);
        assert_eq!((p.min_bg, p.max_bg), (90.0, 90.0));
    }

    #[test]
    fn low_isf_is_rejected() {
        let mut s = settings();
        s.isf[0].value = 4.0;
        let err = resolve(&s, &[], &CustomOrefVariables::default(), at("2024-05-01T07:00:00Z"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProfileError>(),
            Some(ProfileError::InvalidIsf { .. })
        ));
    }
}
