//! Temp-basal commit: safety clamp and redundant-command suppression.

use serde::Serialize;

use oref_config::CurrentTemp;

use crate::profile::Profile;
use crate::util::round_basal;

/// Highest rate any temp may run at.
///
/// `min(max_basal, daily_mult × max_daily_basal, current_mult × current_basal)`.
pub fn max_safe_basal(profile: &Profile) -> f64 {
    let prefs = &profile.preferences;
    profile
        .max_basal
        .min(prefs.max_daily_safety_multiplier * profile.max_daily_basal)
        .min(prefs.current_basal_safety_multiplier * profile.current_basal)
}

/// What the pump should do with the temp basal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestedTemp {
    /// `None` when no pump command is needed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Reason fragment to append, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl RequestedTemp {
    pub const fn set(rate: f64, duration: f64) -> Self {
        Self { rate: Some(rate), duration: Some(duration), note: None }
    }

    pub const fn cancel() -> Self {
        Self::set(0.0, 0.0)
    }

    pub const fn none() -> Self {
        Self { rate: None, duration: None, note: None }
    }

    fn with_note(mut self, note: String) -> Self {
        self.note = Some(note);
        self
    }
}

/// Clamp `rate` into `[0, max_safe_basal]` and decide the pump action.
///
/// A running temp of comparable duration within ±20% of the request is left
/// alone. A request equal to the current basal is issued as a neutral temp, or
/// with `skip_neutral_temps` cancels a running temp (and does nothing otherwise).
pub fn set_temp_basal(
    rate: f64,
    duration: f64,
    profile: &Profile,
    current: Option<&CurrentTemp>,
) -> RequestedTemp {
    let max_safe = max_safe_basal(profile);
    let clamped = if rate < 0.0 || !rate.is_finite() {
        0.0
    } else {
        rate.min(max_safe)
    };
    let suggested = round_basal(clamped, profile.pump_model.as_deref()).min(max_safe);

    if let Some(ct) = current
        && ct.duration > duration - 10.0
        && ct.duration <= 120.0
        && suggested <= ct.rate * 1.2
        && suggested >= ct.rate * 0.8
        && duration > 0.0
    {
        return RequestedTemp::none().with_note(format!(
            " {}m left and {} ~ req {}U/hr: no temp required",
            ct.duration, ct.rate, suggested
        ));
    }

    if suggested == round_basal(profile.current_basal, profile.pump_model.as_deref()) {
        if profile.preferences.skip_neutral_temps {
            if current.is_some_and(|ct| ct.duration > 0.0) {
                return RequestedTemp::cancel().with_note(
                    "Suggested rate is same as profile rate, a temp basal is active, canceling current temp"
                        .to_owned(),
                );
            }
            return RequestedTemp::none().with_note(
                "Suggested rate is same as profile rate, no temp basal is active, doing nothing"
                    .to_owned(),
            );
        }
        return RequestedTemp::set(suggested, duration).with_note(format!(
            "Setting neutral temp basal of {}U/hr",
            profile.current_basal
        ));
    }
    RequestedTemp::set(suggested, duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleStep;

    fn profile() -> Profile {
        let mut p = crate::test_support::profile_with_basal(vec![ScheduleStep { offset: 0, value: 1.0 }]);
        p.max_basal = 3.0;
        p
    }

    #[test]
    fn clamps_to_max_safe() {
        let p = profile();
        assert_eq!(max_safe_basal(&p), 3.0);
        assert_eq!(set_temp_basal(10.0, 30.0, &p, None), RequestedTemp::set(3.0, 30.0));
    }

    #[test]
    fn negative_rate_becomes_zero_and_keeps_duration() {
        let p = profile();
        assert_eq!(set_temp_basal(-1.0, 45.0, &p, None), RequestedTemp::set(0.0, 45.0));
    }

    #[test]
    fn similar_running_temp_is_kept() {
        let p = profile();
        let ct = CurrentTemp { rate: 2.0, duration: 25.0, ..CurrentTemp::default() };
        let r = set_temp_basal(2.2, 30.0, &p, Some(&ct));
        assert_eq!(r.rate, None);
        assert!(r.note.unwrap().contains("no temp required"));
    }

    #[test]
    fn neutral_temp_with_skip_cancels_only_running_temp() {
        let mut p = profile();
        p.preferences.skip_neutral_temps = true;
        let ct = CurrentTemp { rate: 0.5, duration: 20.0, ..CurrentTemp::default() };
        let r = set_temp_basal(1.0, 30.0, &p, Some(&ct));
        assert_eq!((r.rate, r.duration), (Some(0.0), Some(0.0)));
        let r = set_temp_basal(1.0, 30.0, &p, None);
        assert_eq!(r.rate, None);
        assert!(r.note.unwrap().contains("doing nothing"));
    }

    #[test]
    fn neutral_check_uses_pump_resolution_basal() {
        let mut p = profile();
        p.current_basal = 1.03;
        p.preferences.skip_neutral_temps = true;
        let r = set_temp_basal(1.05, 30.0, &p, None);
        assert_eq!(r.rate, None);
        assert!(r.note.unwrap().contains("doing nothing"));
    }

    #[test]
    fn neutral_temp_without_skip_is_issued() {
        let p = profile();
        let r = set_temp_basal(1.0, 30.0, &p, None);
        assert_eq!((r.rate, r.duration), (Some(1.0), Some(30.0)));
        assert!(r.note.unwrap().starts_with("Setting neutral temp"));
    }
}
