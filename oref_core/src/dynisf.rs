//! Glucose-dependent insulin sensitivity ("dynamic ISF").

use serde::Serialize;

use oref_config::{CustomOrefVariables, InsulinCurve, TddSummary};

use crate::profile::Profile;
use crate::util::{round_to, trunc_to};

/// mg/dL to mmol/L factor used by the sigmoid transform.
const MMOL_FACTOR: f64 = 0.0555;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DynamicIsfResult {
    pub ratio: f64,
    pub insulin_factor: f64,
    pub tdd_ratio: f64,
    /// Current ISF divided by the ratio.
    pub isf: f64,
}

/// `120 - peak`, with fixed defaults per curve when no custom peak is used.
pub fn insulin_factor(profile: &Profile) -> f64 {
    let prefs = &profile.preferences;
    if prefs.use_custom_peak_time {
        let peak = crate::insulin::effective_peak(profile.curve, true, prefs.insulin_peak_time);
        120.0 - peak
    } else {
        match profile.curve {
            InsulinCurve::RapidActing => 55.0,
            InsulinCurve::UltraRapid => 70.0,
        }
    }
}

/// Weighted TDD: `w * recent + (1 - w) * average_14d`.
fn weighted_tdd(tdd: &TddSummary, weight: f64) -> Option<f64> {
    match (tdd.recent, tdd.average_14d) {
        (Some(r), Some(avg)) if avg > 0.0 => Some(weight * r + (1.0 - weight) * avg),
        (Some(r), _) => Some(r),
        _ => None,
    }
}

fn tdd_ratio(tdd: &TddSummary, weight: f64) -> f64 {
    match (weighted_tdd(tdd, weight), tdd.average_14d) {
        (Some(w), Some(avg)) if avg > 0.0 => round_to(w / avg, 2),
        _ => 1.0,
    }
}

/// Dynamic sensitivity ratio at glucose `bg`.
///
/// `None` unless the feature is on and the autosens bounds differ, or when the
/// logarithmic path has no TDD to work with.
pub fn calculate(
    profile: &Profile,
    bg: f64,
    tdd: &TddSummary,
    custom: &CustomOrefVariables,
) -> Option<DynamicIsfResult> {
    let prefs = &profile.preferences;
    if !prefs.use_new_formula || prefs.autosens_min == prefs.autosens_max {
        return None;
    }
    let (min, max) = (prefs.autosens_min, prefs.autosens_max);
    let factor = insulin_factor(profile);
    let tdd_ratio = tdd_ratio(tdd, prefs.weight_percentage);

    let raw = if prefs.sigmoid {
        let target = match (custom.use_override, custom.override_target) {
            (true, Some(t)) if t > 0.0 => t,
            _ => profile.target_bg(),
        };
        let interval = max - min;
        let bg_dev = (bg - target) * MMOL_FACTOR;
        let max_minus_one = if max == 1.0 { max + 0.01 - 1.0 } else { max - 1.0 };
        // Truncated to 2 decimals, so at target the ratio lands just under 1.0.
        let fix_offset = trunc_to(
            (1.0 / max_minus_one - min / max_minus_one).log10() / std::f64::consts::E.log10(),
            2,
        );
        let exponent = bg_dev * prefs.adjustment_factor_sigmoid * tdd_ratio + fix_offset;
        let mut ratio = interval / (1.0 + (-exponent).exp()) + min;
        let scales_isf_already = custom.isf_and_cr || custom.isf;
        if custom.use_override && !scales_isf_already {
            ratio *= custom.override_percentage / 100.0;
        }
        ratio
    } else {
        let tdd = weighted_tdd(tdd, prefs.weight_percentage)?;
        profile.sens * prefs.adjustment_factor * tdd * (bg / factor + 1.0).ln() / 1800.0
    };
    if !raw.is_finite() {
        tracing::warn!(raw, "dynamic ISF ratio not finite; ignored");
        return None;
    }
    let ratio = trunc_to(raw.clamp(min, max), 2);
    let out = DynamicIsfResult {
        ratio,
        insulin_factor: factor,
        tdd_ratio,
        isf: round_to(profile.sens / ratio, 1),
    };
    tracing::debug!(
        ratio = out.ratio,
        insulin_factor = out.insulin_factor,
        tdd_ratio = out.tdd_ratio,
        sigmoid = prefs.sigmoid,
        "dynamic ISF"
    );
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleStep;

    fn profile(sigmoid: bool) -> Profile {
        let mut p = crate::test_support::profile_with_basal(vec![ScheduleStep { offset: 0, value: 1.0 }]);
        p.preferences.use_new_formula = true;
        p.preferences.sigmoid = sigmoid;
        p.min_bg = 100.0;
        p.max_bg = 100.0;
        p
    }

    fn tdd(recent: f64, avg: f64) -> TddSummary {
        TddSummary { recent: Some(recent), average_14d: Some(avg) }
    }

    #[test]
    fn disabled_or_degenerate_bounds_give_none() {
        let mut p = profile(false);
        p.preferences.use_new_formula = false;
        assert!(calculate(&p, 120.0, &tdd(40.0, 40.0), &CustomOrefVariables::default()).is_none());
        let mut p = profile(true);
        p.preferences.autosens_min = 1.0;
        p.preferences.autosens_max = 1.0;
        assert!(calculate(&p, 120.0, &tdd(40.0, 40.0), &CustomOrefVariables::default()).is_none());
    }

    #[test]
    fn sigmoid_at_target_truncates_below_one() {
        let r = calculate(&profile(true), 100.0, &tdd(40.0, 40.0), &CustomOrefVariables::default())
            .unwrap();
        assert_eq!(r.tdd_ratio, 1.0);
        assert_eq!(r.ratio, 0.99);
        assert_eq!(r.isf, 50.5);
    }

    #[test]
    fn sigmoid_rises_with_glucose_and_stays_bounded() {
        let p = profile(true);
        let c = CustomOrefVariables::default();
        let low = calculate(&p, 70.0, &tdd(40.0, 40.0), &c).unwrap();
        let high = calculate(&p, 250.0, &tdd(40.0, 40.0), &c).unwrap();
        assert!(low.ratio < 1.0 && low.ratio >= 0.7);
        assert!(high.ratio > 1.0 && high.ratio <= 1.2);
    }

    #[test]
    fn log_formula_uses_weighted_tdd() {
        let p = profile(false);
        let r = calculate(&p, 100.0, &tdd(40.0, 40.0), &CustomOrefVariables::default()).unwrap();
        // 50 * 0.8 * 40 * ln(100/55 + 1) / 1800 = 0.921..
        assert_eq!(r.ratio, 0.92);
        assert_eq!(r.insulin_factor, 55.0);
    }

    #[test]
    fn log_formula_without_tdd_gives_none() {
        let p = profile(false);
        assert!(calculate(&p, 100.0, &TddSummary::default(), &CustomOrefVariables::default()).is_none());
    }

    #[test]
    fn custom_peak_changes_insulin_factor() {
        let mut p = profile(false);
        p.preferences.use_custom_peak_time = true;
        p.preferences.insulin_peak_time = 60.0;
        assert_eq!(insulin_factor(&p), 60.0);
        p.curve = InsulinCurve::UltraRapid;
        p.preferences.insulin_peak_time = 10.0;
        assert_eq!(insulin_factor(&p), 85.0);
    }
}
