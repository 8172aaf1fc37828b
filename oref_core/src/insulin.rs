//! Exponential insulin-activity curves.
//!
//! Per unit of insulin, `activity` is the fraction acting per minute and `iob`
//! the fraction still on board. Callers multiply by the dose.

use oref_config::InsulinCurve;

/// DIA floor (hours) for the exponential curves.
pub const MIN_CURVE_DIA_HOURS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InsulinFraction {
    pub activity: f64,
    pub iob: f64,
}

/// Default peak and the allowed range for a custom peak, in minutes.
pub const fn peak_bounds(curve: InsulinCurve) -> (f64, f64, f64) {
    match curve {
        InsulinCurve::RapidActing => (75.0, 50.0, 120.0),
        InsulinCurve::UltraRapid => (55.0, 35.0, 100.0),
    }
}

/// Peak time to use for `curve`.
pub fn effective_peak(curve: InsulinCurve, use_custom: bool, custom_peak: f64) -> f64 {
    let (default, lo, hi) = peak_bounds(curve);
    if use_custom && custom_peak.is_finite() {
        custom_peak.clamp(lo, hi)
    } else {
        default
    }
}

/// Activity and remaining fraction `minutes` after a dose.
///
/// Zero before the dose and at or beyond DIA.
pub fn activity(minutes: f64, dia_hours: f64, peak: f64) -> InsulinFraction {
    let end = dia_hours.max(MIN_CURVE_DIA_HOURS) * 60.0;
    if !(minutes >= 0.0) || minutes >= end {
        return InsulinFraction::default();
    }
    let t = minutes;
    let tau = peak * (1.0 - peak / end) / (1.0 - 2.0 * peak / end);
    let a = 2.0 * tau / end;
    let s = 1.0 / (1.0 - a + (1.0 + a) * (-end / tau).exp());
    let act = (s / tau.powi(2)) * t * (1.0 - t / end) * (-t / tau).exp();
    let iob = 1.0
        - s * (1.0 - a)
            * ((t.powi(2) / (tau * end * (1.0 - a)) - t / tau - 1.0) * (-t / tau).exp() + 1.0);
    InsulinFraction {
        activity: act.max(0.0),
        iob: iob.clamp(0.0, 1.0),
    }
}
