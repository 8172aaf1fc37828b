//! Forecast curves: IOB-only, zero-temp, carb (COB) and unannounced-meal (UAM).

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::iob::IobResult;
use crate::meal::ComputedCarbs;
use crate::profile::Profile;
use crate::util::round_to;

/// Points kept per curve (four hours at 5 minutes).
pub const MAX_POINTS: usize = 48;
/// Insulin peak plus delivery lag, in 5-minute ticks (90 minutes).
const INSULIN_PEAK_TICKS: usize = 18;
const MAX_CARB_ABSORPTION_G_PER_H: f64 = 30.0;
const ASSUMED_CARB_ABSORPTION_G_PER_H: f64 = 20.0;
const MIN_REMAINING_CA_HOURS: f64 = 3.0;
const REMAINING_CARBS_CAP_LIMIT: f64 = 90.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Predictions {
    #[serde(rename = "IOB")]
    pub iob: Vec<f64>,
    #[serde(rename = "ZT")]
    pub zt: Vec<f64>,
    #[serde(rename = "COB", skip_serializing_if = "Option::is_none")]
    pub cob: Option<Vec<f64>>,
    #[serde(rename = "UAM", skip_serializing_if = "Option::is_none")]
    pub uam: Option<Vec<f64>>,
}

/// Everything the guards need from the forecast.
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    pub predictions: Predictions,
    /// Eventual BG raised by the COB/UAM curves where they apply.
    pub eventual_bg: f64,
    pub min_pred_bg: f64,
    pub min_guard_bg: f64,
    pub min_iob_pred_bg: f64,
    pub avg_pred_bg: f64,
    pub last_iob_pred_bg: f64,
    pub last_cob_pred_bg: Option<f64>,
    pub last_uam_pred_bg: Option<f64>,
    pub ci: f64,
    pub cid: f64,
    pub remaining_ci_peak: f64,
}

pub struct ForecastInputs<'a> {
    pub profile: &'a Profile,
    pub iob_array: &'a [IobResult],
    pub meal: &'a ComputedCarbs,
    pub bg: f64,
    pub sens: f64,
    pub target_bg: f64,
    pub threshold: f64,
    pub min_delta: f64,
    pub bgi: f64,
    pub eventual_bg: f64,
    pub sensitivity_ratio: f64,
    pub now: DateTime<Utc>,
}

fn clamp_curve(v: &[f64]) -> Vec<f64> {
    v.iter().map(|p| p.clamp(39.0, 401.0).round()).collect()
}

/// Drop a flat tail, keeping at least `keep` points.
fn trim_flat_tail(v: &mut Vec<f64>, keep: usize) {
    while v.len() > keep && v.len() >= 2 && v[v.len() - 2] == v[v.len() - 1] {
        v.pop();
    }
}

fn last(v: &[f64], fallback: f64) -> f64 {
    v.last().copied().unwrap_or(fallback)
}

#[allow(clippy::too_many_lines)]
pub fn forecast(inp: &ForecastInputs<'_>) -> Forecast {
    let prefs = &inp.profile.preferences;
    let meal = inp.meal;
    let sens = inp.sens;
    let enable_uam = prefs.enable_uam;

    let mut ci = round_to(inp.min_delta - inp.bgi, 1);
    let uci = ci;
    let csf = sens / inp.profile.carb_ratio;
    let max_ci = round_to(MAX_CARB_ABSORPTION_G_PER_H * csf * 5.0 / 60.0, 1);
    if ci > max_ci {
        ci = max_ci;
    }

    let ratio = if inp.sensitivity_ratio > 0.0 { inp.sensitivity_ratio } else { 1.0 };
    let mut remaining_ca_time = MIN_REMAINING_CA_HOURS / ratio;
    let mut fraction_carbs_left = 0.0;
    if meal.carbs > 0.0 {
        let min_time = remaining_ca_time.max(meal.meal_cob / ASSUMED_CARB_ABSORPTION_G_PER_H);
        let last_carb_age = meal
            .last_carb_time
            .map_or(0.0, |t| ((inp.now - t).num_milliseconds() as f64 / 60_000.0).round());
        fraction_carbs_left = meal.meal_cob / meal.carbs;
        remaining_ca_time = round_to(min_time + 1.5 * last_carb_age / 60.0, 1);
    }

    let total_ci = (ci / 5.0 * 60.0 * remaining_ca_time / 2.0).max(0.0);
    let total_ca = total_ci / csf;
    let carbs_cap = prefs.remaining_carbs_cap.min(REMAINING_CARBS_CAP_LIMIT);
    let carbs_ignore = 1.0 - prefs.remaining_carbs_fraction.min(1.0);
    let remaining_carbs = (meal.meal_cob - total_ca - meal.carbs * carbs_ignore)
        .max(0.0)
        .min(carbs_cap);
    let remaining_ci_peak = remaining_carbs * csf * 5.0 / 60.0 / (remaining_ca_time / 2.0);

    let slope_max = round_to(meal.slope_from_max_deviation, 2);
    let slope_min = round_to(meal.slope_from_min_deviation, 2);
    let slope_from_deviations = slope_max.min(-slope_min / 3.0);

    let cid = if ci == 0.0 {
        0.0
    } else {
        (remaining_ca_time * 60.0 / 5.0 / 2.0).min((meal.meal_cob * csf / ci).max(0.0))
    };
    let carbs_active = cid > 0.0 || remaining_ci_peak > 0.0;

    let bg = inp.bg;
    let mut iob_pred = vec![bg];
    let mut zt_pred = vec![bg];
    let mut cob_pred = vec![bg];
    let mut uam_pred = vec![bg];

    let (mut min_iob_pred, mut min_cob_pred, mut min_uam_pred) = (999.0_f64, 999.0_f64, 999.0_f64);
    let (mut min_iob_guard, mut min_cob_guard, mut min_uam_guard, mut min_zt_guard) =
        (999.0_f64, 999.0_f64, 999.0_f64, 999.0_f64);
    let mut max_cob_pred = bg;
    let (mut iob_pred_bg, mut cob_pred_bg, mut uam_pred_bg) = (inp.eventual_bg, bg, bg);

    for tick in inp.iob_array {
        let pred_bgi = round_to(-tick.totals.activity * sens * 5.0, 2);
        let pred_zt_bgi = round_to(-tick.with_zero_temp.activity * sens * 5.0, 2);
        let n_iob = iob_pred.len() as f64;
        let pred_dev = ci * (1.0 - (n_iob / (60.0 / 5.0)).min(1.0));
        iob_pred_bg = last(&iob_pred, bg) + pred_bgi + pred_dev;
        let zt_pred_bg = last(&zt_pred, bg) + pred_zt_bgi;

        let n_cob = cob_pred.len() as f64;
        let pred_ci = (ci.max(0.0) * (1.0 - n_cob / (cid * 2.0).max(1.0))).max(0.0);
        let intervals = n_cob.min(remaining_ca_time * 12.0 - n_cob);
        let remaining_ci = (intervals / (remaining_ca_time / 2.0 * 12.0) * remaining_ci_peak).max(0.0);
        cob_pred_bg = last(&cob_pred, bg) + pred_bgi + pred_dev.min(0.0) + pred_ci + remaining_ci;

        let n_uam = uam_pred.len() as f64;
        let pred_uci_slope = (uci + n_uam * slope_from_deviations).max(0.0);
        let pred_uci_max = (uci * (1.0 - n_uam / (3.0 * 60.0 / 5.0))).max(0.0);
        let pred_uci = pred_uci_slope.min(pred_uci_max);
        uam_pred_bg = last(&uam_pred, bg) + pred_bgi + pred_dev.min(0.0) + pred_uci;

        if iob_pred.len() < MAX_POINTS {
            iob_pred.push(iob_pred_bg);
        }
        if cob_pred.len() < MAX_POINTS {
            cob_pred.push(cob_pred_bg);
        }
        if uam_pred.len() < MAX_POINTS {
            uam_pred.push(uam_pred_bg);
        }
        if zt_pred.len() < MAX_POINTS {
            zt_pred.push(zt_pred_bg);
        }

        min_cob_guard = min_cob_guard.min(cob_pred_bg.round());
        min_uam_guard = min_uam_guard.min(uam_pred_bg.round());
        min_iob_guard = min_iob_guard.min(iob_pred_bg.round());
        min_zt_guard = min_zt_guard.min(zt_pred_bg.round());

        if iob_pred.len() > INSULIN_PEAK_TICKS && iob_pred_bg < min_iob_pred {
            min_iob_pred = iob_pred_bg.round();
        }
        if carbs_active && cob_pred.len() > INSULIN_PEAK_TICKS && cob_pred_bg < min_cob_pred {
            min_cob_pred = cob_pred_bg.round();
        }
        if carbs_active && cob_pred_bg > max_cob_pred {
            max_cob_pred = cob_pred_bg;
        }
        if enable_uam && uam_pred.len() > 12 && uam_pred_bg < min_uam_pred {
            min_uam_pred = uam_pred_bg.round();
        }
    }

    let mut iob_curve = clamp_curve(&iob_pred);
    trim_flat_tail(&mut iob_curve, 13);
    let mut zt_curve = clamp_curve(&zt_pred);
    while zt_curve.len() > 7 {
        let n = zt_curve.len();
        if zt_curve[n - 2] >= zt_curve[n - 1] || zt_curve[n - 1] <= inp.target_bg {
            break;
        }
        zt_curve.pop();
    }
    let last_iob_pred_bg = last(&iob_curve, bg);

    let mut eventual_bg = inp.eventual_bg;
    let mut cob_out = None;
    let mut last_cob_pred_bg = None;
    if meal.meal_cob > 0.0 && (ci > 0.0 || remaining_ci_peak > 0.0) {
        let mut c = clamp_curve(&cob_pred);
        trim_flat_tail(&mut c, 13);
        let l = last(&c, bg);
        last_cob_pred_bg = Some(l);
        eventual_bg = eventual_bg.max(l.round());
        cob_out = Some(c);
    }
    let mut uam_out = None;
    let mut last_uam_pred_bg = None;
    if (ci > 0.0 || remaining_ci_peak > 0.0) && enable_uam {
        let mut u = clamp_curve(&uam_pred);
        trim_flat_tail(&mut u, 13);
        let l = last(&u, bg);
        last_uam_pred_bg = Some(l);
        eventual_bg = eventual_bg.max(l.round());
        uam_out = Some(u);
    }

    let min_iob_pred = min_iob_pred.max(39.0);
    let min_cob_pred = min_cob_pred.max(39.0);
    let min_uam_pred = min_uam_pred.max(39.0);

    let mut avg_pred_bg = if min_uam_pred < 999.0 && min_cob_pred < 999.0 {
        ((1.0 - fraction_carbs_left) * uam_pred_bg + fraction_carbs_left * cob_pred_bg).round()
    } else if min_cob_pred < 999.0 {
        ((iob_pred_bg + cob_pred_bg) / 2.0).round()
    } else if min_uam_pred < 999.0 {
        ((iob_pred_bg + uam_pred_bg) / 2.0).round()
    } else {
        iob_pred_bg.round()
    };
    if min_zt_guard > avg_pred_bg {
        avg_pred_bg = min_zt_guard;
    }

    let min_guard_bg = if carbs_active {
        if enable_uam {
            fraction_carbs_left * min_cob_guard + (1.0 - fraction_carbs_left) * min_uam_guard
        } else {
            min_cob_guard
        }
    } else if enable_uam {
        min_uam_guard
    } else {
        min_iob_guard
    }
    .round();

    let threshold = inp.threshold;
    let min_zt_uam_pred = if min_zt_guard < threshold {
        (min_uam_pred + min_zt_guard) / 2.0
    } else if min_zt_guard < inp.target_bg {
        let blend = (min_zt_guard - threshold) / (inp.target_bg - threshold);
        let blended = min_uam_pred * blend + min_zt_guard * (1.0 - blend);
        (min_uam_pred + blended) / 2.0
    } else if min_zt_guard > min_uam_pred {
        (min_uam_pred + min_zt_guard) / 2.0
    } else {
        min_uam_pred
    }
    .round();

    let mut min_pred_bg = min_iob_pred.round();
    if meal.carbs > 0.0 {
        if !enable_uam && min_cob_pred < 999.0 {
            min_pred_bg = min_iob_pred.max(min_cob_pred).round();
        } else if min_cob_pred < 999.0 {
            let blended = fraction_carbs_left * min_cob_pred + (1.0 - fraction_carbs_left) * min_zt_uam_pred;
            min_pred_bg = min_iob_pred.max(min_cob_pred).max(blended).round();
        } else if enable_uam {
            min_pred_bg = min_zt_uam_pred;
        } else {
            min_pred_bg = min_guard_bg;
        }
    } else if enable_uam {
        min_pred_bg = min_iob_pred.max(min_zt_uam_pred).round();
    }
    min_pred_bg = min_pred_bg.min(avg_pred_bg);
    if max_cob_pred > bg {
        min_pred_bg = min_pred_bg.min(max_cob_pred);
    }

    Forecast {
        predictions: Predictions {
            iob: iob_curve,
            zt: zt_curve,
            cob: cob_out,
            uam: uam_out,
        },
        eventual_bg,
        min_pred_bg,
        min_guard_bg,
        min_iob_pred_bg: min_iob_pred,
        avg_pred_bg,
        last_iob_pred_bg,
        last_cob_pred_bg,
        last_uam_pred_bg,
        ci,
        cid,
        remaining_ci_peak,
    }
}
