use oref_config::{CurrentTemp, GlucoseUnits};

use super::predict::{self, Forecast, ForecastInputs};
use super::{Action, DetermineInputs, Determination, Trail, smb};
use crate::error::{DetermineError, Result};
use crate::glucose::GlucoseStatus;
use crate::iob::{IobResult, IobTotals};
use crate::profile::Profile;
use crate::util::{convert_bg, round_basal, round_to};

/// Glucose the forecast treats as "normal" when scaling for temp targets.
const NORMAL_TARGET: f64 = 100.0;

/// Values shared by every guard, computed once per cycle.
#[derive(Debug, Clone)]
pub struct Context<'a> {
    pub inputs: &'a DetermineInputs<'a>,
    pub profile: &'a Profile,
    pub glucose: &'a GlucoseStatus,
    pub iob: IobResult,
    pub current_temp: CurrentTemp,
    pub bg: f64,
    pub bg_age_min: f64,
    pub min_delta: f64,
    pub min_avg_delta: f64,
    pub max_delta: f64,
    /// Scheduled basal rounded to pump resolution.
    pub profile_basal: f64,
    /// Basal after the sensitivity ratio.
    pub basal: f64,
    pub sensitivity_ratio: f64,
    pub min_bg: f64,
    pub max_bg: f64,
    pub target_bg: f64,
    pub sens: f64,
    pub bgi: f64,
    pub deviation: f64,
    pub naive_eventual_bg: f64,
    pub eventual_bg: f64,
    pub expected_delta: f64,
    pub threshold: f64,
    pub forecast: Forecast,
    pub enable_smb: bool,
    pub smb_notes: Vec<String>,
}

fn zero_iob(inputs: &DetermineInputs<'_>) -> IobResult {
    let totals = IobTotals { time: Some(inputs.now), ..IobTotals::default() };
    IobResult { totals, with_zero_temp: totals, last_temp: None, last_bolus_time: None }
}

/// Temp-target driven sensitivity: `c / (c + target - 100)`, capped at autosens_max.
fn temp_target_ratio(profile: &Profile, target_bg: f64) -> Option<f64> {
    let prefs = &profile.preferences;
    let high = prefs.high_temptarget_raises_sensitivity && target_bg > NORMAL_TARGET;
    let low = prefs.low_temptarget_lowers_sensitivity && target_bg < NORMAL_TARGET;
    if !profile.temptarget_set || !(high || low) {
        return None;
    }
    let c = prefs.half_basal_exercise_target - NORMAL_TARGET;
    let denom = c + target_bg - NORMAL_TARGET;
    let ratio = if denom > 0.0 { c / denom } else { prefs.autosens_max };
    Some(round_to(ratio.min(prefs.autosens_max), 2))
}

impl<'a> Context<'a> {
    pub fn build(inputs: &'a DetermineInputs<'a>) -> Result<Self> {
        let profile = inputs.profile;
        let prefs = &profile.preferences;
        if !(profile.current_basal > 0.0) {
            return Err(eyre::Report::new(DetermineError::MissingCurrentBasal));
        }
        let mut target_bg = profile.target_bg();
        if !(target_bg > 0.0) || !target_bg.is_finite() {
            return Err(eyre::Report::new(DetermineError::InvalidProfileTarget));
        }
        let (mut min_bg, mut max_bg) = (profile.min_bg, profile.max_bg);

        let g = inputs.glucose;
        let bg = g.glucose;
        let model = profile.pump_model.as_deref();
        let profile_basal = round_basal(profile.current_basal, model);

        let sensitivity_ratio = temp_target_ratio(profile, target_bg)
            .or_else(|| inputs.dynamic_isf.map(|d| d.ratio))
            .unwrap_or(inputs.autosens.ratio);
        let basal = round_basal(profile.current_basal * sensitivity_ratio, model);
        if basal != profile_basal {
            tracing::debug!(from = profile_basal, to = basal, sensitivity_ratio, "adjusting basal");
        }

        let autosens_ratio = inputs.autosens.ratio;
        if !profile.temptarget_set
            && ((prefs.sensitivity_raises_target && autosens_ratio < 1.0)
                || (prefs.resistance_lowers_target && autosens_ratio > 1.0))
        {
            min_bg = ((min_bg - 60.0) / autosens_ratio).round() + 60.0;
            max_bg = ((max_bg - 60.0) / autosens_ratio).round() + 60.0;
            target_bg = (((target_bg - 60.0) / autosens_ratio).round() + 60.0).max(80.0);
            tracing::debug!(min_bg, max_bg, target_bg, "autosens adjusted targets");
        }

        let sens = round_to(profile.sens / sensitivity_ratio, 1);
        let iob = inputs.iob.first().cloned().unwrap_or_else(|| zero_iob(inputs));
        let current_temp = inputs.current_temp.copied().unwrap_or_default();

        let bgi = round_to(-iob.totals.activity * sens * 5.0, 2);
        let min_delta = g.min_delta();
        let min_avg_delta = g.min_avg_delta();
        let max_delta = g.max_delta();

        let mut deviation = (30.0 / 5.0 * (min_delta - bgi)).round();
        if deviation < 0.0 {
            deviation = (30.0 / 5.0 * (min_avg_delta - bgi)).round();
            if deviation < 0.0 {
                deviation = (30.0 / 5.0 * (g.long_avgdelta - bgi)).round();
            }
        }
        let naive_eventual_bg = if iob.totals.iob > 0.0 {
            (bg - iob.totals.iob * sens).round()
        } else {
            (bg - iob.totals.iob * sens.min(profile.sens)).round()
        };
        let eventual_bg = naive_eventual_bg + deviation;
        if !eventual_bg.is_finite() {
            return Err(eyre::Report::new(DetermineError::EventualGlucoseCalculationError {
                sens,
                deviation,
                naive_eventual_bg,
            }));
        }
        let expected_delta = round_to(bgi + (target_bg - eventual_bg) / 24.0, 1);
        let threshold = min_bg - 0.5 * (min_bg - 40.0);

        let forecast = predict::forecast(&ForecastInputs {
            profile,
            iob_array: inputs.iob,
            meal: inputs.meal,
            bg,
            sens,
            target_bg,
            threshold,
            min_delta,
            bgi,
            eventual_bg,
            sensitivity_ratio,
            now: inputs.now,
        });

        let local_hour = profile.minute_of_day(inputs.now) / 60;
        let (mut enable_smb, note) = smb::enable_smb(
            profile,
            inputs.microbolus_allowed,
            inputs.meal,
            bg,
            target_bg,
            inputs.custom,
            local_hour,
        );
        let mut smb_notes: Vec<String> = note.into_iter().collect();
        let units = profile.out_units;
        if enable_smb && forecast.min_guard_bg < threshold {
            smb_notes.push(format!(
                "minGuardBG {} projected below {} - disabling SMB",
                convert_bg(forecast.min_guard_bg, units),
                convert_bg(threshold, units)
            ));
            enable_smb = false;
        }
        if max_delta > prefs.max_delta_bg_threshold * bg {
            smb_notes.push(format!(
                "maxDelta {} > {}% of BG {} - disabling SMB",
                convert_bg(max_delta, units),
                (prefs.max_delta_bg_threshold * 100.0).round(),
                convert_bg(bg, units)
            ));
            enable_smb = false;
        }

        Ok(Self {
            inputs,
            profile,
            glucose: g,
            iob,
            current_temp,
            bg,
            bg_age_min: g.age_minutes(inputs.now),
            min_delta,
            min_avg_delta,
            max_delta,
            profile_basal,
            basal,
            sensitivity_ratio,
            min_bg,
            max_bg,
            target_bg,
            sens,
            bgi,
            deviation,
            naive_eventual_bg,
            eventual_bg: forecast.eventual_bg,
            expected_delta,
            threshold,
            forecast,
            enable_smb,
            smb_notes,
        })
    }

    pub const fn units(&self) -> GlucoseUnits {
        self.profile.out_units
    }

    pub fn fmt_bg(&self, v: f64) -> String {
        convert_bg(v, self.units())
    }

    /// Micro-boluses are both allowed by the pump and enabled this cycle.
    pub const fn smb_path(&self) -> bool {
        self.inputs.microbolus_allowed && self.enable_smb
    }

    pub fn high_temp_running(&self) -> bool {
        self.current_temp.rate > self.profile_basal
    }

    pub fn local_minute_of_hour(&self) -> u32 {
        self.profile.minute_of_day(self.inputs.now) % 60
    }

    /// Reason prefix summarising the forecast.
    pub fn forecast_summary(&self) -> String {
        let f = &self.forecast;
        let mut s = format!(
            "COB: {}, Dev: {}, BGI: {}, ISF: {}, CR: {}, Target: {}, minPredBG {}, minGuardBG {}, IOBpredBG {}",
            self.inputs.meal.meal_cob,
            self.fmt_bg(self.deviation),
            self.fmt_bg(self.bgi),
            self.fmt_bg(self.sens),
            round_to(self.profile.carb_ratio, 2),
            self.fmt_bg(self.target_bg),
            self.fmt_bg(f.min_pred_bg),
            self.fmt_bg(f.min_guard_bg),
            self.fmt_bg(f.last_iob_pred_bg),
        );
        if let Some(v) = f.last_cob_pred_bg.filter(|v| *v > 0.0) {
            s.push_str(&format!(", COBpredBG {}", self.fmt_bg(v)));
        }
        if let Some(v) = f.last_uam_pred_bg.filter(|v| *v > 0.0) {
            s.push_str(&format!(", UAMpredBG {}", self.fmt_bg(v)));
        }
        s.push_str("; ");
        s
    }

    /// Assemble the determination from the terminal action and the trail.
    pub fn emit(&self, action: Action, trail: Trail, with_forecast: bool) -> Determination {
        let now = self.inputs.now;
        let delta = self.glucose.delta.round() + 0.0;
        let tick = if self.glucose.delta > -0.5 {
            format!("+{delta}")
        } else {
            format!("{delta}")
        };
        let f = &self.forecast;
        Determination {
            rate: action.rate,
            duration: action.duration,
            units: trail.units,
            reason: trail.reason,
            eventual_bg: with_forecast.then_some(self.eventual_bg),
            insulin_req: if with_forecast { trail.insulin_req } else { None },
            predictions: with_forecast.then(|| f.predictions.clone()),
            deliver_at: now,
            timestamp: now,
            bg: self.bg,
            tick,
            target_bg: self.target_bg,
            sensitivity_ratio: self.sensitivity_ratio,
            cob: self.inputs.meal.meal_cob,
            iob: self.iob.totals.iob,
            isf: self.sens,
            carb_ratio: round_to(self.profile.carb_ratio, 2),
            min_pred_bg: with_forecast.then_some(f.min_pred_bg),
            min_guard_bg: with_forecast.then_some(f.min_guard_bg),
            expected_delta: with_forecast.then_some(self.expected_delta),
            threshold: with_forecast.then_some(self.threshold),
            reservoir: self.inputs.reservoir,
        }
    }
}
