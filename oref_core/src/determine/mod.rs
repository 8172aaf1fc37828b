//! Determine-basal: one dosing decision per cycle.
//!
//! The decision is an ordered list of guards over a shared, precomputed
//! [`Context`]. Each guard either passes (possibly appending to the reason
//! trail) or returns the action that ends the cycle. The first hit wins.

mod context;
mod guards;
pub mod predict;
pub mod smb;

use chrono::{DateTime, Utc};
use serde::Serialize;

use oref_config::{CurrentTemp, CustomOrefVariables};

use crate::autosens::Autosens;
use crate::dynisf::DynamicIsfResult;
use crate::error::Result;
use crate::glucose::GlucoseStatus;
use crate::iob::IobResult;
use crate::meal::ComputedCarbs;
use crate::profile::Profile;

pub use context::Context;
pub use predict::Predictions;

/// Everything one decision needs. All values are borrowed and left untouched.
#[derive(Debug, Clone, Copy)]
pub struct DetermineInputs<'a> {
    pub profile: &'a Profile,
    pub glucose: &'a GlucoseStatus,
    pub current_temp: Option<&'a CurrentTemp>,
    /// IOB forecast; element 0 is "now".
    pub iob: &'a [IobResult],
    pub meal: &'a ComputedCarbs,
    pub autosens: &'a Autosens,
    pub dynamic_isf: Option<&'a DynamicIsfResult>,
    pub custom: &'a CustomOrefVariables,
    pub reservoir: Option<f64>,
    pub microbolus_allowed: bool,
    pub now: DateTime<Utc>,
}

/// The engine's output for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Determination {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<f64>,
    pub reason: String,
    #[serde(rename = "eventualBG", skip_serializing_if = "Option::is_none")]
    pub eventual_bg: Option<f64>,
    #[serde(rename = "insulinReq", skip_serializing_if = "Option::is_none")]
    pub insulin_req: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predictions: Option<Predictions>,
    #[serde(rename = "deliverAt")]
    pub deliver_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub bg: f64,
    pub tick: String,
    #[serde(rename = "targetBG")]
    pub target_bg: f64,
    #[serde(rename = "sensitivityRatio")]
    pub sensitivity_ratio: f64,
    #[serde(rename = "COB")]
    pub cob: f64,
    #[serde(rename = "IOB")]
    pub iob: f64,
    #[serde(rename = "ISF")]
    pub isf: f64,
    #[serde(rename = "CR")]
    pub carb_ratio: f64,
    #[serde(rename = "minPredBG", skip_serializing_if = "Option::is_none")]
    pub min_pred_bg: Option<f64>,
    #[serde(rename = "minGuardBG", skip_serializing_if = "Option::is_none")]
    pub min_guard_bg: Option<f64>,
    #[serde(rename = "expectedDelta", skip_serializing_if = "Option::is_none")]
    pub expected_delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservoir: Option<f64>,
}

impl Determination {
    /// True when the pump has nothing to do.
    pub const fn is_no_op(&self) -> bool {
        self.rate.is_none() && self.units.is_none()
    }
}

/// Reason fragments and pending values accumulated while guards run.
#[derive(Debug, Default)]
pub struct Trail {
    reason: String,
    units: Option<f64>,
    insulin_req: Option<f64>,
}

impl Trail {
    fn push(&mut self, fragment: impl AsRef<str>) {
        self.reason.push_str(fragment.as_ref());
    }
}

/// Temp-basal part of a terminal decision. `rate == None` means no command.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Action {
    pub rate: Option<f64>,
    pub duration: Option<f64>,
}

impl Action {
    pub const NONE: Self = Self { rate: None, duration: None };

    pub const fn temp(rate: f64, duration: f64) -> Self {
        Self { rate: Some(rate), duration: Some(duration) }
    }
}

/// Which part of the context a guard relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Before the forecast: the output carries no forecast figures.
    Pre,
    Forecast,
}

type Guard = fn(&Context<'_>, &mut Trail) -> Option<Action>;

/// Guards in evaluation order.
const GUARDS: &[(&str, Stage, Guard)] = &[
    ("extreme_low", Stage::Pre, guards::extreme_low),
    ("stale_glucose", Stage::Pre, guards::stale_glucose),
    ("history_mismatch", Stage::Pre, guards::history_mismatch),
    ("low_glucose_suspend", Stage::Forecast, guards::low_glucose_suspend),
    ("top_of_hour", Stage::Forecast, guards::top_of_hour),
    ("below_min_bg", Stage::Forecast, guards::below_min_bg),
    ("falling_faster", Stage::Forecast, guards::falling_faster),
    ("in_range", Stage::Forecast, guards::in_range),
    ("max_iob", Stage::Forecast, guards::max_iob),
    ("insulin_required", Stage::Forecast, guards::insulin_required),
    ("micro_bolus", Stage::Forecast, guards::micro_bolus),
    ("high_temp", Stage::Forecast, guards::high_temp),
];

/// Run the decision for one cycle.
///
/// Fails only on invalid preconditions; every guard outcome, including "do
/// nothing", is a valid `Determination`.
pub fn determine_basal(inputs: &DetermineInputs<'_>) -> Result<Determination> {
    let ctx = Context::build(inputs)?;
    let mut trail = Trail::default();
    let mut forecast_announced = false;

    for &(name, stage, guard) in GUARDS {
        if stage == Stage::Forecast && !forecast_announced {
            trail.push(ctx.forecast_summary());
            for note in &ctx.smb_notes {
                trail.push(format!("{note}; "));
            }
            forecast_announced = true;
        }
        if let Some(action) = guard(&ctx, &mut trail) {
            tracing::info!(
                guard = name,
                rate = ?action.rate,
                duration = ?action.duration,
                units = ?trail.units,
                "determination"
            );
            return Ok(ctx.emit(action, trail, stage == Stage::Forecast));
        }
        tracing::trace!(guard = name, "passed");
    }
    Ok(ctx.emit(Action::NONE, trail, true))
}
