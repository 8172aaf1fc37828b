//! One full pipeline pass: profile, IOB, COB, autosens, dynamic ISF, decision.

use chrono::{DateTime, Utc};
use serde::Serialize;

use oref_config::{InputBundle, Settings};

use crate::autosens::{self, Autosens, AutosensInputs};
use crate::determine::{self, DetermineInputs, Determination};
use crate::dynisf::{self, DynamicIsfResult};
use crate::error::Result;
use crate::glucose::{self, GlucoseStatus, Sample};
use crate::iob::{self, IobResult};
use crate::meal::{self, ComputedCarbs};
use crate::profile::{self, Profile};

/// Every intermediate of a cycle, for callers that want more than the decision.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutput {
    pub profile: Profile,
    pub glucose_status: Option<GlucoseStatus>,
    pub iob: Vec<IobResult>,
    pub meal: ComputedCarbs,
    pub autosens: Autosens,
    pub dynamic_isf: Option<DynamicIsfResult>,
    /// `None` when there is no usable glucose reading.
    pub determination: Option<Determination>,
}

/// Run the pipeline over `bundle` at `now`.
///
/// `microbolus_allowed` is used when the bundle does not say.
pub fn run_cycle(
    settings: &Settings,
    bundle: &InputBundle,
    now: DateTime<Utc>,
    microbolus_allowed: bool,
) -> Result<CycleOutput> {
    let profile = profile::resolve(settings, &bundle.temp_targets, &bundle.custom, now)?;

    let samples: Vec<Sample> = bundle.glucose.iter().map(Sample::from).collect();
    let glucose_status = glucose::glucose_status(&samples);

    let timeline = iob::build_timeline(&bundle.pump_history, &profile, now);
    let iob = iob::iob_array(&timeline, &profile, now);
    let meal = meal::meal_totals(&bundle.carbs, &samples, &timeline, &profile, now);
    let autosens = autosens::compute_ratio(
        &AutosensInputs {
            glucose: &samples,
            timeline: &timeline,
            history: &bundle.pump_history,
            carbs: &bundle.carbs,
            temp_targets: &bundle.temp_targets,
            now,
        },
        &profile,
    );
    let dynamic_isf = glucose_status
        .as_ref()
        .and_then(|g| dynisf::calculate(&profile, g.glucose, &bundle.tdd, &bundle.custom));

    tracing::debug!(
        iob = iob.first().map_or(0.0, IobResult::iob),
        cob = meal.meal_cob,
        autosens = autosens.ratio,
        dynamic_ratio = dynamic_isf.map(|d| d.ratio),
        "cycle inputs ready"
    );

    let determination = match &glucose_status {
        Some(g) => Some(determine::determine_basal(&DetermineInputs {
            profile: &profile,
            glucose: g,
            current_temp: bundle.current_temp.as_ref(),
            iob: &iob,
            meal: &meal,
            autosens: &autosens,
            dynamic_isf: dynamic_isf.as_ref(),
            custom: &bundle.custom,
            reservoir: bundle.reservoir,
            microbolus_allowed: bundle.microbolus_allowed.unwrap_or(microbolus_allowed),
            now,
        })?),
        None => {
            tracing::warn!("no usable glucose reading; skipping determination");
            None
        }
    };

    Ok(CycleOutput {
        profile,
        glucose_status,
        iob,
        meal,
        autosens,
        dynamic_isf,
        determination,
    })
}
