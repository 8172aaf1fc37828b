#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::float_cmp,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Closed-loop insulin dosing core.
//!
//! Every stage is a pure function of its inputs, including the clock reading:
//!
//! - **Profile** (`profile`): schedules, preferences, temp targets and
//!   overrides resolved into one immutable [`Profile`]
//! - **Insulin curves** (`insulin`): exponential activity/IOB fractions
//! - **IOB** (`iob`): pump history normalised into a dose timeline and integrated
//! - **Glucose status** (`glucose`): deltas from recent CGM readings
//! - **Meal** (`meal`): carbs on board from observed absorption
//! - **Autosens** (`autosens`): sensitivity ratio from 24h of deviations
//! - **Dynamic ISF** (`dynisf`): TDD-based sensitivity
//! - **Decision** (`determine`): forecasts and the guard list producing a
//!   [`Determination`]
//! - **Temp basal** (`temp`): the safety clamp every rate passes through
//!
//! [`cycle::run_cycle`] chains them for one control cycle.
//!
//! Glucose is mg/dL throughout; `out_units` only affects reason text.

pub mod autosens;
pub mod conversions;
pub mod cycle;
pub mod determine;
pub mod dynisf;
pub mod error;
pub mod glucose;
pub mod insulin;
pub mod iob;
pub mod meal;
pub mod profile;
pub mod schedule;
pub mod temp;
pub mod util;

pub use autosens::Autosens;
pub use cycle::{CycleOutput, run_cycle};
pub use determine::{Determination, DetermineInputs, determine_basal};
pub use error::{DetermineError, ProfileError, Result};
pub use glucose::GlucoseStatus;
pub use iob::IobResult;
pub use meal::ComputedCarbs;
pub use profile::Profile;
