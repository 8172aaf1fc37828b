use thiserror::Error;

/// Profile invariant violations. A cycle with any of these makes no decision.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProfileError {
    #[error("invalid DIA {dia}h (minimum {min}h)")]
    InvalidDia { dia: f64, min: f64 },
    #[error("invalid current basal {0} U/h")]
    InvalidCurrentBasal(f64),
    #[error("invalid max daily basal {0} U/h")]
    InvalidMaxDailyBasal(f64),
    #[error("invalid max basal {max_basal} U/h (minimum {min})")]
    InvalidMaxBasal { max_basal: f64, min: f64 },
    #[error("invalid ISF {isf} (minimum {min})")]
    InvalidIsf { isf: f64, min: f64 },
    #[error("invalid carb ratio {0}")]
    InvalidCarbRatio(f64),
    #[error("{0} schedule is empty")]
    EmptySchedule(&'static str),
}

/// Failures of the decision engine itself.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DetermineError {
    #[error("could not resolve a current basal rate")]
    MissingCurrentBasal,
    #[error("could not determine target BG from profile")]
    InvalidProfileTarget,
    #[error(
        "could not calculate eventual BG (sens {sens}, deviation {deviation}, naive eventual BG {naive_eventual_bg})"
    )]
    EventualGlucoseCalculationError {
        sens: f64,
        deviation: f64,
        naive_eventual_bg: f64,
    },
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
