//! Human-readable error descriptions and structured JSON error formatting.

use oref_core::error::{DetermineError, ProfileError};

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(pe) = err.downcast_ref::<ProfileError>() {
        return match pe {
            ProfileError::InvalidDia { dia, min } => format!(
                "What happened: Duration of insulin action {dia}h is below the {min}h floor.\nLikely causes: pump.dia missing or entered in minutes.\nHow to fix: Set pump.dia in the settings to the insulin's DIA in hours (typically 5-7)."
            ),
            ProfileError::InvalidCurrentBasal(rate) => format!(
                "What happened: The basal rate in effect now is {rate} U/h.\nLikely causes: A zero entry in the basal schedule, or an override percentage of 0.\nHow to fix: Give every basal schedule entry a positive rate."
            ),
            ProfileError::InvalidMaxDailyBasal(rate) => format!(
                "What happened: The highest scheduled basal is {rate} U/h.\nLikely causes: The basal schedule is all zeros.\nHow to fix: Enter the real basal schedule in the settings."
            ),
            ProfileError::InvalidMaxBasal { max_basal, min } => format!(
                "What happened: pump.max_basal is {max_basal} U/h, below the {min} U/h minimum.\nLikely causes: The pump's max basal was not synced into the settings.\nHow to fix: Set pump.max_basal to the pump's configured maximum."
            ),
            ProfileError::InvalidIsf { isf, min } => format!(
                "What happened: Insulin sensitivity {isf} mg/dL/U is below {min}.\nLikely causes: ISF entered in mmol/L, or an override that divides it down.\nHow to fix: Enter ISF in mg/dL per unit in the settings."
            ),
            ProfileError::InvalidCarbRatio(cr) => format!(
                "What happened: Carb ratio resolved to {cr} g/U.\nLikely causes: A zero carb ratio entry, or an override percentage of 0.\nHow to fix: Give every carb_ratio entry a positive value."
            ),
            ProfileError::EmptySchedule(name) => format!(
                "What happened: The {name} schedule is empty.\nLikely causes: The settings JSON has an empty {name} array.\nHow to fix: Add at least one entry starting at offset 0."
            ),
        };
    }

    if let Some(de) = err.downcast_ref::<DetermineError>() {
        return match de {
            DetermineError::MissingCurrentBasal => {
                "What happened: No current basal rate was available to the decision.\nLikely causes: The profile was built by hand without a basal.\nHow to fix: Resolve the profile from settings before determining.".to_string()
            }
            DetermineError::InvalidProfileTarget => {
                "What happened: The glucose target is not a positive number.\nLikely causes: Broken targets schedule or temp target.\nHow to fix: Check settings.targets and the temp targets in the bundle.".to_string()
            }
            DetermineError::EventualGlucoseCalculationError {
                sens,
                deviation,
                naive_eventual_bg,
            } => format!(
                "What happened: Eventual glucose could not be computed (sens {sens}, deviation {deviation}, naive eventual {naive_eventual_bg}).\nLikely causes: A sensitivity ratio of zero or a corrupt glucose delta.\nHow to fix: Check autosens/dynamic ISF inputs and the latest readings. No dose was decided this cycle."
            ),
        };
    }

    // String-based heuristics for errors coming from input loading
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("glucose csv must have headers") {
        return "Invalid headers in glucose CSV. Expected 'timestamp,glucose'.".to_string();
    }

    if lower.contains("no settings") {
        return format!(
            "What happened: {msg}.\nLikely causes: Neither --settings, --store nor a `settings` object in the bundle was given.\nHow to fix: Pass --settings FILE or point --store at a directory holding settings.json."
        );
    }

    if lower.contains("settings") && (lower.contains("parse") || lower.contains("must")) {
        return format!(
            "What happened: Settings are invalid ({msg}).\nLikely causes: A missing required field or an out-of-range value.\nHow to fix: Fix the settings JSON and rerun."
        );
    }

    if lower.contains("input bundle") {
        return format!(
            "What happened: The input bundle could not be read ({msg}).\nLikely causes: Wrong path or malformed JSON.\nHow to fix: Check the --input path and validate the JSON."
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes: 3 profile, 4 decision, 1 anything else.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if err.downcast_ref::<ProfileError>().is_some() {
        return 3;
    }
    if err.downcast_ref::<DetermineError>().is_some() {
        return 4;
    }
    1
}

fn reason_name(err: &eyre::Report) -> &'static str {
    if let Some(pe) = err.downcast_ref::<ProfileError>() {
        return match pe {
            ProfileError::InvalidDia { .. } => "InvalidDia",
            ProfileError::InvalidCurrentBasal(_) => "InvalidCurrentBasal",
            ProfileError::InvalidMaxDailyBasal(_) => "InvalidMaxDailyBasal",
            ProfileError::InvalidMaxBasal { .. } => "InvalidMaxBasal",
            ProfileError::InvalidIsf { .. } => "InvalidIsf",
            ProfileError::InvalidCarbRatio(_) => "InvalidCarbRatio",
            ProfileError::EmptySchedule(_) => "EmptySchedule",
        };
    }
    if let Some(de) = err.downcast_ref::<DetermineError>() {
        return match de {
            DetermineError::MissingCurrentBasal => "MissingCurrentBasal",
            DetermineError::InvalidProfileTarget => "InvalidProfileTarget",
            DetermineError::EventualGlucoseCalculationError { .. } => {
                "EventualGlucoseCalculationError"
            }
        };
    }
    "Error"
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let message = humanize(err);
    let reason = reason_name(err);
    if let Some(DetermineError::EventualGlucoseCalculationError {
        sens,
        deviation,
        naive_eventual_bg,
    }) = err.downcast_ref::<DetermineError>()
    {
        return json!({
            "reason": reason,
            "details": {
                "sens": sens,
                "deviation": deviation,
                "naive_eventual_bg": naive_eventual_bg,
            },
            "message": message,
        })
        .to_string();
    }
    json!({ "reason": reason, "message": message }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_errors_map_to_exit_code_3() {
        let err = eyre::Report::new(ProfileError::EmptySchedule("isf"));
        assert_eq!(exit_code_for_error(&err), 3);
        assert!(humanize(&err).contains("isf schedule is empty"));
    }

    #[test]
    fn degenerate_forecast_json_carries_values() {
        let err = eyre::Report::new(DetermineError::EventualGlucoseCalculationError {
            sens: 0.0,
            deviation: f64::NAN,
            naive_eventual_bg: 120.0,
        });
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&err)).unwrap();
        assert_eq!(v["reason"], "EventualGlucoseCalculationError");
        assert_eq!(v["details"]["naive_eventual_bg"], 120.0);
        assert_eq!(exit_code_for_error(&err), 4);
    }
}
