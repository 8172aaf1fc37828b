//! Super-micro-bolus eligibility and sizing.

use oref_config::CustomOrefVariables;

use crate::meal::ComputedCarbs;
use crate::profile::Profile;
use crate::util::{floor_to_increment, round_to};

/// Whether `hour` (local, 0–23) falls in the scheduled SMB-off window.
///
/// `start < end` is a same-day window, `start > end` wraps midnight, `0–0`
/// means all day and `start == end` otherwise means that single hour.
pub const fn in_scheduled_off_window(start: u32, end: u32, hour: u32) -> bool {
    if start < end {
        hour >= start && hour < end
    } else if start > end {
        hour >= start || hour < end
    } else if start == 0 {
        true
    } else {
        hour == start
    }
}

/// SMB eligibility before the forecast-based vetoes.
///
/// Returns the decision and, when disabled for a stated reason, a reason fragment.
pub fn enable_smb(
    profile: &Profile,
    microbolus_allowed: bool,
    meal: &ComputedCarbs,
    bg: f64,
    target_bg: f64,
    custom: &CustomOrefVariables,
    local_hour: u32,
) -> (bool, Option<String>) {
    let prefs = &profile.preferences;
    if !microbolus_allowed {
        return (false, Some("SMB disabled (!microBolusAllowed)".to_owned()));
    }
    if !prefs.allow_smb_with_high_temptarget && profile.temptarget_set && target_bg > 100.0 {
        return (
            false,
            Some(format!("SMB disabled due to high temptarget of {target_bg}")),
        );
    }
    if custom.smb_is_off {
        return (false, Some("SMBs are disabled".to_owned()));
    }
    if custom.smb_is_scheduled_off
        && in_scheduled_off_window(custom.start, custom.end, local_hour)
    {
        return (
            false,
            Some(format!(
                "SMBs are disabled by schedule ({}:00-{}:00)",
                custom.start, custom.end
            )),
        );
    }

    let enabled = prefs.enable_smb_always
        || (prefs.enable_smb_with_cob && meal.meal_cob > 0.0)
        || (prefs.enable_smb_after_carbs && meal.carbs > 0.0)
        || (prefs.enable_smb_with_temptarget && profile.temptarget_set && target_bg < 100.0)
        || (prefs.enable_smb_high_bg && bg >= prefs.enable_smb_high_bg_target);
    (enabled, None)
}

/// Micro-bolus plan for one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MicroBolus {
    pub units: f64,
    pub max_bolus: f64,
    /// Low temp to run alongside, minutes (0 for none).
    pub duration_req: f64,
    pub low_temp_rate: f64,
}

/// Size a micro-bolus for `insulin_req`.
///
/// The per-interval cap is `current_basal × minutes / 60`, using UAM minutes
/// once IOB exceeds what COB calls for. With an override in advanced mode the
/// override's minute budgets replace the profile's.
pub fn size_micro_bolus(
    profile: &Profile,
    custom: &CustomOrefVariables,
    meal_cob: f64,
    iob: f64,
    insulin_req: f64,
    basal: f64,
    worst_case_insulin_req: f64,
) -> MicroBolus {
    let prefs = &profile.preferences;
    let (smb_minutes, uam_minutes) = if custom.use_override && custom.advanced_settings {
        (custom.smb_minutes, custom.uam_minutes)
    } else {
        (prefs.max_smb_basal_minutes, prefs.max_uam_smb_basal_minutes)
    };
    let meal_insulin_req = round_to(meal_cob / profile.carb_ratio, 3);
    let minutes = if iob > meal_insulin_req && iob > 0.0 {
        uam_minutes
    } else {
        smb_minutes
    };
    let max_bolus = round_to(profile.current_basal * minutes / 60.0, 1);
    let units = floor_to_increment(
        (insulin_req * prefs.smb_delivery_ratio).min(max_bolus).max(0.0),
        profile.bolus_increment,
    );

    let mut duration_req = (60.0 * worst_case_insulin_req / profile.current_basal).round();
    if insulin_req > 0.0 && units < profile.bolus_increment {
        duration_req = 0.0;
    }
    let mut low_temp_rate = 0.0;
    if duration_req <= 0.0 {
        duration_req = 0.0;
    } else if duration_req >= 30.0 {
        duration_req = ((duration_req / 30.0).round() * 30.0).clamp(0.0, 60.0);
    } else {
        low_temp_rate = round_to(basal * duration_req / 30.0, 2);
        duration_req = 30.0;
    }
    MicroBolus {
        units,
        max_bolus,
        duration_req,
        low_temp_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(9, 17, 8, false)]
    #[case(9, 17, 9, true)]
    #[case(9, 17, 17, false)]
    #[case(22, 6, 23, true)]
    #[case(22, 6, 2, true)]
    #[case(22, 6, 6, false)]
    #[case(22, 6, 12, false)]
    #[case(0, 0, 13, true)]
    #[case(5, 5, 5, true)]
    #[case(5, 5, 6, false)]
    fn scheduled_window(#[case] start: u32, #[case] end: u32, #[case] hour: u32, #[case] off: bool) {
        assert_eq!(in_scheduled_off_window(start, end, hour), off);
    }
}
