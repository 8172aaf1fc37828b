#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Settings schemas and input records for the closed-loop engine.
//!
//! - `Settings` and its sub-structs are deserialized from the settings JSON and validated.
//! - `records` holds the per-cycle inputs (glucose, pump history, carbs, temp targets,
//!   override variables) plus the CSV glucose importer.
//! - `store` is a file-backed `BlobStore` for named JSON blobs.
//! - `CliConfig` is the TOML config of the command-line front end.
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

pub mod records;
pub mod store;

pub use records::*;
pub use store::FileStore;

/// Minutes in one day; schedule offsets wrap here.
pub const MINUTES_PER_DAY: u32 = 1440;

/// One entry of a basal / ISF / carb-ratio schedule.
///
/// `start` is the human `HH:MM:SS` label; `offset` (minutes since midnight) is authoritative.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ScheduleEntry {
    #[serde(default)]
    pub start: String,
    #[serde(alias = "offsetMinutes", alias = "minutes")]
    pub offset: u32,
    #[serde(alias = "rate", alias = "sensitivity", alias = "ratio")]
    pub value: f64,
}

/// One entry of the BG target schedule.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TargetEntry {
    #[serde(default)]
    pub start: String,
    #[serde(alias = "offsetMinutes", alias = "minutes")]
    pub offset: u32,
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsulinCurve {
    #[default]
    #[serde(rename = "rapid-acting")]
    RapidActing,
    #[serde(rename = "ultra-rapid")]
    UltraRapid,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum GlucoseUnits {
    #[default]
    #[serde(rename = "mg/dL")]
    MgDl,
    #[serde(rename = "mmol/L")]
    MmolL,
}

/// Profile-level explicit target.
///
/// Compatibility hazard: legacy settings encode "no target" as the boolean
/// `false`. That encoding is accepted and produced only here, at the serde
/// boundary; everything downstream matches on the variant.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum TargetOverride {
    #[default]
    NoTarget,
    Target(f64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TargetToml {
    Flag(bool),
    Value(f64),
}

impl<'de> Deserialize<'de> for TargetOverride {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<TargetToml> = Option::deserialize(deserializer)?;
        Ok(match opt {
            None | Some(TargetToml::Flag(false)) => TargetOverride::NoTarget,
            Some(TargetToml::Flag(true)) => {
                return Err(serde::de::Error::custom(
                    "target_bg must be a number or false",
                ));
            }
            Some(TargetToml::Value(v)) => TargetOverride::Target(v),
        })
    }
}

impl Serialize for TargetOverride {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            TargetOverride::NoTarget => serializer.serialize_bool(false),
            TargetOverride::Target(v) => serializer.serialize_f64(*v),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PumpSettings {
    /// Hard cap on any temp basal rate (U/h).
    pub max_basal: f64,
    #[serde(default = "default_max_bolus")]
    pub max_bolus: f64,
    /// Duration of insulin action in hours.
    pub dia: f64,
    #[serde(default = "default_bolus_increment")]
    pub bolus_increment: f64,
    /// Pump model string; `x23`/`x54` models round small basals to 0.025 U/h.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_max_bolus() -> f64 {
    10.0
}

fn default_bolus_increment() -> f64 {
    0.1
}

/// Algorithm tunables. Every field has a default so partial JSON works.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Preferences {
    pub max_iob: f64,
    pub max_daily_safety_multiplier: f64,
    pub current_basal_safety_multiplier: f64,
    pub autosens_max: f64,
    pub autosens_min: f64,
    pub rewind_resets_autosens: bool,
    pub high_temptarget_raises_sensitivity: bool,
    pub low_temptarget_lowers_sensitivity: bool,
    pub sensitivity_raises_target: bool,
    pub resistance_lowers_target: bool,
    pub half_basal_exercise_target: f64,
    #[serde(alias = "maxCOB")]
    pub max_cob: f64,
    pub skip_neutral_temps: bool,
    pub min_5m_carbimpact: f64,
    pub remaining_carbs_cap: f64,
    pub remaining_carbs_fraction: f64,
    #[serde(alias = "enableUAM")]
    pub enable_uam: bool,
    #[serde(alias = "A52_risk_enable")]
    pub a52_risk_enable: bool,
    #[serde(alias = "enableSMB_always")]
    pub enable_smb_always: bool,
    #[serde(alias = "enableSMB_with_COB")]
    pub enable_smb_with_cob: bool,
    #[serde(alias = "enableSMB_with_temptarget")]
    pub enable_smb_with_temptarget: bool,
    #[serde(alias = "enableSMB_after_carbs")]
    pub enable_smb_after_carbs: bool,
    #[serde(alias = "enableSMB_high_bg")]
    pub enable_smb_high_bg: bool,
    #[serde(alias = "enableSMB_high_bg_target")]
    pub enable_smb_high_bg_target: f64,
    #[serde(alias = "allowSMB_with_high_temptarget")]
    pub allow_smb_with_high_temptarget: bool,
    #[serde(alias = "maxSMBBasalMinutes")]
    pub max_smb_basal_minutes: f64,
    #[serde(alias = "maxUAMSMBBasalMinutes")]
    pub max_uam_smb_basal_minutes: f64,
    #[serde(alias = "SMBInterval")]
    pub smb_interval: f64,
    pub smb_delivery_ratio: f64,
    pub curve: InsulinCurve,
    #[serde(alias = "useCustomPeakTime")]
    pub use_custom_peak_time: bool,
    #[serde(alias = "insulinPeakTime")]
    pub insulin_peak_time: f64,
    pub suspend_zeros_iob: bool,
    pub max_delta_bg_threshold: f64,
    pub out_units: GlucoseUnits,
    pub target_bg: TargetOverride,
    /// Dynamic ISF on/off.
    #[serde(alias = "useNewFormula")]
    pub use_new_formula: bool,
    /// Sigmoid instead of logarithmic dynamic ISF.
    pub sigmoid: bool,
    #[serde(alias = "adjustmentFactor")]
    pub adjustment_factor: f64,
    #[serde(alias = "adjustmentFactorSigmoid")]
    pub adjustment_factor_sigmoid: f64,
    #[serde(alias = "weightPercentage")]
    pub weight_percentage: f64,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            max_iob: 0.0,
            max_daily_safety_multiplier: 3.0,
            current_basal_safety_multiplier: 4.0,
            autosens_max: 1.2,
            autosens_min: 0.7,
            rewind_resets_autosens: true,
            high_temptarget_raises_sensitivity: false,
            low_temptarget_lowers_sensitivity: false,
            sensitivity_raises_target: false,
            resistance_lowers_target: false,
            half_basal_exercise_target: 160.0,
            max_cob: 120.0,
            skip_neutral_temps: false,
            min_5m_carbimpact: 8.0,
            remaining_carbs_cap: 90.0,
            remaining_carbs_fraction: 1.0,
            enable_uam: false,
            a52_risk_enable: false,
            enable_smb_always: false,
            enable_smb_with_cob: false,
            enable_smb_with_temptarget: false,
            enable_smb_after_carbs: false,
            enable_smb_high_bg: false,
            enable_smb_high_bg_target: 110.0,
            allow_smb_with_high_temptarget: false,
            max_smb_basal_minutes: 30.0,
            max_uam_smb_basal_minutes: 30.0,
            smb_interval: 3.0,
            smb_delivery_ratio: 0.5,
            curve: InsulinCurve::RapidActing,
            use_custom_peak_time: false,
            insulin_peak_time: 75.0,
            suspend_zeros_iob: true,
            max_delta_bg_threshold: 0.2,
            out_units: GlucoseUnits::MgDl,
            target_bg: TargetOverride::NoTarget,
            use_new_formula: false,
            sigmoid: false,
            adjustment_factor: 0.8,
            adjustment_factor_sigmoid: 0.5,
            weight_percentage: 0.65,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    #[serde(alias = "basalprofile")]
    pub basal: Vec<ScheduleEntry>,
    #[serde(alias = "isfProfile")]
    pub isf: Vec<ScheduleEntry>,
    #[serde(alias = "carb_ratios")]
    pub carb_ratio: Vec<ScheduleEntry>,
    #[serde(alias = "bg_targets")]
    pub targets: Vec<TargetEntry>,
    /// Local time offset used for time-of-day schedule lookups.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    pub pump: PumpSettings,
    #[serde(default)]
    pub preferences: Preferences,
}

/// Parse `HH:MM[:SS]` into minutes since midnight.
pub fn parse_start(s: &str) -> Option<u32> {
    let mut it = s.split(':');
    let h: u32 = it.next()?.trim().parse().ok()?;
    let m: u32 = it.next()?.trim().parse().ok()?;
    if let Some(sec) = it.next() {
        let _: u32 = sec.trim().parse().ok()?;
    }
    if h >= 24 || m >= 60 {
        return None;
    }
    Some(h * 60 + m)
}

pub fn load_json(s: &str) -> Result<Settings, serde_json::Error> {
    serde_json::from_str::<Settings>(s)
}

fn validate_offsets<'a>(
    name: &str,
    entries: impl Iterator<Item = (&'a str, u32)>,
) -> eyre::Result<()> {
    let mut prev: Option<u32> = None;
    let mut count = 0usize;
    for (start, offset) in entries {
        if count == 0 && offset != 0 {
            eyre::bail!("{name}: first entry must start at offset 0, got {offset}");
        }
        if offset >= MINUTES_PER_DAY {
            eyre::bail!("{name}: offset {offset} is beyond the end of the day");
        }
        if let Some(p) = prev
            && offset <= p
        {
            eyre::bail!("{name}: entries must be sorted by offset (found {offset} after {p})");
        }
        if !start.is_empty() {
            match parse_start(start) {
                Some(m) if m == offset => {}
                Some(m) => eyre::bail!(
                    "{name}: start {start} ({m} min) disagrees with offset {offset}"
                ),
                None => eyre::bail!("{name}: start {start:?} is not HH:MM:SS"),
            }
        }
        prev = Some(offset);
        count += 1;
    }
    if count == 0 {
        eyre::bail!("{name}: schedule must not be empty");
    }
    Ok(())
}

impl Settings {
    pub fn validate(&self) -> eyre::Result<()> {
        // Schedules
        validate_offsets(
            "settings.basal",
            self.basal.iter().map(|e| (e.start.as_str(), e.offset)),
        )?;
        validate_offsets(
            "settings.isf",
            self.isf.iter().map(|e| (e.start.as_str(), e.offset)),
        )?;
        validate_offsets(
            "settings.carb_ratio",
            self.carb_ratio.iter().map(|e| (e.start.as_str(), e.offset)),
        )?;
        validate_offsets(
            "settings.targets",
            self.targets.iter().map(|e| (e.start.as_str(), e.offset)),
        )?;
        if self.basal.iter().any(|e| !e.value.is_finite() || e.value < 0.0) {
            eyre::bail!("settings.basal rates must be finite and >= 0");
        }
        if self.carb_ratio.iter().any(|e| !(e.value > 0.0)) {
            eyre::bail!("settings.carb_ratio values must be > 0");
        }
        if self.isf.iter().any(|e| !(e.value > 0.0)) {
            eyre::bail!("settings.isf values must be > 0");
        }
        if self.targets.iter().any(|t| t.low > t.high) {
            eyre::bail!("settings.targets low must be <= high");
        }
        if self.utc_offset_minutes.abs() > 14 * 60 {
            eyre::bail!("settings.utc_offset_minutes must be within +/-14h");
        }

        // Pump
        if !(self.pump.dia >= 1.0) {
            eyre::bail!("settings.pump.dia must be >= 1");
        }
        if !(self.pump.max_basal > 0.0) {
            eyre::bail!("settings.pump.max_basal must be > 0");
        }
        if !(self.pump.bolus_increment > 0.0 && self.pump.bolus_increment <= 1.0) {
            eyre::bail!("settings.pump.bolus_increment must be in (0.0, 1.0]");
        }

        // Preferences
        let p = &self.preferences;
        if p.max_iob < 0.0 {
            eyre::bail!("preferences.max_iob must be >= 0");
        }
        if p.autosens_min > p.autosens_max {
            eyre::bail!("preferences.autosens_min must be <= autosens_max");
        }
        if !(p.autosens_min > 0.0) {
            eyre::bail!("preferences.autosens_min must be > 0");
        }
        if p.max_daily_safety_multiplier <= 0.0 || p.current_basal_safety_multiplier <= 0.0 {
            eyre::bail!("preferences safety multipliers must be > 0");
        }
        if !(1.0..=10.0).contains(&p.smb_interval) {
            eyre::bail!("preferences.smb_interval must be in [1, 10] minutes");
        }
        if !(p.smb_delivery_ratio > 0.0 && p.smb_delivery_ratio <= 1.0) {
            eyre::bail!("preferences.smb_delivery_ratio must be in (0.0, 1.0]");
        }
        if !(0.0..=1.0).contains(&p.remaining_carbs_fraction) {
            eyre::bail!("preferences.remaining_carbs_fraction must be in [0.0, 1.0]");
        }
        if !(0.0..=1.0).contains(&p.weight_percentage) {
            eyre::bail!("preferences.weight_percentage must be in [0.0, 1.0]");
        }
        if !(p.max_delta_bg_threshold > 0.0 && p.max_delta_bg_threshold <= 0.4) {
            eyre::bail!("preferences.max_delta_bg_threshold must be in (0.0, 0.4]");
        }
        if p.half_basal_exercise_target <= 100.0 {
            eyre::bail!("preferences.half_basal_exercise_target must be > 100");
        }
        Ok(())
    }
}

// ── CLI config (TOML) ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Paths {
    /// Directory of the blob store holding `settings.json` and friends.
    pub store: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineCfg {
    /// Whether the pump accepts micro-boluses this cycle when the bundle doesn't say.
    pub microbolus_allowed: bool,
}

impl Default for EngineCfg {
    fn default() -> Self {
        Self {
            microbolus_allowed: true,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct CliConfig {
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub engine: EngineCfg,
}

pub fn load_toml(s: &str) -> Result<CliConfig, toml::de::Error> {
    toml::from_str::<CliConfig>(s)
}

impl CliConfig {
    pub fn validate(&self) -> eyre::Result<()> {
        if let Some(r) = self.logging.rotation.as_deref()
            && !matches!(r, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never|daily|hourly, got {r}");
        }
        if let Some(dir) = self.paths.store.as_deref()
            && dir.trim().is_empty()
        {
            eyre::bail!("paths.store must not be empty when set");
        }
        Ok(())
    }
}
