//! Per-cycle input records: glucose, pump history, carbs, temp targets,
//! override variables, TDD aggregates, and the bundle that carries them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Settings;

/// One CGM reading. Values are mg/dL.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct GlucoseReading {
    #[serde(alias = "date", alias = "dateString")]
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "sgv")]
    pub glucose: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TempKind {
    #[default]
    Absolute,
    Percent,
}

/// Pump history event payload, tagged by `type`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PumpEventKind {
    Bolus {
        amount: f64,
        /// Non-zero for extended (square-wave) boluses.
        #[serde(default, rename = "durationMinutes", alias = "duration")]
        duration_min: f64,
        /// Delivered by the loop (SMB) rather than by the user.
        #[serde(default, alias = "isSMB")]
        automatic: bool,
    },
    TempBasal {
        rate: f64,
        #[serde(default)]
        temp: TempKind,
    },
    TempBasalDuration {
        #[serde(rename = "durationMinutes", alias = "duration")]
        duration_min: f64,
    },
    PumpSuspend,
    PumpResume,
    Rewind,
    Prime,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PumpHistoryEvent {
    #[serde(default)]
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: PumpEventKind,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct CarbEntry {
    #[serde(alias = "created_at", alias = "date")]
    pub timestamp: DateTime<Utc>,
    pub carbs: f64,
}

/// A temp target as entered by the user. `duration_min == 0` cancels.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct TempTarget {
    #[serde(alias = "created_at")]
    pub created_at: DateTime<Utc>,
    #[serde(alias = "duration")]
    pub duration_min: f64,
    #[serde(alias = "targetTop")]
    pub target_top: f64,
    #[serde(alias = "targetBottom")]
    pub target_bottom: f64,
}

/// The temp basal the pump reports as running right now.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
pub struct CurrentTemp {
    pub rate: f64,
    /// Remaining minutes.
    pub duration: f64,
    #[serde(default)]
    pub temp: TempKind,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Override and scheduling state layered onto the profile for one cycle.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CustomOrefVariables {
    #[serde(alias = "useOverride")]
    pub use_override: bool,
    #[serde(alias = "overridePercentage")]
    pub override_percentage: f64,
    #[serde(alias = "overrideTarget")]
    pub override_target: Option<f64>,
    /// Per-field scaling toggles for the override percentage.
    pub isf_and_cr: bool,
    pub isf: bool,
    pub cr: bool,
    pub basal: bool,
    #[serde(alias = "smbIsOff")]
    pub smb_is_off: bool,
    #[serde(alias = "smbIsScheduledOff")]
    pub smb_is_scheduled_off: bool,
    /// Scheduled SMB-off window, hours `[start, end)`.
    pub start: u32,
    pub end: u32,
    #[serde(alias = "advancedSettings")]
    pub advanced_settings: bool,
    #[serde(alias = "smbMinutes")]
    pub smb_minutes: f64,
    #[serde(alias = "uamMinutes")]
    pub uam_minutes: f64,
}

impl Default for CustomOrefVariables {
    fn default() -> Self {
        Self {
            use_override: false,
            override_percentage: 100.0,
            override_target: None,
            isf_and_cr: true,
            isf: false,
            cr: false,
            basal: true,
            smb_is_off: false,
            smb_is_scheduled_off: false,
            start: 0,
            end: 0,
            advanced_settings: false,
            smb_minutes: 30.0,
            uam_minutes: 30.0,
        }
    }
}

/// Total-daily-dose aggregates used by dynamic ISF.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(default)]
pub struct TddSummary {
    /// Recent TDD (last 24h or extrapolated from the last 2h).
    pub recent: Option<f64>,
    /// Two-week average TDD.
    pub average_14d: Option<f64>,
}

/// Everything one cycle needs, as fetched by the caller.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct InputBundle {
    pub settings: Option<Settings>,
    pub glucose: Vec<GlucoseReading>,
    pub pump_history: Vec<PumpHistoryEvent>,
    pub carbs: Vec<CarbEntry>,
    pub temp_targets: Vec<TempTarget>,
    pub current_temp: Option<CurrentTemp>,
    pub tdd: TddSummary,
    pub custom: CustomOrefVariables,
    pub reservoir: Option<f64>,
    pub microbolus_allowed: Option<bool>,
    pub now: Option<DateTime<Utc>>,
}

/// Glucose CSV schema.
///
/// Expected headers:
/// timestamp,glucose
///
/// Example:
/// timestamp,glucose
/// 2024-05-01T08:00:00Z,112
#[derive(Debug, Deserialize)]
struct GlucoseCsvRow {
    timestamp: DateTime<Utc>,
    glucose: f64,
}

/// Load CGM readings from a CSV export. Returns them newest first.
pub fn load_glucose_csv(path: &std::path::Path) -> eyre::Result<Vec<GlucoseReading>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open glucose CSV {:?}: {}", path, e))?;

    // Enforce exact headers
    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let expected = ["timestamp", "glucose"];
    let actual: Vec<String> = headers.iter().map(|s| s.trim().to_string()).collect();
    if actual != expected {
        eyre::bail!(
            "glucose CSV must have headers 'timestamp,glucose', got: {}",
            actual.join(",")
        );
    }

    let mut out = Vec::new();
    for (idx, rec) in rdr.deserialize::<GlucoseCsvRow>().enumerate() {
        match rec {
            Ok(row) => {
                if !row.glucose.is_finite() {
                    eyre::bail!("invalid CSV row {}: glucose is not finite", idx + 2);
                }
                out.push(GlucoseReading {
                    timestamp: row.timestamp,
                    glucose: row.glucose,
                });
            }
            Err(e) => eyre::bail!("invalid CSV row {}: {}", idx + 2, e),
        }
    }
    out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(out)
}
