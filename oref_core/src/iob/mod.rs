//! Insulin on board.
//!
//! `iob_at` re-integrates the timeline for each query instant; nothing is
//! cached or mutated between calls.

pub mod history;

pub use history::{Dose, LastTemp, SegmentSource, Timeline, TimelineEntry, build_timeline};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::insulin;
use crate::profile::Profile;
use crate::util::round_to;

/// Doses below this size count toward basal IOB.
pub const BASAL_DOSE_CUTOFF: f64 = 0.1;
/// Length of the hypothetical zero temp (minutes).
pub const ZERO_TEMP_MINUTES: f64 = 240.0;
/// Forecast ticks (5 minutes apart) in `iob_array`.
pub const FORECAST_TICKS: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct IobTotals {
    pub iob: f64,
    pub activity: f64,
    pub basaliob: f64,
    pub bolusiob: f64,
    pub netbasalinsulin: f64,
    pub bolusinsulin: f64,
    pub time: Option<DateTime<Utc>>,
}

/// IOB at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IobResult {
    #[serde(flatten)]
    pub totals: IobTotals,
    #[serde(rename = "iobWithZeroTemp")]
    pub with_zero_temp: IobTotals,
    #[serde(rename = "lastTemp", skip_serializing_if = "Option::is_none")]
    pub last_temp: Option<LastTemp>,
    #[serde(rename = "lastBolusTime", skip_serializing_if = "Option::is_none")]
    pub last_bolus_time: Option<DateTime<Utc>>,
}

impl IobResult {
    pub const fn iob(&self) -> f64 {
        self.totals.iob
    }

    pub const fn activity(&self) -> f64 {
        self.totals.activity
    }
}

/// Sum every dose delivered at or before `time` and within DIA of it.
pub fn sum_doses<'a>(
    doses: impl IntoIterator<Item = &'a Dose>,
    profile: &Profile,
    time: DateTime<Utc>,
) -> IobTotals {
    let dia = profile.dia.max(insulin::MIN_CURVE_DIA_HOURS);
    let peak = insulin::effective_peak(
        profile.curve,
        profile.preferences.use_custom_peak_time,
        profile.preferences.insulin_peak_time,
    );
    let dia_ago = time - Duration::milliseconds((dia * 3_600_000.0) as i64);

    let mut t = IobTotals::default();
    for dose in doses {
        if dose.timestamp > time || dose.timestamp <= dia_ago {
            continue;
        }
        let mins_ago = ((time - dose.timestamp).num_milliseconds() as f64 / 60_000.0).round();
        let f = insulin::activity(mins_ago, dia, peak);
        let contrib = dose.insulin * f.iob;
        t.iob += contrib;
        t.activity += dose.insulin * f.activity;
        if dose.insulin < BASAL_DOSE_CUTOFF {
            t.basaliob += contrib;
            t.netbasalinsulin += dose.insulin;
        } else {
            t.bolusiob += contrib;
            t.bolusinsulin += dose.insulin;
        }
    }
    IobTotals {
        iob: round_to(t.iob, 3),
        activity: round_to(t.activity, 4),
        basaliob: round_to(t.basaliob, 3),
        bolusiob: round_to(t.bolusiob, 3),
        netbasalinsulin: round_to(t.netbasalinsulin, 3),
        bolusinsulin: round_to(t.bolusinsulin, 3),
        time: Some(time),
    }
}

fn result_at(
    timeline: &Timeline,
    zero_temp: &[Dose],
    profile: &Profile,
    time: DateTime<Utc>,
) -> IobResult {
    let totals = sum_doses(&timeline.doses, profile, time);
    let with_zero_temp = sum_doses(timeline.doses.iter().chain(zero_temp), profile, time);
    IobResult {
        totals,
        with_zero_temp,
        last_temp: timeline.last_temp,
        last_bolus_time: timeline.last_bolus_time,
    }
}

/// IOB at `time`, with the zero-temp variant starting at `time`.
///
/// An empty timeline yields all-zero totals.
pub fn iob_at(timeline: &Timeline, profile: &Profile, time: DateTime<Utc>) -> IobResult {
    let zero_temp = history::zero_temp_doses(profile, time, ZERO_TEMP_MINUTES);
    result_at(timeline, &zero_temp, profile, time)
}

/// IOB forecast from `now`: 48 results 5 minutes apart.
///
/// The zero-temp variant assumes a 0 U/h temp from `now` for four hours.
pub fn iob_array(timeline: &Timeline, profile: &Profile, now: DateTime<Utc>) -> Vec<IobResult> {
    let zero_temp = history::zero_temp_doses(profile, now, ZERO_TEMP_MINUTES);
    let out: Vec<IobResult> = (0..FORECAST_TICKS)
        .map(|k| {
            let t = now + Duration::minutes(5 * k as i64);
            result_at(timeline, &zero_temp, profile, t)
        })
        .collect();
    if let Some(first) = out.first() {
        tracing::debug!(
            iob = first.totals.iob,
            activity = first.totals.activity,
            basaliob = first.totals.basaliob,
            bolusiob = first.totals.bolusiob,
            "iob computed"
        );
    }
    out
}
