//! Pump history → normalized treatment timeline.
//!
//! Temp basals are paired with their duration records, cut at the next temp
//! and at `as_of`, carved around suspended spans and split wherever the basal
//! schedule changes. Each segment's net insulin (rate minus scheduled basal)
//! is then discretised into ±0.05 U pulses.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;

use oref_config::{PumpEventKind, PumpHistoryEvent, TempKind};

use crate::profile::Profile;
use crate::util::round_to;

/// Size of one discretised temp-basal pulse (U).
pub const PULSE_UNITS: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SegmentSource {
    TempBasal,
    Suspend,
    ExtendedBolus,
    /// Hypothetical zero temp used for the zero-temp forecast.
    ZeroTemp,
}

/// One entry of the normalized timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TimelineEntry {
    Bolus {
        timestamp: DateTime<Utc>,
        amount: f64,
        automatic: bool,
    },
    Segment {
        start: DateTime<Utc>,
        duration_min: f64,
        rate: f64,
        scheduled_rate: f64,
        source: SegmentSource,
    },
}

impl TimelineEntry {
    pub const fn start(&self) -> DateTime<Utc> {
        match self {
            Self::Bolus { timestamp, .. } => *timestamp,
            Self::Segment { start, .. } => *start,
        }
    }
}

/// A discrete insulin amount delivered at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Dose {
    pub timestamp: DateTime<Utc>,
    pub insulin: f64,
}

/// The most recent temp basal recorded in pump history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LastTemp {
    pub timestamp: DateTime<Utc>,
    pub rate: f64,
    /// Programmed duration in minutes.
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Timeline {
    pub entries: Vec<TimelineEntry>,
    pub doses: Vec<Dose>,
    pub last_temp: Option<LastTemp>,
    pub last_bolus_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    rate: f64,
    source: SegmentSource,
}

fn minutes_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (b - a).num_milliseconds() as f64 / 60_000.0
}

fn after_minutes(t: DateTime<Utc>, minutes: f64) -> DateTime<Utc> {
    t + Duration::milliseconds((minutes * 60_000.0).round() as i64)
}

/// Temp basals with their effective (truncated) spans, plus the last-temp snapshot.
fn temp_spans(
    events: &[PumpHistoryEvent],
    profile: &Profile,
    as_of: DateTime<Utc>,
) -> (Vec<Span>, Option<LastTemp>) {
    let mut temps: Vec<(DateTime<Utc>, f64, f64)> = Vec::new();
    for ev in events {
        let PumpEventKind::TempBasal { rate, temp } = ev.kind else {
            continue;
        };
        let duration = events.iter().find_map(|e| match e.kind {
                PumpEventKind::TempBasalDuration { duration_min } if e.timestamp == ev.timestamp => {
                    Some(duration_min)
                }
                _ => None,
            });
        let Some(duration) = duration else {
            tracing::trace!(at = %ev.timestamp, "temp basal without duration record; skipped");
            continue;
        };
        let rate = match temp {
            TempKind::Absolute => rate,
            TempKind::Percent => profile.basal_at(ev.timestamp).unwrap_or(0.0) * rate / 100.0,
        };
        if !rate.is_finite() || !duration.is_finite() {
            tracing::warn!(at = %ev.timestamp, rate, duration, "non-finite temp basal; skipped");
            continue;
        }
        temps.push((ev.timestamp, rate, duration));
    }

    // Reported as recorded; the history mismatch check compares it with the pump.
    let last_temp = temps.last().map(|&(timestamp, rate, duration)| LastTemp {
        timestamp,
        rate,
        duration,
    });

    let mut spans = Vec::with_capacity(temps.len());
    for (i, &(start, rate, duration)) in temps.iter().enumerate() {
        let mut end = after_minutes(start, duration).min(as_of);
        if let Some(&(next, _, _)) = temps.get(i + 1) {
            end = end.min(next);
        }
        let delivered = rate.clamp(0.0, profile.max_basal);
        if delivered != rate {
            tracing::warn!(at = %start, rate, max_basal = profile.max_basal, "temp basal outside [0, max_basal]; clamped");
        }
        if end > start {
            spans.push(Span { start, end, rate: delivered, source: SegmentSource::TempBasal });
        }
    }
    (spans, last_temp)
}

/// Suspended intervals. Repeated suspends collapse to the earliest; only the
/// first resume after a suspend closes it. A leading resume means the pump
/// was suspended from the start of the history.
fn suspend_spans(events: &[PumpHistoryEvent], as_of: DateTime<Utc>) -> Vec<Span> {
    let mut out = Vec::new();
    let mut since: Option<DateTime<Utc>> = None;
    let mut seen_suspend = false;
    let earliest = events.first().map(|e| e.timestamp);
    for ev in events {
        match ev.kind {
            PumpEventKind::PumpSuspend => {
                seen_suspend = true;
                if since.is_none() {
                    since = Some(ev.timestamp);
                }
            }
            PumpEventKind::PumpResume => {
                if let Some(start) = since.take() {
                    out.push((start, ev.timestamp));
                } else if !seen_suspend
                    && let Some(start) = earliest
                {
                    seen_suspend = true;
                    out.push((start, ev.timestamp));
                }
            }
            _ => {}
        }
    }
    if let Some(start) = since {
        out.push((start, as_of));
    }
    out.into_iter()
        .filter(|(s, e)| e > s)
        .map(|(start, end)| Span { start, end, rate: 0.0, source: SegmentSource::Suspend })
        .collect()
}

/// Remove the `holes` from `span`, returning what is left.
fn subtract(span: Span, holes: &[Span]) -> Vec<Span> {
    let mut pieces = vec![span];
    for hole in holes {
        let mut next = Vec::with_capacity(pieces.len() + 1);
        for p in pieces {
            if hole.end <= p.start || hole.start >= p.end {
                next.push(p);
                continue;
            }
            if hole.start > p.start {
                next.push(Span { end: hole.start, ..p });
            }
            if hole.end < p.end {
                next.push(Span { start: hole.end, ..p });
            }
        }
        pieces = next;
    }
    pieces
}

/// Split a span wherever the basal schedule changes or local midnight passes.
fn split_at_schedule(span: Span, profile: &Profile) -> Vec<Span> {
    let mut out = Vec::new();
    let mut start = span.start;
    while start < span.end {
        let local = start.naive_utc() + Duration::minutes(i64::from(profile.utc_offset_minutes));
        let secs = i64::from(local.num_seconds_from_midnight());
        let next_offset = profile
            .basal_schedule
            .iter()
            .map(|s| i64::from(s.offset) * 60)
            .find(|o| *o > secs)
            .unwrap_or(i64::from(oref_config::MINUTES_PER_DAY) * 60);
        let boundary = start + Duration::seconds(next_offset - secs)
            - Duration::nanoseconds(i64::from(local.nanosecond()));
        let end = boundary.min(span.end);
        out.push(Span { start, end, ..span });
        start = end;
    }
    out
}

/// Discretise a segment's net insulin into evenly spaced ±0.05 U pulses.
fn pulses(start: DateTime<Utc>, duration_min: f64, net_rate: f64, out: &mut Vec<Dose>) {
    let size = if net_rate < 0.0 { -PULSE_UNITS } else { PULSE_UNITS };
    let net_amount = (net_rate * duration_min * 10.0 / 6.0).round() / 100.0;
    let count = (net_amount / size).round();
    if !(count >= 1.0) {
        return;
    }
    let spacing = duration_min / count;
    for j in 0..count as usize {
        out.push(Dose {
            timestamp: after_minutes(start, j as f64 * spacing),
            insulin: size,
        });
    }
}

fn push_segments(spans: Vec<Span>, profile: &Profile, entries: &mut Vec<TimelineEntry>, doses: &mut Vec<Dose>) {
    for span in spans {
        for piece in split_at_schedule(span, profile) {
            let scheduled = match piece.source {
                SegmentSource::ExtendedBolus => 0.0,
                _ => profile.basal_at(piece.start).unwrap_or(profile.current_basal),
            };
            let duration_min = minutes_between(piece.start, piece.end);
            pulses(piece.start, duration_min, piece.rate - scheduled, doses);
            entries.push(TimelineEntry::Segment {
                start: piece.start,
                duration_min: round_to(duration_min, 3),
                rate: piece.rate,
                scheduled_rate: scheduled,
                source: piece.source,
            });
        }
    }
}

/// Build the treatment timeline from raw history as of `as_of`.
///
/// Events may arrive in any order; anything after `as_of` is ignored.
pub fn build_timeline(
    history: &[PumpHistoryEvent],
    profile: &Profile,
    as_of: DateTime<Utc>,
) -> Timeline {
    let mut events: Vec<PumpHistoryEvent> = history
        .iter()
        .filter(|e| e.timestamp <= as_of)
        .cloned()
        .collect();
    events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    let (temps, last_temp) = temp_spans(&events, profile, as_of);
    let suspends = if profile.preferences.suspend_zeros_iob {
        suspend_spans(&events, as_of)
    } else {
        Vec::new()
    };

    let mut entries = Vec::new();
    let mut doses = Vec::new();
    let mut last_bolus_time = None;

    for ev in &events {
        if let PumpEventKind::Bolus { amount, duration_min, automatic } = ev.kind {
            if !(amount > 0.0) {
                continue;
            }
            if duration_min > 0.0 {
                let end = after_minutes(ev.timestamp, duration_min).min(as_of);
                let span = Span {
                    start: ev.timestamp,
                    end,
                    rate: amount.min(profile.max_bolus) / (duration_min / 60.0),
                    source: SegmentSource::ExtendedBolus,
                };
                push_segments(vec![span], profile, &mut entries, &mut doses);
                continue;
            }
            last_bolus_time = Some(ev.timestamp);
            doses.push(Dose { timestamp: ev.timestamp, insulin: amount });
            entries.push(TimelineEntry::Bolus {
                timestamp: ev.timestamp,
                amount,
                automatic,
            });
        }
    }

    let carved: Vec<Span> = temps.into_iter().flat_map(|t| subtract(t, &suspends)).collect();
    push_segments(carved, profile, &mut entries, &mut doses);
    push_segments(suspends, profile, &mut entries, &mut doses);

    entries.sort_by_key(TimelineEntry::start);
    doses.sort_by_key(|d| d.timestamp);
    tracing::trace!(entries = entries.len(), doses = doses.len(), "timeline built");
    Timeline {
        entries,
        doses,
        last_temp,
        last_bolus_time,
    }
}

/// Pulses of a hypothetical 0 U/h temp running `minutes` from `start`.
pub fn zero_temp_doses(profile: &Profile, start: DateTime<Utc>, minutes: f64) -> Vec<Dose> {
    let mut entries = Vec::new();
    let mut doses = Vec::new();
    let span = Span {
        start,
        end: after_minutes(start, minutes),
        rate: 0.0,
        source: SegmentSource::ZeroTemp,
    };
    push_segments(vec![span], profile, &mut entries, &mut doses);
    doses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleStep;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn ev(id: &str, ts: &str, kind: PumpEventKind) -> PumpHistoryEvent {
        PumpHistoryEvent { id: id.into(), timestamp: at(ts), kind }
    }

    fn profile() -> Profile {
        crate::test_support::profile_with_basal(vec![
            ScheduleStep { offset: 0, value: 1.0 },
            ScheduleStep { offset: 600, value: 2.0 },
        ])
    }

    fn temp(ts: &str, rate: f64, dur: f64) -> [PumpHistoryEvent; 2] {
        [
            ev("t", ts, PumpEventKind::TempBasal { rate, temp: TempKind::Absolute }),
            ev("d", ts, PumpEventKind::TempBasalDuration { duration_min: dur }),
        ]
    }

    #[test]
    fn temp_is_cut_by_next_temp_and_as_of() {
        let mut h = Vec::new();
        h.extend(temp("2024-05-01T08:00:00Z", 2.0, 30.0));
        h.extend(temp("2024-05-01T08:10:00Z", 0.0, 30.0));
        let t = build_timeline(&h, &profile(), at("2024-05-01T08:20:00Z"));
        let durations: Vec<f64> = t
            .entries
            .iter()
            .filter_map(|e| match e {
                TimelineEntry::Segment { duration_min, .. } => Some(*duration_min),
                TimelineEntry::Bolus { .. } => None,
            })
            .collect();
        assert_eq!(durations, vec![10.0, 10.0]);
        let last = t.last_temp.unwrap();
        assert_eq!(last.rate, 0.0);
        assert_eq!(last.duration, 30.0);
    }

    #[test]
    fn segments_split_at_schedule_change() {
        let h = temp("2024-05-01T09:50:00Z", 3.0, 30.0);
        let t = build_timeline(&h, &profile(), at("2024-05-01T11:00:00Z"));
        let segs: Vec<(f64, f64)> = t
            .entries
            .iter()
            .filter_map(|e| match e {
                TimelineEntry::Segment { duration_min, scheduled_rate, .. } => {
                    Some((*duration_min, *scheduled_rate))
                }
                TimelineEntry::Bolus { .. } => None,
            })
            .collect();
        assert_eq!(segs, vec![(10.0, 1.0), (20.0, 2.0)]);
    }

    #[test]
    fn net_insulin_becomes_pulses() {
        // +1 U/h over 30 min = 0.5 U = 10 pulses of 0.05 U.
        let h = temp("2024-05-01T08:00:00Z", 2.0, 30.0);
        let t = build_timeline(&h, &profile(), at("2024-05-01T09:00:00Z"));
        assert_eq!(t.doses.len(), 10);
        assert!(t.doses.iter().all(|d| d.insulin == PULSE_UNITS));
        assert_eq!(t.doses[1].timestamp - t.doses[0].timestamp, Duration::minutes(3));
    }

    #[test]
    fn corrupt_temp_rate_is_clamped_to_max_basal() {
        let h = temp("2024-05-01T08:00:00Z", 1e6, 30.0);
        let t = build_timeline(&h, &profile(), at("2024-05-01T09:00:00Z"));
        // (3 - 1) U/h over 30 min = 1 U = 20 pulses.
        assert_eq!(t.doses.len(), 20);
        assert!(matches!(t.entries[0], TimelineEntry::Segment { rate, .. } if rate == 3.0));
        assert_eq!(t.last_temp.unwrap().rate, 1e6);
    }

    #[test]
    fn suspends_collapse_and_zero_basal() {
        let h = vec![
            ev("s1", "2024-05-01T08:00:00Z", PumpEventKind::PumpSuspend),
            ev("s2", "2024-05-01T08:05:00Z", PumpEventKind::PumpSuspend),
            ev("r1", "2024-05-01T08:30:00Z", PumpEventKind::PumpResume),
            ev("r2", "2024-05-01T08:40:00Z", PumpEventKind::PumpResume),
        ];
        let t = build_timeline(&h, &profile(), at("2024-05-01T09:00:00Z"));
        assert_eq!(t.entries.len(), 1);
        assert!(matches!(
            t.entries[0],
            TimelineEntry::Segment { duration_min, source: SegmentSource::Suspend, .. } if duration_min == 30.0
        ));
        // -1 U/h for 30 min = -0.5 U.
        let total: f64 = t.doses.iter().map(|d| d.insulin).sum();
        assert!((total + 0.5).abs() < 1e-9);
    }

    #[test]
    fn leading_resume_means_suspended_from_start() {
        let h = vec![
            ev("b", "2024-05-01T07:00:00Z", PumpEventKind::Bolus { amount: 1.0, duration_min: 0.0, automatic: false }),
            ev("r", "2024-05-01T07:30:00Z", PumpEventKind::PumpResume),
        ];
        let t = build_timeline(&h, &profile(), at("2024-05-01T09:00:00Z"));
        assert!(t.entries.iter().any(|e| matches!(
            e,
            TimelineEntry::Segment { source: SegmentSource::Suspend, duration_min, .. } if *duration_min == 30.0
        )));
        assert_eq!(t.last_bolus_time, Some(at("2024-05-01T07:00:00Z")));
    }

    #[test]
    fn temp_is_carved_around_suspend() {
        let mut h: Vec<PumpHistoryEvent> = temp("2024-05-01T08:00:00Z", 2.0, 60.0).to_vec();
        h.push(ev("s", "2024-05-01T08:20:00Z", PumpEventKind::PumpSuspend));
        h.push(ev("r", "2024-05-01T08:30:00Z", PumpEventKind::PumpResume));
        let t = build_timeline(&h, &profile(), at("2024-05-01T10:00:00Z"));
        let kinds: Vec<(SegmentSource, f64)> = t
            .entries
            .iter()
            .filter_map(|e| match e {
                TimelineEntry::Segment { source, duration_min, .. } => Some((*source, *duration_min)),
                TimelineEntry::Bolus { .. } => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                (SegmentSource::TempBasal, 20.0),
                (SegmentSource::Suspend, 10.0),
                (SegmentSource::TempBasal, 30.0)
            ]
        );
    }

    #[test]
    fn empty_history_is_empty_timeline() {
        let t = build_timeline(&[], &profile(), at("2024-05-01T09:00:00Z"));
        assert_eq!(t, Timeline::default());
    }
}
