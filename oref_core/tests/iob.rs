use chrono::{DateTime, Duration, Utc};
use oref_config::{CustomOrefVariables, PumpEventKind, PumpHistoryEvent};
use oref_core::iob::{build_timeline, iob_at};
use oref_core::{Profile, profile};
use proptest::prelude::*;
use rstest::rstest;

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn profile_with_curve(now: DateTime<Utc>, curve: &str) -> Profile {
    let s = oref_config::load_json(&format!(
        r#"{{
        "basal": [{{"offset":0,"value":1.0}}],
        "isf": [{{"offset":0,"value":50}}],
        "carb_ratio": [{{"offset":0,"value":10}}],
        "targets": [{{"offset":0,"low":100,"high":110}}],
        "pump": {{"max_basal": 3.0, "dia": 5}},
        "preferences": {{"curve": "{curve}"}}
    }}"#
    ))
    .unwrap();
    profile::resolve(&s, &[], &CustomOrefVariables::default(), now).unwrap()
}

fn profile_at(now: DateTime<Utc>) -> Profile {
    profile_with_curve(now, "rapid-acting")
}

fn bolus(t: DateTime<Utc>, amount: f64) -> PumpHistoryEvent {
    PumpHistoryEvent {
        id: "b1".into(),
        timestamp: t,
        kind: PumpEventKind::Bolus { amount, duration_min: 0.0, automatic: false },
    }
}

// Closed form of the exponential curve with DIA 5h: peak 75 leaves 0.925 U/U
// after 30 minutes, peak 55 leaves 0.884 U/U.
#[rstest]
#[case("rapid-acting", 1.85)]
#[case("ultra-rapid", 1.769)]
fn bolus_decays_over_thirty_minutes(#[case] curve: &str, #[case] expected: f64) {
    let dose = at("2024-05-01T08:00:00Z");
    let now = dose + Duration::minutes(30);
    let p = profile_with_curve(now, curve);
    let tl = build_timeline(&[bolus(dose, 2.0)], &p, now);
    let r = iob_at(&tl, &p, now);
    assert_eq!(r.iob(), expected);
    assert!(r.activity() > 0.0);
}

#[test]
fn bolus_is_gone_after_dia() {
    let dose = at("2024-05-01T08:00:00Z");
    let now = dose + Duration::hours(5);
    let p = profile_at(now);
    let tl = build_timeline(&[bolus(dose, 2.0)], &p, now);
    let r = iob_at(&tl, &p, now);
    assert_eq!(r.iob(), 0.0);
    assert_eq!(r.activity(), 0.0);
}

proptest! {
    #[test]
    fn iob_at_is_idempotent(amount in 0.05f64..10.0, minutes in 0i64..360) {
        let dose = at("2024-05-01T08:00:00Z");
        let now = dose + Duration::minutes(minutes);
        let p = profile_at(now);
        let tl = build_timeline(&[bolus(dose, amount)], &p, now);
        let a = iob_at(&tl, &p, now);
        let b = iob_at(&tl, &p, now);
        prop_assert_eq!(a.iob().to_bits(), b.iob().to_bits());
        prop_assert_eq!(a.activity().to_bits(), b.activity().to_bits());
        prop_assert_eq!(a, b);
    }
}
