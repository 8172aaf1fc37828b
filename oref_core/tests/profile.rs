use chrono::{DateTime, Duration, Utc};
use oref_config::{CustomOrefVariables, Settings};
use oref_core::{ProfileError, profile};
use rstest::rstest;

fn settings(basal: &str) -> Settings {
    oref_config::load_json(&format!(
        r#"{{
        "basal": {basal},
        "isf": [{{"offset":0,"value":50}}],
        "carb_ratio": [{{"offset":0,"value":10}}],
        "targets": [{{"offset":0,"low":100,"high":110}}],
        "pump": {{"max_basal": 4.0, "dia": 5}}
    }}"#
    ))
    .unwrap()
}

fn midnight() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

const STEPPED: &str = r#"[
    {"offset":0,"value":1},{"offset":120,"value":2},{"offset":180,"value":3}
]"#;

#[rstest]
#[case(0, 1.0)]
#[case(119, 1.0)]
#[case(120, 2.0)]
#[case(179, 2.0)]
#[case(180, 3.0)]
#[case(1439, 3.0)]
fn current_basal_follows_schedule(#[case] minute: i64, #[case] expected: f64) {
    let now = midnight() + Duration::minutes(minute);
    let p = profile::resolve(&settings(STEPPED), &[], &CustomOrefVariables::default(), now).unwrap();
    assert_eq!(p.current_basal, expected);
    assert_eq!(p.max_daily_basal, 3.0);
}

#[test]
fn zero_rate_schedule_fails_resolution() {
    let s = settings(r#"[{"offset":0,"value":0}]"#);
    let err = profile::resolve(&s, &[], &CustomOrefVariables::default(), midnight()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ProfileError>(),
        Some(ProfileError::InvalidCurrentBasal(_) | ProfileError::InvalidMaxDailyBasal(_))
    ));
}

#[test]
fn resolving_twice_is_identical() {
    let s = settings(STEPPED);
    let now = midnight() + Duration::minutes(150);
    let custom = CustomOrefVariables::default();
    let a = profile::resolve(&s, &[], &custom, now).unwrap();
    let b = profile::resolve(&s, &[], &custom, now).unwrap();
    assert_eq!(a, b);
}

#[test]
fn short_dia_is_rejected() {
    let mut s = settings(STEPPED);
    s.pump.dia = 0.5;
    let err = profile::resolve(&s, &[], &CustomOrefVariables::default(), midnight()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ProfileError>(),
        Some(ProfileError::InvalidDia { .. })
    ));
}
