use oref_config::{GlucoseUnits, InsulinCurve, TargetOverride, load_json, load_toml};
use rstest::rstest;

const VALID: &str = r#"
{
  "basal": [
    {"start": "00:00:00", "offset": 0, "value": 1.0},
    {"start": "02:00:00", "offset": 120, "value": 2.0},
    {"start": "03:00:00", "offset": 180, "value": 3.0}
  ],
  "isf": [{"start": "00:00:00", "offset": 0, "value": 50}],
  "carb_ratio": [{"start": "00:00:00", "offset": 0, "value": 10}],
  "targets": [{"start": "00:00:00", "offset": 0, "low": 100, "high": 110}],
  "pump": {"max_basal": 3.0, "dia": 5},
  "preferences": {"max_iob": 4, "curve": "ultra-rapid", "target_bg": false, "someUnknownKey": 7}
}
"#;

#[test]
fn accepts_valid_settings_and_ignores_unknown_fields() {
    let s = load_json(VALID).expect("parse JSON");
    s.validate().expect("valid settings should pass");
    assert_eq!(s.preferences.curve, InsulinCurve::UltraRapid);
    assert_eq!(s.preferences.target_bg, TargetOverride::NoTarget);
    assert_eq!(s.preferences.out_units, GlucoseUnits::MgDl);
    assert_eq!(s.pump.bolus_increment, 0.1);
}

#[test]
fn missing_required_numeric_field_fails_parse() {
    let broken = VALID.replace(r#""max_basal": 3.0, "#, "");
    assert!(load_json(&broken).is_err());
}

#[rstest]
#[case(r#""offset": 0, "value": 1.0"#, r#""offset": 30, "value": 1.0"#, "first entry must start at offset 0")]
#[case(r#""offset": 180, "value": 3.0"#, r#""offset": 100, "value": 3.0"#, "sorted by offset")]
#[case(r#""dia": 5"#, r#""dia": 0.5"#, "dia must be >= 1")]
#[case(r#""max_iob": 4"#, r#""max_iob": 4, "smb_delivery_ratio": 0"#, "smb_delivery_ratio")]
fn rejects_invalid_settings(#[case] from: &str, #[case] to: &str, #[case] needle: &str) {
    // Only the first occurrence is replaced so schedules other than basal stay valid.
    let json = VALID.replacen(from, to, 1);
    let s = load_json(&json).expect("parse JSON");
    let err = s.validate().expect_err("should reject");
    assert!(
        format!("{err}").contains(needle),
        "error {err} should mention {needle}"
    );
}

#[test]
fn rejects_start_label_that_disagrees_with_offset() {
    let json = VALID.replace(r#""start": "02:00:00", "offset": 120"#, r#""start": "02:30:00", "offset": 120"#);
    let s = load_json(&json).expect("parse JSON");
    assert!(s.validate().is_err());
}

#[test]
fn cli_config_defaults_and_rotation_check() {
    let cfg = load_toml("").expect("empty TOML");
    cfg.validate().expect("defaults valid");
    assert!(cfg.engine.microbolus_allowed);

    let cfg = load_toml("[logging]\nrotation = \"weekly\"\n").expect("parse");
    assert!(cfg.validate().is_err());
}
