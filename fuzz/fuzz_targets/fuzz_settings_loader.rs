#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Arbitrary settings JSON must never panic: parse, validate, then resolve.
    let Ok(settings) = oref_config::load_json(data) else {
        return;
    };
    if settings.validate().is_err() {
        return;
    }
    let now = chrono::DateTime::UNIX_EPOCH + chrono::Duration::hours(12);
    let _ = oref_core::profile::resolve(
        &settings,
        &[],
        &oref_config::CustomOrefVariables::default(),
        now,
    );
});
