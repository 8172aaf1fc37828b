//! Rounding and unit helpers shared by every stage.

use oref_config::GlucoseUnits;

/// mg/dL per mmol/L, as used for display conversion.
pub const MGDL_PER_MMOL: f64 = 18.0;

/// Round half away from zero to `digits` decimals.
#[inline]
pub fn round_to(x: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (x * scale).round() / scale
}

/// Round to the nearest integer, ties away from zero.
#[inline]
pub fn round0(x: f64) -> f64 {
    x.round()
}

/// Truncate toward zero at `digits` decimals.
#[inline]
pub fn trunc_to(x: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (x * scale).trunc() / scale
}

/// Round a basal rate to what the pump can deliver.
///
/// Below 1 U/h: 0.025 steps on x23/x54 models, 0.05 otherwise.
/// Below 10 U/h: 0.05 steps. Above: 0.1 steps.
pub fn round_basal(rate: f64, pump_model: Option<&str>) -> f64 {
    let fine = pump_model.is_some_and(|m| m.ends_with("23") || m.ends_with("54"));
    let scale = if rate < 1.0 {
        if fine { 40.0 } else { 20.0 }
    } else if rate < 10.0 {
        20.0
    } else {
        10.0
    };
    round_to((rate * scale).round() / scale, 3)
}

/// Floor `units` to a multiple of `increment`.
#[inline]
pub fn floor_to_increment(units: f64, increment: f64) -> f64 {
    if increment <= 0.0 {
        return units;
    }
    let steps = (units / increment + 1e-9).floor();
    round_to(steps * increment, 3)
}

/// Render a mg/dL value in the configured output units.
pub fn convert_bg(value: f64, units: GlucoseUnits) -> String {
    match units {
        GlucoseUnits::MgDl => format!("{}", round0(value)),
        GlucoseUnits::MmolL => format!("{:.1}", value / MGDL_PER_MMOL),
    }
}

/// Weighted percentile over an ascending slice (linear between ranks).
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if p <= 0.0 {
        return sorted[0];
    }
    if p >= 1.0 {
        return sorted[sorted.len() - 1];
    }
    let index = sorted.len() as f64 * p;
    let lower = index.floor() as usize;
    let upper = lower + 1;
    let weight = index % 1.0;
    if upper >= sorted.len() {
        return sorted[lower.min(sorted.len() - 1)];
    }
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_basal_steps() {
        assert_eq!(round_basal(0.83, None), 0.85);
        assert_eq!(round_basal(0.83, Some("554")), 0.825);
        assert_eq!(round_basal(2.12, None), 2.1);
        assert_eq!(round_basal(12.34, None), 12.3);
    }

    #[test]
    fn floor_to_increment_never_rounds_up() {
        assert_eq!(floor_to_increment(0.39, 0.1), 0.3);
        assert_eq!(floor_to_increment(0.3, 0.1), 0.3);
        assert_eq!(floor_to_increment(0.049, 0.05), 0.0);
    }

    #[test]
    fn percentile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&v, 0.5), 3.0);
        assert_eq!(percentile(&v, 0.0), 1.0);
        assert_eq!(percentile(&v, 1.0), 4.0);
        assert!((percentile(&v, 0.6) - 3.4).abs() < 1e-9);
    }

    #[test]
    fn convert_bg_units() {
        assert_eq!(convert_bg(99.6, GlucoseUnits::MgDl), "100");
        assert_eq!(convert_bg(180.0, GlucoseUnits::MmolL), "10.0");
    }
}
