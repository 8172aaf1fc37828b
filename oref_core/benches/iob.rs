use chrono::{DateTime, Duration, Utc};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use oref_config::{
    CustomOrefVariables, GlucoseReading, InputBundle, PumpEventKind, PumpHistoryEvent, Settings,
    TempKind,
};
use oref_core::iob::{build_timeline, iob_array};
use oref_core::{profile, run_cycle};

fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-02T08:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn settings() -> Settings {
    oref_config::load_json(
        r#"{
        "basal": [{"offset":0,"value":0.9},{"offset":360,"value":1.2},{"offset":1200,"value":1.0}],
        "isf": [{"offset":0,"value":45}],
        "carb_ratio": [{"offset":0,"value":12}],
        "targets": [{"offset":0,"low":100,"high":110}],
        "preferences": {"max_iob": 4, "enableUAM": true},
        "pump": {"max_basal": 3.0, "dia": 6}
    }"#,
    )
    .unwrap()
}

// A day of 30-minute temps with a bolus every three hours.
fn history() -> Vec<PumpHistoryEvent> {
    let mut out = Vec::new();
    for i in 0..48i64 {
        let t = now() - Duration::minutes(30 * i);
        out.push(PumpHistoryEvent {
            id: format!("t{i}"),
            timestamp: t,
            kind: PumpEventKind::TempBasal { rate: 0.5 + (i % 5) as f64 * 0.3, temp: TempKind::Absolute },
        });
        out.push(PumpHistoryEvent {
            id: format!("d{i}"),
            timestamp: t,
            kind: PumpEventKind::TempBasalDuration { duration_min: 30.0 },
        });
        if i % 6 == 0 {
            out.push(PumpHistoryEvent {
                id: format!("b{i}"),
                timestamp: t + Duration::minutes(10),
                kind: PumpEventKind::Bolus { amount: 2.0, duration_min: 0.0, automatic: false },
            });
        }
    }
    out
}

fn glucose() -> Vec<GlucoseReading> {
    (0..288i64)
        .map(|i| GlucoseReading {
            timestamp: now() - Duration::minutes(5 * i),
            glucose: 120.0 + 40.0 * ((i as f64) / 24.0).sin(),
        })
        .collect()
}

pub fn bench_iob_array(c: &mut Criterion) {
    let s = settings();
    let p = profile::resolve(&s, &[], &CustomOrefVariables::default(), now()).unwrap();
    let h = history();
    c.bench_function("iob_array_24h_history", |b| {
        b.iter(|| {
            let tl = build_timeline(black_box(&h), &p, now());
            black_box(iob_array(&tl, &p, now()))
        });
    });
}

pub fn bench_full_cycle(c: &mut Criterion) {
    let s = settings();
    let bundle = InputBundle {
        glucose: glucose(),
        pump_history: history(),
        ..InputBundle::default()
    };
    let mut g = c.benchmark_group("cycle");
    g.sample_size(20);
    g.bench_function("run_cycle_24h", |b| {
        b.iter(|| black_box(run_cycle(&s, black_box(&bundle), now(), true).unwrap()));
    });
    g.finish();
}

criterion_group!(benches, bench_iob_array, bench_full_cycle);
criterion_main!(benches);
