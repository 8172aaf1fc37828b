//! Input loading and the subcommands.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use eyre::WrapErr;
use serde::Serialize;

use oref_config::{FileStore, InputBundle, Settings};
use oref_core::autosens::{self, AutosensInputs};
use oref_core::glucose::Sample;
use oref_core::{iob, meal, profile};
use oref_traits::{Clock, FixedClock, SystemClock};

use crate::cli::{Commands, InputArgs};

/// Everything a subcommand needs, loaded and validated.
pub struct Loaded {
    pub settings: Settings,
    pub bundle: InputBundle,
    pub now: DateTime<Utc>,
}

fn read_settings_file(path: &Path) -> eyre::Result<Settings> {
    let raw = fs::read_to_string(path).wrap_err_with(|| format!("read settings {path:?}"))?;
    let settings = oref_config::load_json(&raw)
        .map_err(|e| eyre::eyre!("parse settings {path:?}: {e}"))?;
    settings.validate()?;
    Ok(settings)
}

pub fn load(args: &InputArgs, store: Option<&Path>) -> eyre::Result<Loaded> {
    let raw = fs::read_to_string(&args.input)
        .wrap_err_with(|| format!("read input bundle {:?}", args.input))?;
    let mut bundle: InputBundle = serde_json::from_str(&raw)
        .wrap_err_with(|| format!("parse input bundle {:?}", args.input))?;
    if let Some(csv) = &args.glucose_csv {
        bundle.glucose = oref_config::load_glucose_csv(csv)?;
    }

    // --settings > store > bundle
    let settings = if let Some(path) = &args.settings {
        read_settings_file(path)?
    } else if let Some(dir) = store {
        oref_config::store::load_settings(&FileStore::new(dir))?
    } else if let Some(s) = bundle.settings.take() {
        s.validate()?;
        s
    } else {
        eyre::bail!("no settings: pass --settings, --store, or include them in the input bundle");
    };

    let clock: Box<dyn Clock> = match args.now.or(bundle.now) {
        Some(t) => Box::new(FixedClock::from_unix_ms(t.timestamp_millis())),
        None => Box::new(SystemClock::new()),
    };
    let now = DateTime::<Utc>::from(clock.now());
    tracing::debug!(
        %now,
        glucose = bundle.glucose.len(),
        pump_events = bundle.pump_history.len(),
        carbs = bundle.carbs.len(),
        "inputs loaded"
    );
    Ok(Loaded { settings, bundle, now })
}

fn print_json<T: Serialize>(value: &T, compact: bool) -> eyre::Result<()> {
    let out = if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };
    println!("{out}");
    Ok(())
}

fn resolve_profile(l: &Loaded) -> eyre::Result<oref_core::Profile> {
    profile::resolve(&l.settings, &l.bundle.temp_targets, &l.bundle.custom, l.now)
        .wrap_err("resolve profile")
}

fn samples(l: &Loaded) -> Vec<Sample> {
    l.bundle.glucose.iter().map(Sample::from).collect()
}

pub fn dispatch(
    cmd: &Commands,
    store: Option<&Path>,
    microbolus_default: bool,
    compact: bool,
) -> eyre::Result<()> {
    match cmd {
        Commands::Profile(args) => {
            let l = load(args, store)?;
            print_json(&resolve_profile(&l)?, compact)
        }
        Commands::Iob { input, forecast } => {
            let l = load(input, store)?;
            let p = resolve_profile(&l)?;
            let timeline = iob::build_timeline(&l.bundle.pump_history, &p, l.now);
            if *forecast {
                print_json(&iob::iob_array(&timeline, &p, l.now), compact)
            } else {
                print_json(&iob::iob_at(&timeline, &p, l.now), compact)
            }
        }
        Commands::Meal(args) => {
            let l = load(args, store)?;
            let p = resolve_profile(&l)?;
            let timeline = iob::build_timeline(&l.bundle.pump_history, &p, l.now);
            let m = meal::meal_totals(&l.bundle.carbs, &samples(&l), &timeline, &p, l.now);
            print_json(&m, compact)
        }
        Commands::Autosens(args) => {
            let l = load(args, store)?;
            let p = resolve_profile(&l)?;
            let timeline = iob::build_timeline(&l.bundle.pump_history, &p, l.now);
            let glucose = samples(&l);
            let a = autosens::compute_ratio(
                &AutosensInputs {
                    glucose: &glucose,
                    timeline: &timeline,
                    history: &l.bundle.pump_history,
                    carbs: &l.bundle.carbs,
                    temp_targets: &l.bundle.temp_targets,
                    now: l.now,
                },
                &p,
            );
            print_json(&a, compact)
        }
        Commands::Determine {
            input,
            full,
            microbolus_allowed,
        } => {
            let l = load(input, store)?;
            let out = oref_core::run_cycle(
                &l.settings,
                &l.bundle,
                l.now,
                microbolus_allowed.unwrap_or(microbolus_default),
            )?;
            if *full {
                return print_json(&out, compact);
            }
            match &out.determination {
                Some(d) => print_json(d, compact),
                None => print_json(
                    &serde_json::json!({
                        "reason": "No usable glucose reading; nothing to determine",
                        "deliverAt": l.now,
                    }),
                    compact,
                ),
            }
        }
        Commands::Health => health(store, compact),
    }
}

/// Report version and, when a store is configured, whether its settings load.
fn health(store: Option<&Path>, compact: bool) -> eyre::Result<()> {
    let settings = match store {
        Some(dir) => match oref_config::store::load_settings(&FileStore::new(dir)) {
            Ok(_) => "ok".to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "settings blob unusable");
                return Err(e.wrap_err("health: settings"));
            }
        },
        None => "not configured".to_string(),
    };
    print_json(
        &serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "settings": settings,
        }),
        compact,
    )
}
