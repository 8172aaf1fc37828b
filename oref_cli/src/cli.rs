//! CLI argument definitions and shared statics.

use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "oref", version, about = "Closed-loop dosing decisions from an input bundle")]
pub struct Cli {
    /// Path to the CLI config TOML (logging, store path, engine defaults)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory of the settings blob store (overrides [paths].store)
    #[arg(long, value_name = "DIR")]
    pub store: Option<PathBuf>,

    /// Log as JSON lines and print errors as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); defaults to [logging].level, then warn
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// Where the cycle's inputs come from.
#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    /// Input bundle JSON (glucose, pump history, carbs, temp targets, ...)
    #[arg(long, value_name = "FILE")]
    pub input: PathBuf,

    /// Settings JSON; takes precedence over the store and the bundle
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Glucose CSV (`timestamp,glucose`) replacing the bundle's readings
    #[arg(long = "glucose-csv", value_name = "FILE")]
    pub glucose_csv: Option<PathBuf>,

    /// Evaluate at this instant (RFC 3339) instead of the bundle's or the wall clock
    #[arg(long, value_name = "TIME", value_parser = parse_instant)]
    pub now: Option<DateTime<Utc>>,
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {e}"))
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the profile resolved for this cycle
    Profile(InputArgs),
    /// Print insulin on board (now, or the 4-hour forecast with --forecast)
    Iob {
        #[command(flatten)]
        input: InputArgs,
        /// Print all 48 forecast points
        #[arg(long, action = ArgAction::SetTrue)]
        forecast: bool,
    },
    /// Print carbs on board and deviation statistics
    Meal(InputArgs),
    /// Print the autosens ratio
    Autosens(InputArgs),
    /// Run the full cycle and print the determination
    Determine {
        #[command(flatten)]
        input: InputArgs,
        /// Print every intermediate, not just the determination
        #[arg(long, action = ArgAction::SetTrue)]
        full: bool,
        /// Whether the pump accepts micro-boluses (overrides [engine])
        #[arg(long = "microbolus-allowed", value_name = "BOOL")]
        microbolus_allowed: Option<bool>,
    },
    /// Health check for operational monitoring
    Health,
}
