#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! `oref`: run the dosing pipeline over a JSON input bundle.

mod cli;
mod error_fmt;
mod run;

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use eyre::WrapErr;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use cli::{Cli, FILE_GUARD, JSON_MODE};
use oref_config::CliConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn load_cli_config(path: Option<&Path>) -> eyre::Result<CliConfig> {
    let Some(path) = path else {
        return Ok(CliConfig::default());
    };
    let raw = fs::read_to_string(path).wrap_err_with(|| format!("read config {path:?}"))?;
    let cfg = oref_config::load_toml(&raw).wrap_err_with(|| format!("parse config {path:?}"))?;
    cfg.validate()?;
    Ok(cfg)
}

fn init_tracing(json: bool, level: Option<&str>, cfg: &CliConfig) -> eyre::Result<()> {
    let level = level.or(cfg.logging.level.as_deref()).unwrap_or("warn");
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    // Logs go to stderr; stdout carries the JSON result.
    let mut layers: Vec<BoxedLayer> = Vec::new();
    if json {
        layers.push(fmt::layer().json().with_writer(std::io::stderr).boxed());
    } else {
        layers.push(fmt::layer().with_writer(std::io::stderr).boxed());
    }

    if let Some(file) = cfg.logging.file.as_deref() {
        let path = Path::new(file);
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let name = path
            .file_name()
            .ok_or_else(|| eyre::eyre!("logging.file {file:?} has no file name"))?;
        let appender = match cfg.logging.rotation.as_deref() {
            Some("daily") => tracing_appender::rolling::daily(&dir, name),
            Some("hourly") => tracing_appender::rolling::hourly(&dir, name),
            _ => tracing_appender::rolling::never(&dir, name),
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        layers.push(fmt::layer().json().with_ansi(false).with_writer(writer).boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| eyre::eyre!("init tracing: {e}"))
}

fn real_main(cli: &Cli) -> eyre::Result<()> {
    color_eyre::install()?;
    let cfg = load_cli_config(cli.config.as_deref())?;
    init_tracing(cli.json, cli.log_level.as_deref(), &cfg)?;

    let store = cli
        .store
        .clone()
        .or_else(|| cfg.paths.store.as_ref().map(PathBuf::from));
    tracing::debug!(?store, command = ?cli.cmd, "starting");
    run::dispatch(&cli.cmd, store.as_deref(), cfg.engine.microbolus_allowed, cli.json)
}

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    if let Err(err) = real_main(&cli) {
        if JSON_MODE.get().copied().unwrap_or(false) {
            eprintln!("{}", error_fmt::format_error_json(&err));
        } else {
            eprintln!("{}", error_fmt::humanize(&err));
        }
        std::process::exit(error_fmt::exit_code_for_error(&err));
    }
}
