mod cli;
mod config;

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use deepfreeze_core::{Freezer, FreezerConfig};

use crate::cli::{Cli, Command};
use crate::config::Config;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(&cli)?;
    init_logging(&config)?;

    match cli.command {
        Command::Backup { .. } => backup(&config),
    }
}

fn backup(config: &Config) -> anyhow::Result<()> {
    let root = config
        .root
        .clone()
        .context("no backup root configured: pass --root or set ROOT")?;

    let mut freezer_config = FreezerConfig::new(root, config.dest());
    freezer_config.excludes = config.exclude.clone();
    let mut freezer = Freezer::new(freezer_config)?;
    let report = freezer.freeze()?;

    println!(
        "tray {}: {} files frozen into {} cubes ({} bytes), manifest at {}",
        report.tray_id,
        report.files,
        report.cubes,
        report.bytes_written,
        report.manifest_path.display()
    );
    Ok(())
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = if config.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
                .with(filter)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }
    Ok(())
}
