mod aggregates;
mod app;
mod cli;
mod config;
mod error;
mod intervals;
mod limits;
mod server;
mod settings;
mod storage;
mod tracker;
mod transfer;

use anyhow::{Context, Result};
use clap::Parser;
use config::LoggingConfig;
use std::fs::OpenOptions;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let config = config::AppConfig::load(cli.config_path.as_deref())?;
    init_tracing(&config.logging)?;
    for warning in &config.warnings {
        tracing::warn!("{warning}");
    }
    app::App::new(config).run(cli).await
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);

    if logging.stderr {
        let _ = builder.with_writer(std::io::stderr).try_init();
        return Ok(());
    }

    // Keep stdout clean for export/import output: tracing goes to a file.
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&logging.file)
        .with_context(|| format!("failed to open {} for tracing output", logging.file.display()))?;
    let _ = builder
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .try_init();
    Ok(())
}
