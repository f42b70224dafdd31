use clap::Parser;
use std::path::PathBuf;

/// Command-line interface for the site usage tracker.
#[derive(Debug, Parser)]
#[command(author, version, about = "Per-site browsing time tracker and daily rollups", long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file (defaults to ./site-usage.toml if present).
    #[arg(long, value_name = "FILE")]
    pub config_path: Option<PathBuf>,
    /// Rebuild every site aggregate from the interval ledger before serving.
    #[arg(long)]
    pub recalculate: bool,
    /// Write all tracked data as a JSON export document and exit.
    #[arg(long, value_name = "FILE", conflicts_with = "import")]
    pub export: Option<PathBuf>,
    /// Apply a JSON export document and exit.
    #[arg(long, value_name = "FILE")]
    pub import: Option<PathBuf>,
}
