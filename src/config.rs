use crate::tracker::site::DEFAULT_IGNORED_PREFIXES;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Problems found while loading, logged once tracing is installed.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else {
            let default_path = PathBuf::from("site-usage.toml");
            if default_path.exists() {
                Self::from_file(&default_path)?
            } else {
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| "failed to parse configuration TOML")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = env::var("SITE_USAGE_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Ok(db_path) = env::var("SITE_USAGE_DB_PATH") {
            self.storage.database_path = PathBuf::from(db_path);
        }
        if let Ok(secs) = env::var("SITE_USAGE_FLUSH_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) => self.tracking.flush_interval_secs = secs,
                Err(err) => self.warnings.push(format!(
                    "ignoring invalid SITE_USAGE_FLUSH_INTERVAL_SECS `{secs}`: {err}"
                )),
            }
        }
        if let Ok(log_path) = env::var("SITE_USAGE_LOG_FILE") {
            self.logging.file = PathBuf::from(log_path);
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// How often the tracker wakes up to consider a partial flush.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Upper bound on unflushed time for a running session.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_ignored_prefixes")]
    pub ignored_prefixes: Vec<String>,
    #[serde(default = "default_signal_queue_capacity")]
    pub signal_queue_capacity: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            flush_interval_secs: default_flush_interval(),
            ignored_prefixes: default_ignored_prefixes(),
            signal_queue_capacity: default_signal_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            recent_capacity: default_recent_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_file")]
    pub file: PathBuf,
    #[serde(default)]
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: default_log_file(),
            stderr: false,
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8788".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("site-usage.db")
}

fn default_tick_interval() -> u64 {
    60
}

fn default_flush_interval() -> u64 {
    60
}

fn default_ignored_prefixes() -> Vec<String> {
    DEFAULT_IGNORED_PREFIXES
        .iter()
        .map(|prefix| prefix.to_string())
        .collect()
}

fn default_signal_queue_capacity() -> usize {
    256
}

fn default_recent_capacity() -> usize {
    50
}

fn default_log_file() -> PathBuf {
    PathBuf::from("site-usage.log")
}
