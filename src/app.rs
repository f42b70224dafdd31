use crate::{
    aggregates::SiteAggregateStore,
    cli::Cli,
    config::AppConfig,
    intervals::IntervalStore,
    limits::{LimitMonitor, LimitStore, spawn_notification_sink},
    server::{self, ApiState},
    settings::SettingsStore,
    storage::Storage,
    tracker::{self, Clock, SessionTracker, SystemClock, site::IgnoreList},
    transfer::{ImportDocument, Transfer},
};
use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use std::{fs, path::Path, sync::Arc, time::Duration};

/// Notification intents are rare; a small queue is plenty.
const NOTIFICATION_QUEUE_CAPACITY: usize = 64;

/// High-level application orchestrator.
pub struct App {
    config: Arc<AppConfig>,
}

struct Stores {
    intervals: IntervalStore,
    aggregates: SiteAggregateStore,
    limits: LimitStore,
    settings: SettingsStore,
}

impl Stores {
    fn new(storage: Storage) -> Self {
        let intervals = IntervalStore::new(storage.clone());
        Self {
            aggregates: SiteAggregateStore::new(storage.clone(), intervals.clone()),
            limits: LimitStore::new(storage.clone()),
            settings: SettingsStore::new(storage),
            intervals,
        }
    }

    fn transfer(&self) -> Transfer {
        Transfer::new(
            self.intervals.clone(),
            self.aggregates.clone(),
            self.limits.clone(),
            self.settings.clone(),
        )
    }
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub async fn run(self, cli: Cli) -> Result<()> {
        let storage = Storage::connect(&self.config.storage.database_path).await?;
        storage.ensure_schema().await?;
        tracing::info!(path = %storage.path().display(), "storage ready");
        let stores = Stores::new(storage);

        if cli.recalculate {
            let rebuilt = stores.aggregates.recalculate_all().await?;
            tracing::info!(sites = rebuilt, "aggregates rebuilt from intervals");
        }

        if let Some(path) = cli.export.as_deref() {
            return export_to(&stores.transfer(), path).await;
        }
        if let Some(path) = cli.import.as_deref() {
            return import_from(&stores.transfer(), path).await;
        }

        self.serve(stores).await
    }

    async fn serve(&self, stores: Stores) -> Result<()> {
        let tracking = &self.config.tracking;
        let (sink_handle, notifier) = spawn_notification_sink(
            NOTIFICATION_QUEUE_CAPACITY,
            self.config.notifications.recent_capacity,
        );
        let monitor = LimitMonitor::new(
            stores.limits.clone(),
            stores.aggregates.clone(),
            stores.settings.clone(),
            notifier,
        );
        let tracker = SessionTracker::new(
            stores.aggregates.clone(),
            monitor,
            IgnoreList::new(tracking.ignored_prefixes.iter().cloned()),
            ChronoDuration::seconds(tracking.flush_interval_secs.max(1) as i64),
        );

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (tracker_handle, signals) = tracker::spawn(
            tracker,
            clock.clone(),
            Duration::from_secs(tracking.tick_interval_secs),
            tracking.signal_queue_capacity,
        );

        let state = ApiState {
            signals,
            clock,
            transfer: stores.transfer(),
            intervals: stores.intervals,
            aggregates: stores.aggregates,
            limits: stores.limits,
            settings: stores.settings,
            notifications: sink_handle.recent(),
        };
        let server_handle = server::spawn(&self.config.server.listen_addr, state).await?;

        tokio::signal::ctrl_c()
            .await
            .with_context(|| "failed to listen for ctrl-c")?;
        tracing::info!("shutting down");

        // The server owns the last signal senders; stop it before the tracker
        // so nothing new is queued behind the final flush.
        let server_result = server_handle.shutdown().await;
        tracker_handle.shutdown().await?;
        sink_handle.shutdown().await;
        server_result
    }
}

async fn export_to(transfer: &Transfer, path: &Path) -> Result<()> {
    let document = transfer.export().await?;
    let text = serde_json::to_string_pretty(&document)?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        sites = document.tabs.len(),
        intervals = document.time_intervals.len(),
        "export written"
    );
    println!("exported to {}", path.display());
    Ok(())
}

async fn import_from(transfer: &Transfer, path: &Path) -> Result<()> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let document: ImportDocument = serde_json::from_str(&text)
        .with_context(|| format!("{} is not an export document", path.display()))?;
    let report = transfer.import(document).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
