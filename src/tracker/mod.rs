//! Session tracking: turns activation, focus, tick and removal signals into
//! closed intervals and rollup merges.
//!
//! The tracker owns the only in-memory session and is driven by a single
//! task, so each transition (including the storage writes of its flush)
//! finishes before the next signal is looked at.

pub mod site;

use crate::{
    aggregates::SiteAggregateStore,
    error::Result,
    intervals::TimeInterval,
    limits::{LimitCheck, LimitMonitor},
};
use anyhow::anyhow;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use site::IgnoreList;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

/// Browser-side identifier of the tab backing a session.
pub type TargetId = u64;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub site_key: String,
    pub target: Option<TargetId>,
    pub started_at: DateTime<Utc>,
    pub last_flush_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TrackerState {
    #[default]
    Idle,
    Active(Session),
}

#[derive(Debug, Clone)]
pub enum Signal {
    /// A tab or window became active, finished loading, or gained focus.
    Activated {
        site: String,
        target: Option<TargetId>,
        at: DateTime<Utc>,
    },
    FocusLost {
        at: DateTime<Utc>,
    },
    Tick {
        at: DateTime<Utc>,
    },
    TargetRemoved {
        target: TargetId,
        at: DateTime<Utc>,
    },
}

pub type SignalSender = mpsc::Sender<Signal>;

pub struct SessionTracker {
    state: TrackerState,
    aggregates: SiteAggregateStore,
    monitor: LimitMonitor,
    ignore: IgnoreList,
    flush_interval: ChronoDuration,
}

impl SessionTracker {
    pub fn new(
        aggregates: SiteAggregateStore,
        monitor: LimitMonitor,
        ignore: IgnoreList,
        flush_interval: ChronoDuration,
    ) -> Self {
        Self {
            state: TrackerState::Idle,
            aggregates,
            monitor,
            ignore,
            flush_interval,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    pub async fn handle(&mut self, signal: Signal) {
        match signal {
            Signal::Activated { site, target, at } => {
                self.on_site_activated(&site, target, at).await
            }
            Signal::FocusLost { at } => self.on_focus_lost(at).await,
            Signal::Tick { at } => {
                let flush_interval = self.flush_interval;
                self.on_periodic_tick(at, flush_interval).await
            }
            Signal::TargetRemoved { target, at } => {
                self.on_tracked_target_removed(target, at).await
            }
        }
    }

    /// Closes any running session and starts one for the activated site,
    /// unless the site is internal or unparseable, in which case the
    /// tracker goes idle.
    pub async fn on_site_activated(
        &mut self,
        site_or_url: &str,
        target: Option<TargetId>,
        now: DateTime<Utc>,
    ) {
        self.close_active(now).await;

        if self.ignore.is_ignored(site_or_url) {
            tracing::trace!(site = site_or_url, "ignored page activated");
            return;
        }
        let Some(site_key) = site::site_key(site_or_url) else {
            tracing::debug!(site = site_or_url, "activation without a usable host");
            return;
        };

        self.state = TrackerState::Active(Session {
            site_key,
            target,
            started_at: now,
            last_flush_at: now,
        });
    }

    pub async fn on_focus_lost(&mut self, now: DateTime<Utc>) {
        self.close_active(now).await;
    }

    /// Flushes a partial interval once `flush_interval` has passed since
    /// the last flush and keeps the session running from `now`.
    pub async fn on_periodic_tick(&mut self, now: DateTime<Utc>, flush_interval: ChronoDuration) {
        let TrackerState::Active(session) = &mut self.state else {
            return;
        };
        if now - session.last_flush_at < flush_interval {
            return;
        }

        let site_key = session.site_key.clone();
        let started_at = session.started_at;
        session.started_at = now;
        session.last_flush_at = now;

        self.flush(&site_key, started_at, now).await;
    }

    pub async fn on_tracked_target_removed(&mut self, target: TargetId, now: DateTime<Utc>) {
        let backs_session = matches!(
            &self.state,
            TrackerState::Active(session) if session.target == Some(target)
        );
        if backs_session {
            self.close_active(now).await;
        }
    }

    async fn close_active(&mut self, now: DateTime<Utc>) {
        if let TrackerState::Active(session) = std::mem::take(&mut self.state) {
            self.flush(&session.site_key, session.started_at, now).await;
        }
    }

    /// Persists `[started_at, ended_at)` for the site. Failures are logged
    /// and the interval is lost; the caller's transition goes ahead.
    async fn flush(
        &self,
        site_key: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Option<TimeInterval> {
        let Some(interval) = TimeInterval::closed(site_key, started_at, ended_at) else {
            tracing::trace!(site = site_key, "sub-second session discarded");
            return None;
        };

        match self.persist(&interval).await {
            Ok(check) => {
                tracing::debug!(
                    site = site_key,
                    date = %interval.date,
                    seconds = interval.duration_seconds,
                    interval_id = %interval.id,
                    limit = ?check,
                    "interval flushed"
                );
                Some(interval)
            }
            Err(err) => {
                tracing::error!(
                    error = %err,
                    site = site_key,
                    seconds = interval.duration_seconds,
                    interval_id = %interval.id,
                    "failed to persist interval, tracking continues without it"
                );
                None
            }
        }
    }

    async fn persist(&self, interval: &TimeInterval) -> Result<LimitCheck> {
        let aggregate = self.aggregates.record(interval).await?;
        tracing::trace!(
            site = aggregate.site_key(),
            total_seconds = aggregate.total_seconds(),
            total_sessions = aggregate.total_sessions(),
            "aggregate merged"
        );
        self.monitor.evaluate(&interval.site_key, interval.date).await
    }
}

pub struct TrackerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl TrackerHandle {
    /// Stops the loop after the signals already queued, then closes the
    /// running session.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.join.await.map_err(|err| anyhow!(err))
    }
}

/// Runs `tracker` as the single owner of the session. Signals arrive on the
/// returned sender; ticks come from an internal interval stamped by `clock`.
pub fn spawn(
    mut tracker: SessionTracker,
    clock: Arc<dyn Clock>,
    tick_every: Duration,
    queue_capacity: usize,
) -> (TrackerHandle, SignalSender) {
    let (tx, mut rx) = mpsc::channel(queue_capacity.max(1));
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let tick_every = tick_every.max(Duration::from_secs(1));

    let join = tokio::spawn(async move {
        let mut ticker = time::interval_at(time::Instant::now() + tick_every, tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => break,
                signal = rx.recv() => match signal {
                    Some(signal) => tracker.handle(signal).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    tracker.handle(Signal::Tick { at: clock.now() }).await;
                }
            }
        }

        rx.close();
        while let Ok(signal) = rx.try_recv() {
            tracker.handle(signal).await;
        }
        tracker.on_focus_lost(clock.now()).await;
        tracing::debug!("session tracker stopped");
    });

    (
        TrackerHandle {
            shutdown: Some(shutdown_tx),
            join,
        },
        tx,
    )
}
