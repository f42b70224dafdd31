use crate::{
    aggregates::SiteAggregateStore,
    error::{Result, TrackerError},
    settings::SettingsStore,
    storage::{LIMITS, Storage},
    tracker::site,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};
use tokio::{sync::mpsc, task::JoinHandle};

pub const DAILY_LIMIT_MESSAGE: &str = "daily limit reached";

/// Daily budget for one site. `blocked` is set when the budget is first
/// crossed and stays set until explicitly cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteLimit {
    pub site_key: String,
    pub daily_limit_minutes: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub blocked: bool,
}

fn default_enabled() -> bool {
    true
}

impl SiteLimit {
    pub fn budget_seconds(&self) -> u64 {
        u64::from(self.daily_limit_minutes) * 60
    }

    fn validate(&self) -> Result<()> {
        if self.site_key.trim().is_empty() {
            return Err(TrackerError::validation("site limit is missing `siteKey`"));
        }
        if self.daily_limit_minutes == 0 {
            return Err(TrackerError::validation(format!(
                "daily limit for {} must be at least one minute",
                self.site_key
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct LimitStore {
    storage: Storage,
}

impl LimitStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn get(&self, site_key: &str) -> Result<Option<SiteLimit>> {
        self.storage.get(&LIMITS, site_key).await
    }

    pub async fn list_all(&self) -> Result<Vec<SiteLimit>> {
        self.storage.list_all(&LIMITS).await
    }

    /// Writes the record as given, with its site key normalized.
    pub async fn upsert(&self, limit: &SiteLimit) -> Result<SiteLimit> {
        let mut limit = limit.clone();
        limit.site_key = site::site_key(&limit.site_key).ok_or_else(|| {
            TrackerError::validation(format!("`{}` is not a site", limit.site_key))
        })?;
        limit.validate()?;
        self.storage.put_record(&LIMITS, &limit).await?;
        Ok(limit)
    }

    /// Creates or edits a budget. An existing `blocked` flag is kept.
    pub async fn set_limit(
        &self,
        site_or_url: &str,
        daily_limit_minutes: u32,
        enabled: bool,
    ) -> Result<SiteLimit> {
        let site_key = site::site_key(site_or_url)
            .ok_or_else(|| TrackerError::validation(format!("`{site_or_url}` is not a site")))?;
        let edited = SiteLimit {
            site_key: site_key.clone(),
            daily_limit_minutes,
            enabled,
            blocked: false,
        };
        edited.validate()?;

        self.storage
            .update(&LIMITS, &site_key, |current: Option<SiteLimit>| {
                Ok(SiteLimit {
                    blocked: current.is_some_and(|existing| existing.blocked),
                    ..edited
                })
            })
            .await
    }

    /// Clears the sticky `blocked` flag.
    pub async fn unblock(&self, site_key: &str) -> Result<SiteLimit> {
        self.storage
            .update(&LIMITS, site_key, |current: Option<SiteLimit>| {
                let mut limit =
                    current.ok_or_else(|| TrackerError::not_found("site limit", site_key))?;
                limit.blocked = false;
                Ok(limit)
            })
            .await
    }

    /// Sets `blocked` on an enabled limit. Returns whether this call made
    /// the transition; only one of several racing callers ever does.
    async fn block(&self, site_key: &str) -> Result<bool> {
        let mut transitioned = false;
        let outcome = self
            .storage
            .update(&LIMITS, site_key, |current: Option<SiteLimit>| {
                let mut limit =
                    current.ok_or_else(|| TrackerError::not_found("site limit", site_key))?;
                if limit.enabled && !limit.blocked {
                    limit.blocked = true;
                    transitioned = true;
                }
                Ok(limit)
            })
            .await;
        match outcome {
            Ok(_) => Ok(transitioned),
            // Removed since it was read.
            Err(TrackerError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn delete(&self, site_key: &str) -> Result<bool> {
        self.storage.delete(&LIMITS, site_key).await
    }

    pub async fn clear(&self) -> Result<u64> {
        self.storage.clear(&LIMITS).await
    }
}

/// Intent for the presentation layer to show a user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitNotification {
    pub site_key: String,
    pub message: String,
}

impl LimitNotification {
    pub fn daily_limit_reached(site_key: &str) -> Self {
        Self {
            site_key: site_key.to_string(),
            message: DAILY_LIMIT_MESSAGE.to_string(),
        }
    }
}

pub type NotificationReceiver = mpsc::Receiver<LimitNotification>;

/// Non-blocking sender side of the notification channel.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<LimitNotification>,
}

impl Notifier {
    pub fn channel(capacity: usize) -> (Self, NotificationReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns whether the intent was queued. Never waits for the consumer.
    pub fn notify(&self, notification: LimitNotification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "failed to enqueue limit notification");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitCheck {
    NoLimit,
    Disabled,
    UnderLimit,
    /// The day's usage just reached the budget.
    Crossed { notified: bool },
    AlreadyBlocked,
}

#[derive(Clone)]
pub struct LimitMonitor {
    limits: LimitStore,
    aggregates: SiteAggregateStore,
    settings: SettingsStore,
    notifier: Notifier,
}

impl LimitMonitor {
    pub fn new(
        limits: LimitStore,
        aggregates: SiteAggregateStore,
        settings: SettingsStore,
        notifier: Notifier,
    ) -> Self {
        Self {
            limits,
            aggregates,
            settings,
            notifier,
        }
    }

    /// Checks the site's usage on `date` against its budget. Fires at most
    /// one notification per crossing: once `blocked` is set, later checks
    /// stay quiet until the flag is cleared.
    pub async fn evaluate(&self, site_key: &str, date: NaiveDate) -> Result<LimitCheck> {
        let Some(limit) = self.limits.get(site_key).await? else {
            return Ok(LimitCheck::NoLimit);
        };
        if !limit.enabled {
            return Ok(LimitCheck::Disabled);
        }

        let used = self
            .aggregates
            .get_by_site(site_key)
            .await?
            .map(|aggregate| aggregate.bucket(date).seconds)
            .unwrap_or(0);
        if used < limit.budget_seconds() {
            return Ok(LimitCheck::UnderLimit);
        }
        if limit.blocked {
            return Ok(LimitCheck::AlreadyBlocked);
        }

        if !self.limits.block(site_key).await? {
            return Ok(LimitCheck::AlreadyBlocked);
        }

        let notified = if self.settings.notifications_enabled().await? {
            self.notifier
                .notify(LimitNotification::daily_limit_reached(site_key))
        } else {
            false
        };

        tracing::info!(
            site = site_key,
            date = %date,
            seconds = used,
            budget = limit.budget_seconds(),
            notified,
            "daily limit reached"
        );
        Ok(LimitCheck::Crossed { notified })
    }
}

/// Most recent notifications, newest first.
#[derive(Clone)]
pub struct RecentNotifications {
    capacity: usize,
    inner: Arc<Mutex<VecDeque<LimitNotification>>>,
}

impl RecentNotifications {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn push(&self, notification: LimitNotification) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.len() == self.capacity {
            guard.pop_back();
        }
        guard.push_front(notification);
    }

    pub fn snapshot(&self, limit: Option<usize>) -> Vec<LimitNotification> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let take = limit.unwrap_or(self.capacity).min(guard.len());
        guard.iter().take(take).cloned().collect()
    }
}

pub struct NotificationSinkHandle {
    join: JoinHandle<()>,
    recent: RecentNotifications,
}

impl NotificationSinkHandle {
    /// Waits until every queued notification has been recorded. Resolves
    /// once all [`Notifier`] clones are dropped.
    pub async fn shutdown(self) {
        if let Err(err) = self.join.await {
            tracing::warn!(error = %err, "notification sink task failed");
        }
    }

    pub fn recent(&self) -> RecentNotifications {
        self.recent.clone()
    }
}

/// Spawns the consumer that records notification intents for the
/// presentation layer.
pub fn spawn_notification_sink(
    queue_capacity: usize,
    recent_capacity: usize,
) -> (NotificationSinkHandle, Notifier) {
    let (notifier, mut rx) = Notifier::channel(queue_capacity);
    let recent = RecentNotifications::new(recent_capacity);
    let recent_clone = recent.clone();

    let join = tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            tracing::info!(
                site = %notification.site_key,
                message = %notification.message,
                "notification raised"
            );
            recent_clone.push(notification);
        }
    });

    (NotificationSinkHandle { join, recent }, notifier)
}
