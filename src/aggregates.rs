use crate::{
    error::{Result, TrackerError},
    intervals::{IntervalStore, TimeInterval},
    storage::{AGGREGATES, Storage},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};
use tokio::sync::OwnedMutexGuard;

type KeyLocks = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyBucket {
    pub seconds: u64,
    pub sessions: u64,
}

/// Lifetime and per-day rollup for one site.
///
/// Totals always equal the sum of the buckets: the fields are private and
/// [`SiteAggregate::apply`] is the only way to change them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteAggregate {
    site_key: String,
    total_seconds: u64,
    total_sessions: u64,
    daily_buckets: BTreeMap<NaiveDate, DailyBucket>,
}

impl SiteAggregate {
    pub fn new(site_key: impl Into<String>) -> Self {
        Self {
            site_key: site_key.into(),
            total_seconds: 0,
            total_sessions: 0,
            daily_buckets: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, date: NaiveDate, seconds: u64, sessions: u64) {
        self.total_seconds += seconds;
        self.total_sessions += sessions;
        let bucket = self.daily_buckets.entry(date).or_default();
        bucket.seconds += seconds;
        bucket.sessions += sessions;
    }

    pub fn site_key(&self) -> &str {
        &self.site_key
    }

    pub fn total_seconds(&self) -> u64 {
        self.total_seconds
    }

    pub fn total_sessions(&self) -> u64 {
        self.total_sessions
    }

    /// The bucket for `date`, zeroed when nothing was recorded that day.
    pub fn bucket(&self, date: NaiveDate) -> DailyBucket {
        self.daily_buckets.get(&date).copied().unwrap_or_default()
    }

    pub fn is_consistent(&self) -> bool {
        let (seconds, sessions) = self
            .daily_buckets
            .values()
            .fold((0u64, 0u64), |(seconds, sessions), bucket| {
                (seconds + bucket.seconds, sessions + bucket.sessions)
            });
        seconds == self.total_seconds && sessions == self.total_sessions
    }
}

/// One rollup record per site key. Merges for the same key are applied one
/// at a time in arrival order; different keys proceed independently.
#[derive(Clone)]
pub struct SiteAggregateStore {
    storage: Storage,
    intervals: IntervalStore,
    key_locks: KeyLocks,
}

/// What [`SiteAggregateStore::remove_site`] deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SitePurge {
    pub aggregate_removed: bool,
    pub intervals_removed: u64,
}

impl SiteAggregateStore {
    pub fn new(storage: Storage, intervals: IntervalStore) -> Self {
        Self {
            storage,
            intervals,
            key_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Folds `seconds` and `sessions` into the site's lifetime totals and
    /// the bucket for `date`, creating the aggregate on first use.
    pub async fn merge(
        &self,
        site_key: &str,
        date: NaiveDate,
        seconds: u64,
        sessions: u64,
    ) -> Result<SiteAggregate> {
        let _guard = self.lock_key(site_key).await;
        self.merge_locked(site_key, date, seconds, sessions).await
    }

    /// Appends a freshly closed interval to the ledger and folds it into
    /// the site's aggregate as one step, so a concurrent `remove_site` or
    /// `recalculate` sees either both writes or neither.
    pub async fn record(&self, interval: &TimeInterval) -> Result<SiteAggregate> {
        let _guard = self.lock_key(&interval.site_key).await;
        if !self.intervals.append(interval).await? {
            // Already recorded, and therefore already merged.
            return Ok(self
                .get_by_site(&interval.site_key)
                .await?
                .unwrap_or_else(|| SiteAggregate::new(interval.site_key.as_str())));
        }
        self.merge_locked(&interval.site_key, interval.date, interval.duration_seconds, 1)
            .await
    }

    async fn merge_locked(
        &self,
        site_key: &str,
        date: NaiveDate,
        seconds: u64,
        sessions: u64,
    ) -> Result<SiteAggregate> {
        self.storage
            .update(&AGGREGATES, site_key, |current: Option<SiteAggregate>| {
                let mut aggregate = current.unwrap_or_else(|| SiteAggregate::new(site_key));
                aggregate.apply(date, seconds, sessions);
                Ok(aggregate)
            })
            .await
    }

    pub async fn get_by_site(&self, site_key: &str) -> Result<Option<SiteAggregate>> {
        self.storage.get(&AGGREGATES, site_key).await
    }

    pub async fn require_by_site(&self, site_key: &str) -> Result<SiteAggregate> {
        self.get_by_site(site_key)
            .await?
            .ok_or_else(|| TrackerError::not_found("site aggregate", site_key))
    }

    pub async fn list_all(&self) -> Result<Vec<SiteAggregate>> {
        self.storage.list_all(&AGGREGATES).await
    }

    pub async fn delete(&self, site_key: &str) -> Result<bool> {
        let _guard = self.lock_key(site_key).await;
        self.storage.delete(&AGGREGATES, site_key).await
    }

    /// Drops the site's aggregate and purges its intervals while holding
    /// the site's lock, so no interval recorded in between survives alone.
    pub async fn remove_site(&self, site_key: &str) -> Result<SitePurge> {
        let _guard = self.lock_key(site_key).await;
        let aggregate_removed = self.storage.delete(&AGGREGATES, site_key).await?;
        let intervals_removed = self.intervals.delete_by_site(site_key).await?;
        Ok(SitePurge {
            aggregate_removed,
            intervals_removed,
        })
    }

    pub async fn clear(&self) -> Result<u64> {
        self.storage.clear(&AGGREGATES).await
    }

    /// Writes an aggregate produced elsewhere (an import) verbatim, as long
    /// as its totals agree with its buckets.
    pub async fn restore(&self, aggregate: &SiteAggregate) -> Result<()> {
        if aggregate.site_key.trim().is_empty() {
            return Err(TrackerError::validation("aggregate is missing `siteKey`"));
        }
        if !aggregate.is_consistent() {
            return Err(TrackerError::validation(format!(
                "aggregate {} totals do not match its daily buckets",
                aggregate.site_key
            )));
        }

        let _guard = self.lock_key(&aggregate.site_key).await;
        self.storage
            .put(&AGGREGATES, &aggregate.site_key, aggregate)
            .await
    }

    /// Discards the stored aggregate and rebuilds it from the interval
    /// ledger. A site with no intervals ends up without an aggregate.
    pub async fn recalculate(&self, site_key: &str) -> Result<Option<SiteAggregate>> {
        let _guard = self.lock_key(site_key).await;

        let intervals = self.intervals.list_by_site(site_key).await?;
        if intervals.is_empty() {
            self.storage.delete(&AGGREGATES, site_key).await?;
            tracing::debug!(site = site_key, "no intervals left, aggregate dropped");
            return Ok(None);
        }

        let mut aggregate = SiteAggregate::new(site_key);
        for interval in &intervals {
            aggregate.apply(interval.date, interval.duration_seconds, 1);
        }
        self.storage
            .put(&AGGREGATES, site_key, &aggregate)
            .await?;

        tracing::debug!(
            site = site_key,
            intervals = intervals.len(),
            seconds = aggregate.total_seconds,
            "aggregate recalculated"
        );
        Ok(Some(aggregate))
    }

    /// Recalculates every site known to the ledger or the aggregate table.
    pub async fn recalculate_all(&self) -> Result<usize> {
        let mut site_keys = self.intervals.site_keys().await?;
        for aggregate in self.list_all().await? {
            if !site_keys.contains(&aggregate.site_key) {
                site_keys.push(aggregate.site_key);
            }
        }

        for site_key in &site_keys {
            self.recalculate(site_key).await?;
        }
        Ok(site_keys.len())
    }

    /// Waits for the site's turn. Waiters are served in arrival order.
    async fn lock_key(&self, site_key: &str) -> KeyGuard {
        let lock = {
            let mut locks = lock_map(&self.key_locks);
            locks
                .entry(site_key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        KeyGuard {
            guard: Some(lock.lock_owned().await),
            locks: self.key_locks.clone(),
            site_key: site_key.to_string(),
        }
    }
}

fn lock_map(
    locks: &KeyLocks,
) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
    match locks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Holds one site's lock. On release the map entry is dropped unless
/// another caller is already waiting on it.
struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: KeyLocks,
    site_key: String,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock_map(&self.locks);
        let idle = locks
            .get(&self.site_key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.site_key);
        }
    }
}
