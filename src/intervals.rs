use crate::{
    error::{Result, TrackerError},
    storage::{INTERVALS, Storage},
};
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A closed stretch of time spent on one site. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeInterval {
    pub id: String,
    pub site_key: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: u64,
    /// Local calendar day of `started_at`.
    pub date: NaiveDate,
}

impl TimeInterval {
    /// Builds an interval for `[started_at, ended_at)`, or `None` when it
    /// lasted less than one whole second.
    pub fn closed(
        site_key: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Option<Self> {
        let seconds = whole_seconds(started_at, ended_at);
        if seconds < 1 {
            return None;
        }

        Some(Self {
            id: uuid::Uuid::now_v7().to_string(),
            site_key: site_key.to_string(),
            started_at,
            ended_at,
            duration_seconds: seconds as u64,
            date: local_date(started_at),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(TrackerError::validation("interval is missing `id`"));
        }
        if self.site_key.trim().is_empty() {
            return Err(TrackerError::validation(format!(
                "interval {} is missing `siteKey`",
                self.id
            )));
        }
        if self.ended_at < self.started_at {
            return Err(TrackerError::validation(format!(
                "interval {} ends before it starts",
                self.id
            )));
        }
        Ok(())
    }
}

/// Floor of the elapsed time in seconds; negative when the clock went
/// backwards.
pub fn whole_seconds(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> i64 {
    (ended_at - started_at).num_milliseconds().div_euclid(1000)
}

pub fn local_date(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&Local).date_naive()
}

/// Append-only ledger of closed intervals, indexed by date and site.
#[derive(Clone)]
pub struct IntervalStore {
    storage: Storage,
}

impl IntervalStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Adds `interval` to the ledger. Returns `false` when the exact same
    /// interval is already recorded; a different interval under a taken id
    /// is rejected, since recorded intervals never change.
    pub async fn append(&self, interval: &TimeInterval) -> Result<bool> {
        interval.validate()?;
        if self.storage.insert_record(&INTERVALS, interval).await? {
            return Ok(true);
        }

        let existing: Option<TimeInterval> = self.storage.get(&INTERVALS, &interval.id).await?;
        if existing.as_ref() == Some(interval) {
            return Ok(false);
        }
        Err(TrackerError::validation(format!(
            "interval {} is already recorded with different contents",
            interval.id
        )))
    }

    pub async fn list_by_date(&self, date: NaiveDate) -> Result<Vec<TimeInterval>> {
        self.storage
            .scan_by_index(&INTERVALS, "date", &date.to_string())
            .await
    }

    pub async fn list_by_site(&self, site_key: &str) -> Result<Vec<TimeInterval>> {
        self.storage
            .scan_by_index(&INTERVALS, "siteKey", site_key)
            .await
    }

    pub async fn list_all(&self) -> Result<Vec<TimeInterval>> {
        self.storage.list_all(&INTERVALS).await
    }

    /// Site keys present in the ledger, in order of first appearance.
    pub async fn site_keys(&self) -> Result<Vec<String>> {
        self.storage.index_values(&INTERVALS, "siteKey").await
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.storage.delete(&INTERVALS, id).await
    }

    /// Purges every interval recorded for `site_key`.
    pub async fn delete_by_site(&self, site_key: &str) -> Result<u64> {
        self.storage
            .delete_by_index(&INTERVALS, "siteKey", site_key)
            .await
    }

    pub async fn clear(&self) -> Result<u64> {
        self.storage.clear(&INTERVALS).await
    }
}
