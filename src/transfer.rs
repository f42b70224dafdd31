use crate::{
    aggregates::{SiteAggregate, SiteAggregateStore},
    error::{Result, TrackerError},
    intervals::{IntervalStore, TimeInterval},
    limits::{LimitStore, SiteLimit},
    settings::SettingsStore,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::BTreeMap;

/// Full dump of the four collections. Field names are part of the file
/// format shared with other tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub tabs: Vec<SiteAggregate>,
    pub time_intervals: Vec<TimeInterval>,
    pub site_limits: Vec<SiteLimit>,
    pub settings: BTreeMap<String, Value>,
}

/// Import input. A missing collection leaves the stored one untouched;
/// records stay raw so one bad entry cannot fail the whole document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportDocument {
    pub tabs: Option<Vec<Value>>,
    pub time_intervals: Option<Vec<Value>>,
    pub site_limits: Option<Vec<Value>>,
    pub settings: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub tabs: usize,
    pub time_intervals: usize,
    pub site_limits: usize,
    pub settings: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearReport {
    pub tabs: u64,
    pub time_intervals: u64,
    pub site_limits: u64,
    pub settings: u64,
}

#[derive(Clone)]
pub struct Transfer {
    intervals: IntervalStore,
    aggregates: SiteAggregateStore,
    limits: LimitStore,
    settings: SettingsStore,
}

impl Transfer {
    pub fn new(
        intervals: IntervalStore,
        aggregates: SiteAggregateStore,
        limits: LimitStore,
        settings: SettingsStore,
    ) -> Self {
        Self {
            intervals,
            aggregates,
            limits,
            settings,
        }
    }

    pub async fn export(&self) -> Result<ExportDocument> {
        Ok(ExportDocument {
            tabs: self.aggregates.list_all().await?,
            time_intervals: self.intervals.list_all().await?,
            site_limits: self.limits.list_all().await?,
            settings: self.settings.list_raw().await?,
        })
    }

    /// Upserts every valid record. Invalid records are skipped and counted;
    /// a storage failure aborts the import. Intervals are never rewritten:
    /// one already in the ledger is left alone, and a different interval
    /// reusing its id counts as skipped.
    pub async fn import(&self, document: ImportDocument) -> Result<ImportReport> {
        let mut report = ImportReport::default();

        if let Some(records) = document.time_intervals {
            for record in records {
                let outcome = match decode::<TimeInterval>("timeIntervals", record) {
                    Ok(interval) => self.intervals.append(&interval).await,
                    Err(err) => Err(err),
                };
                tally("timeIntervals", outcome, &mut report.time_intervals, &mut report.skipped)?;
            }
        }

        if let Some(records) = document.tabs {
            for record in records {
                let outcome = match decode::<SiteAggregate>("tabs", record) {
                    Ok(aggregate) => self.aggregates.restore(&aggregate).await.map(|()| true),
                    Err(err) => Err(err),
                };
                tally("tabs", outcome, &mut report.tabs, &mut report.skipped)?;
            }
        }

        if let Some(records) = document.site_limits {
            for record in records {
                let outcome = match decode::<SiteLimit>("siteLimits", record) {
                    Ok(limit) => self.limits.upsert(&limit).await.map(|_| true),
                    Err(err) => Err(err),
                };
                tally("siteLimits", outcome, &mut report.site_limits, &mut report.skipped)?;
            }
        }

        if let Some(entries) = document.settings {
            for (key, value) in entries {
                let outcome = self.settings.put_raw(&key, &value).await.map(|()| true);
                tally("settings", outcome, &mut report.settings, &mut report.skipped)?;
            }
        }

        tracing::info!(
            tabs = report.tabs,
            intervals = report.time_intervals,
            limits = report.site_limits,
            settings = report.settings,
            skipped = report.skipped,
            "import finished"
        );
        Ok(report)
    }

    /// Empties every collection. Settings fall back to their defaults.
    pub async fn clear_all(&self) -> Result<ClearReport> {
        let report = ClearReport {
            time_intervals: self.intervals.clear().await?,
            tabs: self.aggregates.clear().await?,
            site_limits: self.limits.clear().await?,
            settings: self.settings.clear().await?,
        };
        tracing::info!(
            tabs = report.tabs,
            intervals = report.time_intervals,
            limits = report.site_limits,
            settings = report.settings,
            "all data cleared"
        );
        Ok(report)
    }
}

fn decode<T: DeserializeOwned>(collection: &str, record: Value) -> Result<T> {
    serde_json::from_value(record)
        .map_err(|err| TrackerError::validation(format!("{collection}: {err}")))
}

/// `Ok(false)` marks a record that was already stored as is.
fn tally(
    collection: &str,
    outcome: Result<bool>,
    imported: &mut usize,
    skipped: &mut usize,
) -> Result<()> {
    match outcome {
        Ok(true) => *imported += 1,
        Ok(false) => tracing::debug!(collection, "import record already present"),
        Err(TrackerError::Validation(reason)) => {
            tracing::warn!(collection, reason = %reason, "skipping invalid import record");
            *skipped += 1;
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_storage;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_740_830_400 + secs, 0).unwrap()
    }

    async fn transfer() -> (NamedTempFile, Transfer) {
        let (db, storage) = temp_storage().await;
        let intervals = IntervalStore::new(storage.clone());
        let aggregates = SiteAggregateStore::new(storage.clone(), intervals.clone());
        let transfer = Transfer::new(
            intervals,
            aggregates,
            LimitStore::new(storage.clone()),
            SettingsStore::new(storage),
        );
        (db, transfer)
    }

    async fn seed(transfer: &Transfer) {
        for (site, start, end) in [("a.com", 0, 125), ("b.com", 200, 260), ("a.com", 90_000, 90_030)] {
            let interval = TimeInterval::closed(site, at(start), at(end)).unwrap();
            transfer.intervals.append(&interval).await.unwrap();
            transfer
                .aggregates
                .merge(site, interval.date, interval.duration_seconds, 1)
                .await
                .unwrap();
        }
        transfer.limits.set_limit("a.com", 45, true).await.unwrap();
        transfer
            .settings
            .put_raw("theme", &json!("dark"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn export_then_import_reproduces_the_store() {
        let (_src_db, source) = transfer().await;
        seed(&source).await;
        let exported = source.export().await.unwrap();
        let text = serde_json::to_string(&exported).unwrap();

        let (_dst_db, target) = transfer().await;
        let document: ImportDocument = serde_json::from_str(&text).unwrap();
        let report = target.import(document).await.unwrap();
        assert_eq!(
            report,
            ImportReport {
                tabs: 2,
                time_intervals: 3,
                site_limits: 1,
                settings: 1,
                skipped: 0,
            }
        );

        assert_eq!(target.export().await.unwrap(), exported);
    }

    #[tokio::test]
    async fn reimport_leaves_recorded_intervals_alone() {
        let (_db, target) = transfer().await;
        seed(&target).await;
        let exported = target.export().await.unwrap();
        let text = serde_json::to_string(&exported).unwrap();

        let again: ImportDocument = serde_json::from_str(&text).unwrap();
        let report = target.import(again).await.unwrap();
        assert_eq!(report.time_intervals, 0);
        assert_eq!(report.skipped, 0);

        let mut altered = serde_json::to_value(&exported.time_intervals[0]).unwrap();
        altered["siteKey"] = json!("other.com");
        altered["durationSeconds"] = json!(500);
        let document = ImportDocument {
            time_intervals: Some(vec![altered]),
            ..Default::default()
        };
        let report = target.import(document).await.unwrap();
        assert_eq!(report.time_intervals, 0);
        assert_eq!(report.skipped, 1);

        assert_eq!(target.export().await.unwrap(), exported);
        let rebuilt = target.aggregates.recalculate("a.com").await.unwrap().unwrap();
        assert_eq!(&rebuilt, exported.tabs.iter().find(|tab| tab.site_key() == "a.com").unwrap());
    }

    #[tokio::test]
    async fn clear_all_empties_every_collection() {
        let (_db, transfer) = transfer().await;
        seed(&transfer).await;

        let report = transfer.clear_all().await.unwrap();
        assert_eq!(
            report,
            ClearReport {
                tabs: 2,
                time_intervals: 3,
                site_limits: 1,
                settings: 1,
            }
        );

        let after = transfer.export().await.unwrap();
        assert!(after.tabs.is_empty());
        assert!(after.time_intervals.is_empty());
        assert!(after.site_limits.is_empty());
        assert!(after.settings.is_empty());
        assert!(transfer.settings.notifications_enabled().await.unwrap());
    }

    #[test]
    fn export_uses_shared_field_names() {
        let document = ExportDocument {
            tabs: Vec::new(),
            time_intervals: Vec::new(),
            site_limits: Vec::new(),
            settings: BTreeMap::new(),
        };
        let value = serde_json::to_value(&document).unwrap();
        let mut keys: Vec<&str> = value
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, ["settings", "siteLimits", "tabs", "timeIntervals"]);
    }

    #[tokio::test]
    async fn import_skips_invalid_records_and_missing_collections() {
        let (_db, target) = transfer().await;
        seed(&target).await;
        let before = target.export().await.unwrap();

        let document: ImportDocument = serde_json::from_value(json!({
            "timeIntervals": [
                {
                    "id": "imported-1",
                    "siteKey": "c.com",
                    "startedAt": 1_740_830_400_000i64,
                    "endedAt": 1_740_830_410_000i64,
                    "durationSeconds": 10,
                    "date": "2025-03-01"
                },
                { "id": "no-start", "siteKey": "c.com", "date": "2025-03-01" },
                {
                    "id": "",
                    "siteKey": "c.com",
                    "startedAt": 1_740_830_400_000i64,
                    "endedAt": 1_740_830_410_000i64,
                    "durationSeconds": 10,
                    "date": "2025-03-01"
                }
            ],
            "tabs": [
                {
                    "siteKey": "c.com",
                    "totalSeconds": 11,
                    "totalSessions": 1,
                    "dailyBuckets": { "2025-03-01": { "seconds": 10, "sessions": 1 } }
                }
            ],
            "settings": { "notifications": "loud", "chartDays": 7 }
        }))
        .unwrap();

        let report = target.import(document).await.unwrap();
        assert_eq!(report.time_intervals, 1);
        assert_eq!(report.tabs, 0);
        assert_eq!(report.settings, 1);
        assert_eq!(report.site_limits, 0);
        assert_eq!(report.skipped, 4);

        let after = target.export().await.unwrap();
        assert_eq!(after.tabs, before.tabs);
        assert_eq!(after.site_limits, before.site_limits);
        assert_eq!(after.time_intervals.len(), before.time_intervals.len() + 1);
        assert_eq!(
            after.time_intervals.last().unwrap().date,
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
        );
        assert_eq!(after.settings["chartDays"], json!(7));
    }
}
