use crate::{
    error::{Result, TrackerError},
    storage::{SETTINGS, Storage},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const NOTIFICATIONS_KEY: &str = "notifications";

/// User settings. `notifications` is the only key the tracker reads; every
/// other key belongs to a collaborator and is stored as-is in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub notifications: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            notifications: true,
            extra: BTreeMap::new(),
        }
    }
}

/// Partial update. Absent fields keep their value; an `extra` entry set to
/// `null` removes that key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    #[serde(default)]
    pub notifications: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Settings {
    pub fn merge(&mut self, patch: SettingsPatch) {
        if let Some(notifications) = patch.notifications {
            self.notifications = notifications;
        }
        for (key, value) in patch.extra {
            if value.is_null() {
                self.extra.remove(&key);
            } else {
                self.extra.insert(key, value);
            }
        }
    }

    fn from_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut settings = Self::default();
        for (key, value) in entries {
            if key == NOTIFICATIONS_KEY {
                match value.as_bool() {
                    Some(enabled) => settings.notifications = enabled,
                    None => tracing::warn!(
                        value = %value,
                        "stored notifications setting is not a boolean, using default"
                    ),
                }
            } else {
                settings.extra.insert(key, value);
            }
        }
        settings
    }

    fn to_entries(&self) -> Vec<(String, Value)> {
        let mut entries = vec![(
            NOTIFICATIONS_KEY.to_string(),
            Value::Bool(self.notifications),
        )];
        entries.extend(
            self.extra
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        entries
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    storage: Storage,
}

impl SettingsStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn load(&self) -> Result<Settings> {
        let entries = self.storage.list_entries::<Value>(&SETTINGS).await?;
        Ok(Settings::from_entries(entries))
    }

    pub async fn notifications_enabled(&self) -> Result<bool> {
        let stored: Option<Value> = self.storage.get(&SETTINGS, NOTIFICATIONS_KEY).await?;
        Ok(stored
            .and_then(|value| value.as_bool())
            .unwrap_or_else(|| Settings::default().notifications))
    }

    pub async fn update(&self, patch: SettingsPatch) -> Result<Settings> {
        let removed: Vec<String> = patch
            .extra
            .iter()
            .filter(|(_, value)| value.is_null())
            .map(|(key, _)| key.clone())
            .collect();

        let mut settings = self.load().await?;
        settings.merge(patch);

        for key in removed {
            self.storage.delete(&SETTINGS, &key).await?;
        }
        for (key, value) in settings.to_entries() {
            self.storage.put(&SETTINGS, &key, &value).await?;
        }
        Ok(settings)
    }

    /// Every stored key/value pair, as exported.
    pub async fn list_raw(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self
            .storage
            .list_entries::<Value>(&SETTINGS)
            .await?
            .into_iter()
            .collect())
    }

    pub async fn put_raw(&self, key: &str, value: &Value) -> Result<()> {
        if key.trim().is_empty() {
            return Err(TrackerError::validation("setting is missing its key"));
        }
        if key == NOTIFICATIONS_KEY && !value.is_boolean() {
            return Err(TrackerError::validation(
                "`notifications` setting must be a boolean",
            ));
        }
        self.storage.put(&SETTINGS, key, value).await
    }

    pub async fn clear(&self) -> Result<u64> {
        self.storage.clear(&SETTINGS).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_storage;
    use serde_json::json;

    #[test]
    fn merge_applies_field_rules() {
        let mut settings = Settings::default();
        settings.extra.insert("theme".into(), json!("dark"));
        settings.extra.insert("weekStart".into(), json!(1));

        let patch: SettingsPatch = serde_json::from_value(json!({
            "notifications": false,
            "theme": null,
            "chartDays": 14
        }))
        .unwrap();
        settings.merge(patch);

        assert!(!settings.notifications);
        assert!(!settings.extra.contains_key("theme"));
        assert_eq!(settings.extra["weekStart"], json!(1));
        assert_eq!(settings.extra["chartDays"], json!(14));
    }

    #[test]
    fn serializes_flat() {
        let mut settings = Settings::default();
        settings.extra.insert("theme".into(), json!("light"));
        assert_eq!(
            serde_json::to_value(&settings).unwrap(),
            json!({"notifications": true, "theme": "light"})
        );
    }

    #[tokio::test]
    async fn update_persists_and_removes_keys() {
        let (_db, storage) = temp_storage().await;
        let store = SettingsStore::new(storage);
        assert!(store.notifications_enabled().await.unwrap());

        store
            .update(serde_json::from_value(json!({"notifications": false, "theme": "dark"})).unwrap())
            .await
            .unwrap();
        assert!(!store.notifications_enabled().await.unwrap());
        assert_eq!(store.load().await.unwrap().extra["theme"], json!("dark"));

        store
            .update(serde_json::from_value(json!({"theme": null})).unwrap())
            .await
            .unwrap();
        let raw = store.list_raw().await.unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[NOTIFICATIONS_KEY], json!(false));
    }

    #[tokio::test]
    async fn put_raw_validates_notifications_type() {
        let (_db, storage) = temp_storage().await;
        let store = SettingsStore::new(storage);
        let err = store
            .put_raw(NOTIFICATIONS_KEY, &json!("yes"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Validation(_)));
        store.put_raw("theme", &json!("dark")).await.unwrap();
        assert_eq!(store.clear().await.unwrap(), 1);
    }
}
