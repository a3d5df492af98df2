//! Persisted record of which datafile keys have background sync enabled.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{disk_cache::DiskCache, ConfigKey, Result};

/// Name of the file backing [`WatchRegistry`].
pub const WATCHERS_FILE_NAME: &str = "optly-background-watchers.json";

type Entries = BTreeMap<String, WatchEntry>;

/// One persisted watch state. The key is stored as a tagged variant, so it can be restored
/// exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchEntry {
    config_key: ConfigKey,
    watching: bool,
}

/// Map of config key to "is being watched", persisted as one JSON object.
///
/// Every operation reads the whole file and, for updates, writes it back. A key that was never
/// set is not watched. Entries are flipped, never pruned.
///
/// File layout:
///
/// ```json
/// {"sdkKey:abc": {"configKey": {"kind": "sdkKey", "value": "abc"}, "watching": true}}
/// ```
#[derive(Debug, Clone)]
pub struct WatchRegistry {
    disk: DiskCache,
}

impl WatchRegistry {
    /// Registry stored through `disk`.
    pub fn new(disk: DiskCache) -> WatchRegistry {
        WatchRegistry { disk }
    }

    /// Record whether `key` is being watched.
    ///
    /// Returns `false` if the key is empty, the existing file is malformed (it is left
    /// untouched), or the write fails.
    pub fn set_watching(&self, key: &ConfigKey, watching: bool) -> bool {
        if key.cache_key().is_empty() {
            log::error!(target: "datafile_sync", "cannot set watch state for an empty config key");
            return false;
        }

        let mut entries = match self.load() {
            Ok(entries) => entries,
            Err(err) => {
                log::error!(target: "datafile_sync", "unable to update background watchers: {}", err);
                return false;
            }
        };
        entries.insert(
            key.storage_id(),
            WatchEntry {
                config_key: key.clone(),
                watching,
            },
        );

        match serde_json::to_string(&entries) {
            Ok(text) => self.disk.save(WATCHERS_FILE_NAME, &text),
            Err(err) => {
                log::error!(target: "datafile_sync", "unable to serialize background watchers: {}", err);
                false
            }
        }
    }

    /// Whether `key` is being watched. Unknown keys and unreadable state count as `false`.
    pub fn is_watching(&self, key: &ConfigKey) -> bool {
        if key.cache_key().is_empty() {
            log::error!(target: "datafile_sync", "cannot read watch state for an empty config key");
            return false;
        }

        match self.load() {
            Ok(entries) => entries
                .get(&key.storage_id())
                .is_some_and(|entry| entry.watching && entry.config_key == *key),
            Err(err) => {
                log::error!(target: "datafile_sync", "unable to read background watchers: {}", err);
                false
            }
        }
    }

    /// All keys currently watched, in stable order. Unreadable state yields an empty list.
    pub fn list_watched_keys(&self) -> Vec<ConfigKey> {
        match self.load() {
            Ok(entries) => entries
                .into_values()
                .filter(|entry| entry.watching)
                .map(|entry| entry.config_key)
                .collect(),
            Err(err) => {
                log::error!(target: "datafile_sync", "unable to read background watchers: {}", err);
                Vec::new()
            }
        }
    }

    fn load(&self) -> Result<Entries> {
        match self.disk.load(WATCHERS_FILE_NAME) {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => {
                log::debug!(target: "datafile_sync", "no background watchers recorded yet");
                Ok(Entries::new())
            }
        }
    }
}
