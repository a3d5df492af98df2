//! Local copy of the most recently accepted datafile for one key.
use crate::{disk_cache::DiskCache, ConfigKey};

const FILE_NAME_TEMPLATE: &str = "optly-data-file-{key}.json";

/// The cached datafile for one [`ConfigKey`], stored as a single file.
///
/// Saving is delete-then-write (see [`ConfigCache::replace`]): a crash in between leaves no
/// file rather than a stale one next to a fresh one.
#[derive(Debug, Clone)]
pub struct ConfigCache {
    disk: DiskCache,
    file_name: String,
}

impl ConfigCache {
    /// Cache for `key` stored through `disk`.
    pub fn new(disk: DiskCache, key: &ConfigKey) -> ConfigCache {
        ConfigCache {
            disk,
            file_name: FILE_NAME_TEMPLATE.replace("{key}", key.cache_key()),
        }
    }

    /// Deterministic file name for this key.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Load the cached datafile.
    ///
    /// Returns `None` if there is no cache or it does not hold a JSON object; the latter is
    /// logged as an error and otherwise treated as a missing cache.
    pub fn load(&self) -> Option<String> {
        let text = self.disk.load(&self.file_name)?;
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&text) {
            Ok(_) => Some(text),
            Err(err) => {
                log::error!(target: "datafile_sync", "cached datafile {} is not valid JSON: {}", self.file_name, err);
                None
            }
        }
    }

    /// Write `datafile`, overwriting any previous content.
    pub fn save(&self, datafile: &str) -> bool {
        self.disk.save(&self.file_name, datafile)
    }

    /// Whether a cache file exists (valid or not).
    pub fn exists(&self) -> bool {
        self.disk.exists(&self.file_name)
    }

    /// Remove the cache file.
    pub fn delete(&self) -> bool {
        self.disk.delete(&self.file_name)
    }

    /// Delete the old file, then write `datafile`. Failures of either step are logged as
    /// warnings and do not stop the other.
    pub fn replace(&self, datafile: &str) -> bool {
        if self.exists() && !self.delete() {
            log::warn!(target: "datafile_sync", "unable to delete old datafile {}", self.file_name);
        }
        if !self.save(datafile) {
            log::warn!(target: "datafile_sync", "unable to save new datafile {}", self.file_name);
            return false;
        }
        true
    }
}
