//! A small persisted key-value store of timestamps.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::Result;

/// Name of the file backing [`KeyValueStore`].
pub const STORAGE_FILE_NAME: &str = "optly-sync-storage.json";

/// Persisted map of `i64` values keyed by arbitrary strings (URLs, mostly).
///
/// Every put is atomic with respect to other puts on the same store and is written through to
/// disk immediately. There are no multi-key transactions.
#[derive(Debug)]
pub struct KeyValueStore {
    path: PathBuf,
    values: Mutex<HashMap<String, i64>>,
}

impl KeyValueStore {
    /// Open the store persisted in `dir`. A missing or unreadable file starts an empty store.
    pub fn open(dir: &Path) -> KeyValueStore {
        let path = dir.join(STORAGE_FILE_NAME);
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
                log::warn!(target: "datafile_sync", "discarding unreadable timestamp storage: {:?}", err);
                HashMap::new()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                log::warn!(target: "datafile_sync", "failed to read timestamp storage: {:?}", err);
                HashMap::new()
            }
        };

        KeyValueStore {
            path,
            values: Mutex::new(values),
        }
    }

    /// Get the value stored under `key`, or `default` if there is none.
    pub fn get_long(&self, key: &str, default: i64) -> i64 {
        let values = self.values.lock().unwrap_or_else(|err| err.into_inner());
        values.get(key).copied().unwrap_or(default)
    }

    /// Store `value` under `key` and persist the store.
    ///
    /// The in-memory value is updated even if persisting fails; the error is logged.
    pub fn save_long(&self, key: &str, value: i64) -> bool {
        let mut values = self.values.lock().unwrap_or_else(|err| err.into_inner());
        values.insert(key.to_owned(), value);
        match self.flush(&values) {
            Ok(()) => true,
            Err(err) => {
                log::warn!(target: "datafile_sync", "failed to persist timestamp storage: {}", err);
                false
            }
        }
    }

    fn flush(&self, values: &HashMap<String, i64>) -> Result<()> {
        let text = serde_json::to_string(values)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{KeyValueStore, STORAGE_FILE_NAME};

    #[test]
    fn missing_key_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyValueStore::open(dir.path());
        assert_eq!(store.get_long("nope", 7), 7);
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = KeyValueStore::open(dir.path());
            assert!(store.save_long("https://a/x.json", 1000));
            assert!(store.save_long("https://a/x.jsonDownloadTime", 2000));
        }

        let store = KeyValueStore::open(dir.path());
        assert_eq!(store.get_long("https://a/x.json", 0), 1000);
        assert_eq!(store.get_long("https://a/x.jsonDownloadTime", 0), 2000);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STORAGE_FILE_NAME), "{not json").unwrap();

        let store = KeyValueStore::open(dir.path());
        assert_eq!(store.get_long("k", -1), -1);
        assert!(store.save_long("k", 5));
        assert_eq!(KeyValueStore::open(dir.path()).get_long("k", -1), 5);
    }
}
