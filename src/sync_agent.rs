//! Orchestrates one "get the freshest datafile, falling back to cache" operation.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    thread::JoinHandle,
    time::Duration,
};

use chrono::Utc;

use crate::{
    datafile_cache::ConfigCache,
    disk_cache::DiskCache,
    fetcher::{ConditionalFetcher, FetchOutcome},
    storage::KeyValueStore,
    ConfigKey, Error, Result,
};

/// Suffix appended to a URL to form its throttle timestamp storage key.
const DOWNLOAD_TIME_SUFFIX: &str = "DownloadTime";

/// Handle to an in-flight sync started by [`SyncAgent::get_config`].
///
/// Dropping the handle detaches the worker; the sync still runs to completion.
#[derive(Debug)]
pub struct SyncHandle {
    join_handle: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// Handle for work that finished (or was rejected) on the caller's thread.
    pub(crate) fn completed() -> SyncHandle {
        SyncHandle { join_handle: None }
    }

    /// Block until the sync has finished and its listener has been called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SyncThreadPanicked`] if the worker (or the listener) panicked.
    pub fn join(self) -> Result<()> {
        match self.join_handle {
            Some(handle) => handle.join().map_err(|_| Error::SyncThreadPanicked),
            None => Ok(()),
        }
    }

    /// Whether the worker has finished.
    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }
}

/// Keeps the cached datafile of each key fresh.
///
/// Each [`SyncAgent::get_config`] call runs on its own short-lived worker thread: check the
/// download throttle, fetch conditionally, update the cache, notify the listener. Calls for the
/// same key are serialized; calls for different keys run in parallel.
///
/// `SyncAgent` is cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncAgent {
    inner: Arc<Inner>,
}

struct Inner {
    fetcher: ConditionalFetcher,
    storage: Arc<KeyValueStore>,
    disk: DiskCache,
    min_fetch_interval: Duration,
    // One entry per key ever synced; entries are never removed, which is bounded by the
    // handful of keys a host uses.
    key_locks: Mutex<HashMap<ConfigKey, Arc<Mutex<()>>>>,
}

impl SyncAgent {
    /// Create an agent.
    ///
    /// `storage` should be the same store `fetcher` keeps its timestamps in.
    pub fn new(
        fetcher: ConditionalFetcher,
        storage: Arc<KeyValueStore>,
        disk: DiskCache,
        min_fetch_interval: Duration,
    ) -> SyncAgent {
        SyncAgent {
            inner: Arc::new(Inner {
                fetcher,
                storage,
                disk,
                min_fetch_interval,
                key_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Get the freshest datafile for `key` from `url`, falling back to the cache.
    ///
    /// The work happens on a new worker thread and `listener` is called from there, after the
    /// fetch and the cache update have completed. The listener is consumed, so it runs exactly
    /// once. `None` means neither the network nor the cache produced a datafile; consumers should
    /// keep whatever state they already have.
    ///
    /// Invalid input (empty key or URL) is rejected without any work and the listener receives
    /// `None` right away.
    pub fn get_config<L>(&self, key: &ConfigKey, url: &str, listener: L) -> SyncHandle
    where
        L: FnOnce(Option<String>) + Send + 'static,
    {
        if key.cache_key().is_empty() || url.is_empty() {
            log::error!(target: "datafile_sync", "refusing to sync with an empty config key or url");
            listener(None);
            return SyncHandle::completed();
        }

        // The listener lives in a shared slot so it can still be notified if the worker
        // cannot be spawned.
        let slot = Arc::new(Mutex::new(Some(listener)));

        let spawned = {
            let agent = self.clone();
            let key = key.clone();
            let url = url.to_owned();
            let slot = Arc::clone(&slot);
            std::thread::Builder::new()
                .name("datafile-sync".to_owned())
                .spawn(move || {
                    let datafile = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        agent.sync(&key, &url)
                    }))
                    .unwrap_or_else(|_| {
                        log::error!(target: "datafile_sync", "datafile sync panicked, serving cache");
                        agent.load_cached(&key)
                    });
                    notify(&slot, datafile);
                })
        };

        match spawned {
            Ok(join_handle) => SyncHandle {
                join_handle: Some(join_handle),
            },
            Err(err) => {
                log::error!(target: "datafile_sync", "failed to spawn sync thread: {:?}", err);
                notify(&slot, self.load_cached(key));
                SyncHandle::completed()
            }
        }
    }

    /// Read the cached datafile for `key` without touching the network.
    pub fn load_cached(&self, key: &ConfigKey) -> Option<String> {
        self.cache(key).load()
    }

    /// Whether a datafile is cached for `key`.
    pub fn is_cached(&self, key: &ConfigKey) -> bool {
        self.cache(key).exists()
    }

    /// Delete the cached datafile for `key`, e.g. when switching projects.
    pub fn remove_cached(&self, key: &ConfigKey) -> bool {
        let lock = self.key_lock(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cache(key).delete()
    }

    /// Abort pending retry sleeps of in-flight and future syncs. Used at shutdown.
    pub fn interrupt(&self) {
        self.inner.fetcher.retry().interrupter().interrupt();
    }

    fn sync(&self, key: &ConfigKey, url: &str) -> Option<String> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let cache = self.cache(key);
        let cached = cache.load();
        let throttle_key = format!("{url}{DOWNLOAD_TIME_SUFFIX}");

        if cached.is_some() && self.is_throttled(&throttle_key) {
            log::debug!(target: "datafile_sync", "last download of {} was too recent, serving cache", url);
            return cached;
        }

        if cached.is_none() {
            // A stale "not modified" timestamp without a usable cache would leave us empty.
            self.inner.fetcher.reset_last_modified(url);
        }

        let result = match self.inner.fetcher.fetch(url) {
            Some(FetchOutcome::Fresh(datafile)) if !datafile.is_empty() => {
                // A failed write is logged by the cache; the fresh datafile is served anyway.
                cache.replace(&datafile);
                Some(datafile)
            }
            Some(_) => {
                log::debug!(target: "datafile_sync", "datafile at {} unchanged, serving cache", url);
                cached
            }
            None => {
                log::warn!(target: "datafile_sync", "failed to fetch {}, serving cache", url);
                cached
            }
        };

        self.inner
            .storage
            .save_long(&throttle_key, Utc::now().timestamp_millis());

        result
    }

    fn is_throttled(&self, throttle_key: &str) -> bool {
        let last_download = self.inner.storage.get_long(throttle_key, 0);
        let elapsed = Utc::now().timestamp_millis() - last_download;
        let min_interval = i64::try_from(self.inner.min_fetch_interval.as_millis()).unwrap_or(i64::MAX);
        elapsed < min_interval
    }

    fn cache(&self, key: &ConfigKey) -> ConfigCache {
        ConfigCache::new(self.inner.disk.clone(), key)
    }

    fn key_lock(&self, key: &ConfigKey) -> Arc<Mutex<()>> {
        let mut locks = self
            .inner
            .key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }
}

fn notify<L: FnOnce(Option<String>)>(slot: &Mutex<Option<L>>, datafile: Option<String>) {
    let listener = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(listener) = listener {
        listener(datafile);
    }
}
