use std::{path::PathBuf, time::Duration};

use crate::{retry::BackoffPolicy, scheduler::JobBackend, Result, SyncService};

/// Configuration for [`SyncService`] and the components it wires together.
// Not implementing `Copy` as it holds a path.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Directory holding the datafile cache, the watch registry and timestamp storage.
    pub storage_dir: PathBuf,
    /// CDN host that datafile URLs are built on.
    ///
    /// Defaults to [`SyncConfig::DEFAULT_HOST`].
    pub host: String,
    /// Minimum spacing between two network fetches of the same URL while a cache exists.
    ///
    /// Defaults to [`SyncConfig::DEFAULT_MIN_FETCH_INTERVAL`].
    pub min_fetch_interval: Duration,
    /// Connect timeout for a single request attempt.
    ///
    /// Defaults to [`SyncConfig::DEFAULT_CONNECT_TIMEOUT`].
    pub connect_timeout: Duration,
    /// Total timeout for a single request attempt, body included.
    ///
    /// Defaults to [`SyncConfig::DEFAULT_READ_TIMEOUT`].
    pub read_timeout: Duration,
    /// Retry schedule applied to every fetch.
    pub backoff: BackoffPolicy,
    /// Interval used when background sync is started without an explicit interval.
    ///
    /// Defaults to [`SyncConfig::DEFAULT_SYNC_INTERVAL`].
    pub sync_interval: Duration,
    /// Shortest interval the persistent job backend accepts; shorter requests are raised to it.
    ///
    /// Defaults to [`SyncConfig::DEFAULT_MIN_SCHEDULE_INTERVAL`].
    pub min_schedule_interval: Duration,
    /// Randomized duration subtracted from every periodic fire so that many clients do not
    /// hit the CDN in lockstep.
    ///
    /// Defaults to [`SyncConfig::DEFAULT_JITTER`].
    pub jitter: Duration,
}

impl SyncConfig {
    /// Default value for [`SyncConfig::host`].
    pub const DEFAULT_HOST: &'static str = "https://cdn.optimizely.com";
    /// Default value for [`SyncConfig::min_fetch_interval`].
    pub const DEFAULT_MIN_FETCH_INTERVAL: Duration = Duration::from_secs(60);
    /// Default value for [`SyncConfig::connect_timeout`].
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default value for [`SyncConfig::read_timeout`].
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
    /// Default value for [`SyncConfig::sync_interval`].
    pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(15 * 60);
    /// Default value for [`SyncConfig::min_schedule_interval`].
    pub const DEFAULT_MIN_SCHEDULE_INTERVAL: Duration = JobBackend::DEFAULT_MIN_INTERVAL;
    /// Default value for [`SyncConfig::jitter`].
    pub const DEFAULT_JITTER: Duration = Duration::from_secs(3);

    /// Create a default configuration storing its files in `storage_dir`.
    ///
    /// ```
    /// # use datafile_sync::SyncConfig;
    /// let config = SyncConfig::new("/tmp/datafiles");
    /// assert_eq!(config.host, SyncConfig::DEFAULT_HOST);
    /// ```
    pub fn new(storage_dir: impl Into<PathBuf>) -> SyncConfig {
        SyncConfig {
            storage_dir: storage_dir.into(),
            host: SyncConfig::DEFAULT_HOST.to_owned(),
            min_fetch_interval: SyncConfig::DEFAULT_MIN_FETCH_INTERVAL,
            connect_timeout: SyncConfig::DEFAULT_CONNECT_TIMEOUT,
            read_timeout: SyncConfig::DEFAULT_READ_TIMEOUT,
            backoff: BackoffPolicy::default(),
            sync_interval: SyncConfig::DEFAULT_SYNC_INTERVAL,
            min_schedule_interval: SyncConfig::DEFAULT_MIN_SCHEDULE_INTERVAL,
            jitter: SyncConfig::DEFAULT_JITTER,
        }
    }

    /// Override the CDN host. Clients should use the default setting in most cases.
    pub fn with_host(mut self, host: impl Into<String>) -> SyncConfig {
        self.host = host.into();
        self
    }

    /// Update the throttle interval with `interval`.
    pub fn with_min_fetch_interval(mut self, interval: Duration) -> SyncConfig {
        self.min_fetch_interval = interval;
        self
    }

    /// Update connect timeout with `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> SyncConfig {
        self.connect_timeout = timeout;
        self
    }

    /// Update read timeout with `timeout`.
    pub fn with_read_timeout(mut self, timeout: Duration) -> SyncConfig {
        self.read_timeout = timeout;
        self
    }

    /// Update retry schedule with `backoff`.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> SyncConfig {
        self.backoff = backoff;
        self
    }

    /// Update default background sync interval with `interval`.
    pub fn with_sync_interval(mut self, interval: Duration) -> SyncConfig {
        self.sync_interval = interval;
        self
    }

    /// Update the persistent job backend's minimum interval with `interval`.
    pub fn with_min_schedule_interval(mut self, interval: Duration) -> SyncConfig {
        self.min_schedule_interval = interval;
        self
    }

    /// Update periodic fire jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> SyncConfig {
        self.jitter = jitter;
        self
    }

    /// Build and start a [`SyncService`] using this configuration.
    pub fn start(self) -> Result<SyncService> {
        SyncService::start(self)
    }
}
