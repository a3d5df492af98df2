//! The explicit registry of sync components for one SDK session.
use std::{
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use url::Url;

use crate::{
    disk_cache::DiskCache,
    fetcher::ConditionalFetcher,
    retry::RetryExecutor,
    scheduler::{HostCapabilities, PeriodicScheduler, TaskDescriptor, TaskRunner},
    storage::KeyValueStore,
    sync_agent::{SyncAgent, SyncHandle},
    watch_registry::WatchRegistry,
    ConfigKey, Error, Result, SyncConfig,
};

/// Receives datafiles produced by background (scheduled) syncs.
pub type UpdateListener = Arc<dyn Fn(&ConfigKey, Option<String>) + Send + Sync>;

type UpdateSlot = Arc<RwLock<Option<UpdateListener>>>;

/// Owns every sync component of an SDK session: timestamp storage, datafile cache, fetcher,
/// [`SyncAgent`], [`WatchRegistry`] and [`PeriodicScheduler`].
///
/// Created once with [`SyncService::start`] and torn down with [`SyncService::stop`]; nothing
/// is kept in global state.
///
/// # Examples
///
/// ```no_run
/// # use datafile_sync::{ConfigKey, SyncConfig};
/// let service = SyncConfig::new("/var/lib/app/datafiles").start().unwrap();
/// let key = ConfigKey::new(None, Some("FCnSegiEkRry9rhVMroit4")).unwrap();
///
/// service
///     .get_config(&key, |datafile| println!("datafile: {:?}", datafile))
///     .join()
///     .unwrap();
/// service.start_background_sync(&key, None);
/// ```
pub struct SyncService {
    config: SyncConfig,
    agent: SyncAgent,
    registry: WatchRegistry,
    scheduler: PeriodicScheduler,
    updates: UpdateSlot,
}

impl SyncService {
    /// Build all components and select a scheduling backend for this host.
    ///
    /// Persisted job registrations from a previous process resume immediately when the host
    /// supports them; call [`SyncService::recover_after_restart`] to restore the rest.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`] if `config.host` is not a valid URL.
    /// - [`Error::Network`] if the HTTP client cannot be initialized.
    pub fn start(config: SyncConfig) -> Result<SyncService> {
        Url::parse(&config.host).map_err(Error::InvalidBaseUrl)?;

        let disk = DiskCache::new(&config.storage_dir);
        let storage = Arc::new(KeyValueStore::open(&config.storage_dir));
        let fetcher = ConditionalFetcher::new(
            Arc::clone(&storage),
            RetryExecutor::new(config.backoff),
            config.connect_timeout,
            config.read_timeout,
        )?;
        let agent = SyncAgent::new(fetcher, storage, disk.clone(), config.min_fetch_interval);
        let registry = WatchRegistry::new(disk.clone());
        let updates = UpdateSlot::default();

        let runner = background_runner(agent.clone(), config.host.clone(), Arc::clone(&updates));
        let scheduler = PeriodicScheduler::for_host(
            HostCapabilities::probe(&disk),
            disk,
            runner,
            config.jitter,
            config.min_schedule_interval,
        );

        log::debug!(target: "datafile_sync", "sync service started with storage in {}", config.storage_dir.display());

        Ok(SyncService {
            config,
            agent,
            registry,
            scheduler,
            updates,
        })
    }

    /// Get the freshest datafile for `key`, falling back to the cache. See
    /// [`SyncAgent::get_config`].
    pub fn get_config<L>(&self, key: &ConfigKey, listener: L) -> SyncHandle
    where
        L: FnOnce(Option<String>) + Send + 'static,
    {
        match key.url(&self.config.host) {
            Ok(url) => self.agent.get_config(key, &url, listener),
            Err(err) => {
                log::error!(target: "datafile_sync", "cannot build datafile url for {}: {}", key, err);
                listener(None);
                SyncHandle::completed()
            }
        }
    }

    /// Install the listener receiving datafiles from background syncs, replacing any
    /// previous one.
    pub fn set_update_listener(
        &self,
        listener: impl Fn(&ConfigKey, Option<String>) + Send + Sync + 'static,
    ) {
        *self.updates.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    /// Start syncing `key` periodically, every `interval` (or the configured default).
    ///
    /// The watch is recorded so it can be restored after a restart. Returns whether the task
    /// got scheduled.
    pub fn start_background_sync(&self, key: &ConfigKey, interval: Option<Duration>) -> bool {
        let interval = interval.unwrap_or(self.config.sync_interval);
        if !self.registry.set_watching(key, true) {
            log::warn!(target: "datafile_sync", "background sync of {} will not be restored after restart", key);
        }
        self.scheduler.schedule(&TaskDescriptor::new(key.clone()), interval)
    }

    /// Stop syncing `key` periodically. A sync already running completes.
    pub fn stop_background_sync(&self, key: &ConfigKey) -> bool {
        let unscheduled = self.scheduler.unschedule(&TaskDescriptor::new(key.clone()));
        let recorded = self.registry.set_watching(key, false);
        unscheduled && recorded
    }

    /// Whether `key` is currently scheduled for background sync.
    pub fn is_background_sync_active(&self, key: &ConfigKey) -> bool {
        self.scheduler.is_scheduled(&TaskDescriptor::new(key.clone()))
    }

    /// Re-schedule every watched key after a process or device restart. Returns how many keys
    /// are scheduled.
    pub fn recover_after_restart(&self) -> usize {
        let recovered = self
            .scheduler
            .recover(&self.registry, self.config.sync_interval);
        log::debug!(target: "datafile_sync", "restored background sync for {} keys", recovered);
        recovered
    }

    /// Read the cached datafile for `key` without touching the network.
    pub fn load_cached(&self, key: &ConfigKey) -> Option<String> {
        self.agent.load_cached(key)
    }

    /// Whether a datafile is cached for `key`.
    pub fn is_cached(&self, key: &ConfigKey) -> bool {
        self.agent.is_cached(key)
    }

    /// Delete the cached datafile for `key`.
    pub fn remove_cached(&self, key: &ConfigKey) -> bool {
        self.agent.remove_cached(key)
    }

    /// Watch registry of this service.
    pub fn registry(&self) -> &WatchRegistry {
        &self.registry
    }

    /// Name of the scheduling backend in use.
    pub fn scheduler_backend(&self) -> &'static str {
        self.scheduler.backend_name()
    }

    /// Stop all timers of this process and abort pending retries, consuming the service.
    ///
    /// Watch state and persisted job registrations are kept, so a later session can resume.
    /// Syncs still running finish without further retries.
    pub fn stop(self) {
        self.scheduler.shutdown();
        self.agent.interrupt();
        log::debug!(target: "datafile_sync", "sync service stopped");
    }
}

fn background_runner(agent: SyncAgent, host: String, updates: UpdateSlot) -> TaskRunner {
    Arc::new(move |task: &TaskDescriptor| {
        let key = task.key.clone();
        let url = match key.url(&host) {
            Ok(url) => url,
            Err(err) => {
                log::error!(target: "datafile_sync", "cannot build datafile url for {}: {}", key, err);
                return;
            }
        };

        let listener = updates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        // Each fire runs on its own worker; the handle is detached.
        let _ = agent.get_config(&task.key, &url, move |datafile| {
            if let Some(listener) = listener {
                listener(&key, datafile);
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc, Mutex},
        time::Duration,
    };

    use wiremock::{
        matchers::{method, path},
        Mock, ResponseTemplate,
    };

    use crate::{
        retry::BackoffPolicy, test_support::StubServer, ConfigKey, Error, SyncConfig,
        SyncService,
    };

    const DATAFILE: &str = r#"{"rev":"7"}"#;

    fn config(dir: &std::path::Path, host: &str) -> SyncConfig {
        SyncConfig::new(dir)
            .with_host(host)
            .with_backoff(BackoffPolicy::no_retries())
            .with_min_fetch_interval(Duration::ZERO)
            .with_min_schedule_interval(Duration::from_millis(10))
            .with_jitter(Duration::ZERO)
    }

    fn key() -> ConfigKey {
        ConfigKey::SdkKey("abc".to_owned())
    }

    fn serve_datafile(server: &StubServer) {
        server.mount(
            Mock::given(method("GET"))
                .and(path("/datafiles/abc.json"))
                .respond_with(ResponseTemplate::new(200).set_body_string(DATAFILE)),
        );
    }

    #[test]
    fn invalid_host_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = SyncService::start(SyncConfig::new(dir.path()).with_host("no host"));
        assert!(matches!(result, Err(Error::InvalidBaseUrl(_))));
    }

    #[test]
    fn get_config_uses_key_url_and_caches() {
        let server = StubServer::start();
        serve_datafile(&server);
        let dir = tempfile::tempdir().unwrap();
        let service = SyncService::start(config(dir.path(), &server.uri())).unwrap();
        let (sender, receiver) = mpsc::channel();

        service
            .get_config(&key(), move |datafile| sender.send(datafile).unwrap())
            .join()
            .unwrap();

        assert_eq!(receiver.recv().unwrap().as_deref(), Some(DATAFILE));
        assert!(service.is_cached(&key()));
        assert_eq!(service.load_cached(&key()).as_deref(), Some(DATAFILE));
        assert!(service.remove_cached(&key()));
        assert!(!service.is_cached(&key()));
    }

    #[test]
    fn background_sync_delivers_updates() {
        let server = StubServer::start();
        serve_datafile(&server);
        let dir = tempfile::tempdir().unwrap();
        let service = SyncService::start(config(dir.path(), &server.uri())).unwrap();
        let (sender, receiver) = mpsc::channel();
        let sender = Mutex::new(sender);
        service.set_update_listener(move |key, datafile| {
            let _ = sender.lock().unwrap().send((key.clone(), datafile));
        });

        assert!(service.start_background_sync(&key(), Some(Duration::from_millis(20))));
        assert!(service.is_background_sync_active(&key()));
        assert!(service.registry().is_watching(&key()));

        let (updated_key, datafile) = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(updated_key, key());
        assert_eq!(datafile.as_deref(), Some(DATAFILE));

        assert!(service.stop_background_sync(&key()));
        assert!(!service.is_background_sync_active(&key()));
        assert!(!service.registry().is_watching(&key()));
        service.stop();
    }

    #[test]
    fn restart_restores_watched_keys() {
        let dir = tempfile::tempdir().unwrap();
        {
            let service = SyncService::start(config(dir.path(), "http://127.0.0.1:9")).unwrap();
            assert!(service.start_background_sync(&key(), Some(Duration::from_secs(3600))));
            service.stop();
        }

        let service = SyncService::start(config(dir.path(), "http://127.0.0.1:9")).unwrap();
        assert_eq!(service.recover_after_restart(), 1);
        assert!(service.is_background_sync_active(&key()));
        service.stop();
    }

    #[test]
    fn recovery_does_not_schedule_stopped_keys() {
        let dir = tempfile::tempdir().unwrap();
        {
            let service = SyncService::start(config(dir.path(), "http://127.0.0.1:9")).unwrap();
            assert!(service.start_background_sync(&key(), Some(Duration::from_secs(3600))));
            assert!(service.stop_background_sync(&key()));
        }

        let service = SyncService::start(config(dir.path(), "http://127.0.0.1:9")).unwrap();
        assert_eq!(service.recover_after_restart(), 0);
        assert!(!service.is_background_sync_active(&key()));
    }

    #[test]
    fn new_service_retries_after_previous_one_stopped() {
        let server = StubServer::start();
        server.mount(
            Mock::given(method("GET"))
                .and(path("/datafiles/abc.json"))
                .respond_with(ResponseTemplate::new(500))
                .up_to_n_times(1),
        );
        serve_datafile(&server);
        let dir = tempfile::tempdir().unwrap();
        let retrying = || {
            config(dir.path(), &server.uri()).with_backoff(BackoffPolicy {
                base: 2,
                power: 3,
                unit: Duration::from_millis(1),
            })
        };

        SyncService::start(retrying()).unwrap().stop();

        let service = SyncService::start(retrying()).unwrap();
        let (sender, receiver) = mpsc::channel();
        service
            .get_config(&key(), move |datafile| sender.send(datafile).unwrap())
            .join()
            .unwrap();

        assert_eq!(receiver.recv().unwrap().as_deref(), Some(DATAFILE));
        assert_eq!(server.received_requests().len(), 2);
        service.stop();
    }

    #[test]
    fn in_flight_sync_completes_after_unschedule() {
        let server = StubServer::start();
        server.mount(
            Mock::given(method("GET"))
                .and(path("/datafiles/abc.json"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(DATAFILE)
                        .set_delay(Duration::from_millis(200)),
                ),
        );
        let dir = tempfile::tempdir().unwrap();
        let service = SyncService::start(config(dir.path(), &server.uri())).unwrap();
        let updates = Arc::new(Mutex::new(Vec::new()));
        {
            let updates = Arc::clone(&updates);
            service.set_update_listener(move |_, datafile| updates.lock().unwrap().push(datafile));
        }

        assert!(service.start_background_sync(&key(), Some(Duration::from_millis(20))));
        // Let the first fire start its (slow) fetch, then cancel further fires.
        std::thread::sleep(Duration::from_millis(60));
        assert!(service.stop_background_sync(&key()));
        std::thread::sleep(Duration::from_millis(600));

        let updates = updates.lock().unwrap();
        assert!(!updates.is_empty());
        assert!(updates.iter().all(|d| d.as_deref() == Some(DATAFILE)));
        assert_eq!(service.load_cached(&key()).as_deref(), Some(DATAFILE));
    }
}
