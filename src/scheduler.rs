//! Periodic background invocation of datafile syncs.
//!
//! Two host facilities are abstracted behind [`ScheduleBackend`]:
//!
//! - [`JobBackend`] models a persistent job scheduler: registrations are stored on disk and
//!   restored when the backend is created again, duplicate registrations are skipped, and the
//!   facility enforces its own minimum interval.
//! - [`AlarmBackend`] models a repeating wall-clock alarm: registrations live only in the
//!   current process, and re-scheduling replaces the previous alarm.
//!
//! [`HostCapabilities::probe`] decides which one is available. Whatever the backend,
//! [`PeriodicScheduler::recover`] replays the [`WatchRegistry`] after a restart.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    disk_cache::DiskCache,
    timer::{RepeatingTimer, TimerTask},
    watch_registry::WatchRegistry,
    ConfigKey, Result,
};

/// Name of the file where [`JobBackend`] persists its registrations.
pub const JOBS_FILE_NAME: &str = "optly-scheduled-jobs.json";

/// Identifies one periodic task: syncing the datafile of `key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskDescriptor {
    /// Datafile stream synced by this task.
    pub key: ConfigKey,
}

impl TaskDescriptor {
    /// Descriptor for syncing `key`.
    pub fn new(key: ConfigKey) -> TaskDescriptor {
        TaskDescriptor { key }
    }

    fn thread_name(&self) -> String {
        format!("datafile-sync-timer-{}", self.key)
    }
}

/// Callback run on every fire of a scheduled task.
pub type TaskRunner = Arc<dyn Fn(&TaskDescriptor) + Send + Sync>;

/// A host scheduling facility.
pub trait ScheduleBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Register `task` to fire every `interval`. Returns `false` if it could not be registered.
    fn schedule(&self, task: &TaskDescriptor, interval: Duration) -> bool;

    /// Cancel future fires of `task`. Returns `false` if it was not scheduled.
    fn unschedule(&self, task: &TaskDescriptor) -> bool;

    /// Whether `task` is currently registered.
    fn is_scheduled(&self, task: &TaskDescriptor) -> bool;

    /// Every task currently registered in this process.
    fn scheduled_tasks(&self) -> Vec<TaskDescriptor>;

    /// Whether registrations outlive the process on their own.
    fn survives_restart(&self) -> bool;

    /// Stop every timer of this process. Persisted registrations are kept.
    fn shutdown(&self);
}

/// What the host offers for background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// A persistent job facility is available.
    pub persistent_jobs: bool,
}

impl HostCapabilities {
    /// Probe the host. Persisting jobs requires a writable storage directory.
    pub fn probe(disk: &DiskCache) -> HostCapabilities {
        const PROBE_FILE_NAME: &str = ".optly-capability-probe";

        let persistent_jobs = disk.save(PROBE_FILE_NAME, "") && disk.delete(PROBE_FILE_NAME);
        if !persistent_jobs {
            log::warn!(target: "datafile_sync", "storage is not writable, falling back to in-process alarms");
        }
        HostCapabilities { persistent_jobs }
    }
}

/// In-process timers keyed by task, shared by both backends.
#[derive(Default)]
struct TimerTable {
    timers: Mutex<HashMap<TaskDescriptor, RepeatingTimer>>,
}

impl TimerTable {
    fn arm(
        &self,
        task: &TaskDescriptor,
        interval: Duration,
        jitter: Duration,
        runner: &TaskRunner,
    ) -> Result<()> {
        let fire: TimerTask = {
            let runner = Arc::clone(runner);
            let task = task.clone();
            Arc::new(move || runner(&task))
        };
        let timer = RepeatingTimer::start(&task.thread_name(), interval, jitter, fire)?;

        let previous = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.clone(), timer);
        if let Some(previous) = previous {
            previous.stop();
        }
        Ok(())
    }

    fn disarm(&self, task: &TaskDescriptor) -> bool {
        let timer = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task);
        match timer {
            Some(timer) => {
                // Only future fires are cancelled; a sync already started keeps running.
                timer.stop();
                true
            }
            None => false,
        }
    }

    fn contains(&self, task: &TaskDescriptor) -> bool {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task)
            .is_some_and(RepeatingTimer::is_running)
    }

    fn tasks(&self) -> Vec<TaskDescriptor> {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn stop_all(&self) {
        let timers: Vec<_> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, timer) in timers {
            timer.stop();
        }
    }
}

/// Capability-limited backend: a repeating in-process alarm per task.
///
/// Nothing survives a restart; [`PeriodicScheduler::recover`] restores the alarms.
pub struct AlarmBackend {
    runner: TaskRunner,
    jitter: Duration,
    timers: TimerTable,
}

impl AlarmBackend {
    /// Create a backend that calls `runner` on every fire.
    pub fn new(runner: TaskRunner, jitter: Duration) -> AlarmBackend {
        AlarmBackend {
            runner,
            jitter,
            timers: TimerTable::default(),
        }
    }
}

impl ScheduleBackend for AlarmBackend {
    fn name(&self) -> &'static str {
        "alarm"
    }

    fn schedule(&self, task: &TaskDescriptor, interval: Duration) -> bool {
        if interval.is_zero() {
            log::error!(target: "datafile_sync", "refusing to schedule {} with a zero interval", task.key);
            return false;
        }
        if self.timers.disarm(task) {
            log::debug!(target: "datafile_sync", "replacing existing alarm for {}", task.key);
        }
        match self.timers.arm(task, interval, self.jitter, &self.runner) {
            Ok(()) => true,
            Err(err) => {
                log::error!(target: "datafile_sync", "failed to start alarm for {}: {}", task.key, err);
                false
            }
        }
    }

    fn unschedule(&self, task: &TaskDescriptor) -> bool {
        self.timers.disarm(task)
    }

    fn is_scheduled(&self, task: &TaskDescriptor) -> bool {
        self.timers.contains(task)
    }

    fn scheduled_tasks(&self) -> Vec<TaskDescriptor> {
        self.timers.tasks()
    }

    fn survives_restart(&self) -> bool {
        false
    }

    fn shutdown(&self) {
        self.timers.stop_all();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobRecord {
    config_key: ConfigKey,
    interval_ms: u64,
}

/// Capability-rich backend: registrations are persisted and re-armed on construction.
pub struct JobBackend {
    runner: TaskRunner,
    jitter: Duration,
    min_interval: Duration,
    disk: DiskCache,
    timers: TimerTable,
    // Serializes read-modify-write cycles of the jobs file.
    jobs_lock: Mutex<()>,
}

impl JobBackend {
    /// Default value for the minimum interval the job facility enforces.
    pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(15 * 60);

    /// Create the backend and re-arm every job persisted by a previous process.
    pub fn new(
        disk: DiskCache,
        runner: TaskRunner,
        jitter: Duration,
        min_interval: Duration,
    ) -> JobBackend {
        let backend = JobBackend {
            runner,
            jitter,
            min_interval,
            disk,
            timers: TimerTable::default(),
            jobs_lock: Mutex::new(()),
        };

        let jobs = backend.load_jobs();
        for record in jobs.into_values() {
            let task = TaskDescriptor::new(record.config_key);
            let interval = backend.clamp(Duration::from_millis(record.interval_ms));
            match backend.timers.arm(&task, interval, backend.jitter, &backend.runner) {
                Ok(()) => log::debug!(target: "datafile_sync", "restored scheduled job for {}", task.key),
                Err(err) => {
                    log::error!(target: "datafile_sync", "failed to restore job for {}: {}", task.key, err)
                }
            }
        }

        backend
    }

    fn clamp(&self, interval: Duration) -> Duration {
        interval.max(self.min_interval).max(Duration::from_millis(1))
    }

    fn load_jobs(&self) -> BTreeMap<String, JobRecord> {
        let Some(text) = self.disk.load(JOBS_FILE_NAME) else {
            return BTreeMap::new();
        };
        serde_json::from_str(&text).unwrap_or_else(|err| {
            log::error!(target: "datafile_sync", "discarding unreadable scheduled jobs: {}", err);
            BTreeMap::new()
        })
    }

    fn save_jobs(&self, jobs: &BTreeMap<String, JobRecord>) -> bool {
        match serde_json::to_string(jobs) {
            Ok(text) => self.disk.save(JOBS_FILE_NAME, &text),
            Err(err) => {
                log::error!(target: "datafile_sync", "unable to serialize scheduled jobs: {}", err);
                false
            }
        }
    }
}

impl ScheduleBackend for JobBackend {
    fn name(&self) -> &'static str {
        "job"
    }

    fn schedule(&self, task: &TaskDescriptor, interval: Duration) -> bool {
        let _guard = self.jobs_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut jobs = self.load_jobs();
        let job_id = task.key.storage_id();
        let interval = self.clamp(interval);
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);

        let unchanged = jobs
            .get(&job_id)
            .is_some_and(|job| job.interval_ms == interval_ms);
        if unchanged && self.timers.contains(task) {
            log::debug!(target: "datafile_sync", "job for {} already scheduled", task.key);
            return true;
        }

        jobs.insert(
            job_id,
            JobRecord {
                config_key: task.key.clone(),
                interval_ms,
            },
        );
        if !self.save_jobs(&jobs) {
            return false;
        }

        if self.timers.disarm(task) {
            log::debug!(target: "datafile_sync", "replacing job for {} with a {:?} interval", task.key, interval);
        }
        match self.timers.arm(task, interval, self.jitter, &self.runner) {
            Ok(()) => true,
            Err(err) => {
                log::error!(target: "datafile_sync", "failed to start job for {}: {}", task.key, err);
                false
            }
        }
    }

    fn unschedule(&self, task: &TaskDescriptor) -> bool {
        let _guard = self.jobs_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let was_armed = self.timers.disarm(task);
        let mut jobs = self.load_jobs();
        if jobs.remove(&task.key.storage_id()).is_none() {
            return was_armed;
        }
        if !self.save_jobs(&jobs) {
            // The stale record is re-armed by the next process until recovery cancels it.
            log::error!(target: "datafile_sync", "failed to remove persisted job for {}", task.key);
            return false;
        }
        true
    }

    fn is_scheduled(&self, task: &TaskDescriptor) -> bool {
        self.timers.contains(task)
    }

    fn scheduled_tasks(&self) -> Vec<TaskDescriptor> {
        self.timers.tasks()
    }

    fn survives_restart(&self) -> bool {
        true
    }

    fn shutdown(&self) {
        self.timers.stop_all();
    }
}

/// Registers and cancels periodic syncs on whichever backend the host supports.
pub struct PeriodicScheduler {
    backend: Box<dyn ScheduleBackend>,
}

impl PeriodicScheduler {
    /// Scheduler using `backend`.
    pub fn new(backend: Box<dyn ScheduleBackend>) -> PeriodicScheduler {
        log::debug!(target: "datafile_sync", "scheduling periodic syncs with the {} backend", backend.name());
        PeriodicScheduler { backend }
    }

    /// Pick the backend matching `capabilities`.
    pub fn for_host(
        capabilities: HostCapabilities,
        disk: DiskCache,
        runner: TaskRunner,
        jitter: Duration,
        min_job_interval: Duration,
    ) -> PeriodicScheduler {
        let backend: Box<dyn ScheduleBackend> = if capabilities.persistent_jobs {
            Box::new(JobBackend::new(disk, runner, jitter, min_job_interval))
        } else {
            Box::new(AlarmBackend::new(runner, jitter))
        };
        PeriodicScheduler::new(backend)
    }

    /// Fire `task` every `interval`.
    pub fn schedule(&self, task: &TaskDescriptor, interval: Duration) -> bool {
        if task.key.cache_key().is_empty() {
            log::error!(target: "datafile_sync", "refusing to schedule a task with an empty config key");
            return false;
        }
        let scheduled = self.backend.schedule(task, interval);
        if scheduled {
            log::debug!(target: "datafile_sync", "scheduled periodic sync of {} every {:?}", task.key, interval);
        }
        scheduled
    }

    /// Cancel future fires of `task`. A sync already running is not affected.
    pub fn unschedule(&self, task: &TaskDescriptor) -> bool {
        let unscheduled = self.backend.unschedule(task);
        if unscheduled {
            log::debug!(target: "datafile_sync", "unscheduled periodic sync of {}", task.key);
        }
        unscheduled
    }

    /// Whether `task` is scheduled.
    pub fn is_scheduled(&self, task: &TaskDescriptor) -> bool {
        self.backend.is_scheduled(task)
    }

    /// Name of the active backend.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Re-schedule every key `registry` marks as watched and cancel registrations of keys it
    /// does not. Returns how many are scheduled afterwards.
    pub fn recover(&self, registry: &WatchRegistry, interval: Duration) -> usize {
        let watched = registry.list_watched_keys();
        for task in self.backend.scheduled_tasks() {
            if !watched.contains(&task.key) {
                log::debug!(target: "datafile_sync", "cancelling sync of {}, no longer watched", task.key);
                self.unschedule(&task);
            }
        }

        let mut rescheduled = 0;
        for key in watched {
            let task = TaskDescriptor::new(key);
            // Persistent jobs are usually still registered; `schedule` skips those.
            if self.schedule(&task, interval) {
                rescheduled += 1;
            } else {
                log::warn!(target: "datafile_sync", "failed to reschedule {} after restart", task.key);
            }
        }
        rescheduled
    }

    /// Stop every timer in this process.
    pub fn shutdown(&self) {
        self.backend.shutdown();
    }
}

impl Drop for PeriodicScheduler {
    fn drop(&mut self) {
        self.backend.shutdown();
    }
}
