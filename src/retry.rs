//! Bounded exponential backoff for unreliable requests.
use std::{
    fmt::Display,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

/// Retry schedule: after the n-th failed attempt, wait `base^n` units, as long as the total
/// time spent waiting stays within `base^power` units.
///
/// With the defaults (`base = 2`, `power = 5`, `unit = 1s`) a request is attempted up to five
/// times, waiting 2, 4, 8 and 16 seconds in between: another 32 would bring the total past 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Base of the exponential delay. Values below 2 disable retries.
    pub base: u32,
    /// Exponent of the total waiting budget, `base^power` units.
    pub power: u32,
    /// Duration of one delay unit.
    pub unit: Duration,
}

impl BackoffPolicy {
    /// Default value for [`BackoffPolicy::base`].
    pub const DEFAULT_BASE: u32 = 2;
    /// Default value for [`BackoffPolicy::power`].
    pub const DEFAULT_POWER: u32 = 5;
    /// Default value for [`BackoffPolicy::unit`].
    pub const DEFAULT_UNIT: Duration = Duration::from_secs(1);

    /// A policy that makes exactly one attempt.
    pub const fn no_retries() -> BackoffPolicy {
        BackoffPolicy {
            base: 0,
            power: 0,
            unit: Duration::ZERO,
        }
    }

    /// Delays (in order) that a request failing every attempt goes through.
    pub fn delays(&self) -> Vec<Duration> {
        if self.base < 2 {
            return Vec::new();
        }
        let base = u64::from(self.base);
        let budget = base.saturating_pow(self.power);

        let mut delays = Vec::new();
        let mut total: u64 = 0;
        for n in 1.. {
            let Some(units) = base.checked_pow(n) else {
                break;
            };
            total = total.saturating_add(units);
            if total > budget {
                break;
            }
            delays.push(self.unit.saturating_mul(units.min(u64::from(u32::MAX)) as u32));
        }
        delays
    }
}

impl Default for BackoffPolicy {
    fn default() -> BackoffPolicy {
        BackoffPolicy {
            base: BackoffPolicy::DEFAULT_BASE,
            power: BackoffPolicy::DEFAULT_POWER,
            unit: BackoffPolicy::DEFAULT_UNIT,
        }
    }
}

/// A shared flag that cuts backoff sleeps short.
///
/// Once interrupted, every current and future [`Interrupter::sleep`] returns immediately.
#[derive(Debug, Clone, Default)]
pub struct Interrupter {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Interrupter {
    /// Create a new, not interrupted, handle.
    pub fn new() -> Interrupter {
        Interrupter::default()
    }

    /// Wake up all sleepers and make further sleeps return immediately.
    pub fn interrupt(&self) {
        let (lock, condvar) = &*self.state;
        // A poisoned lock still holds a usable flag.
        let mut interrupted = lock.lock().unwrap_or_else(|err| err.into_inner());
        *interrupted = true;
        condvar.notify_all();
    }

    /// Whether [`Interrupter::interrupt`] has been called.
    pub fn is_interrupted(&self) -> bool {
        *self.state.0.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Sleep for `duration`. Returns `false` if the sleep was interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (lock, condvar) = &*self.state;
        let guard = lock.lock().unwrap_or_else(|err| err.into_inner());
        let (guard, _timeout) = condvar
            .wait_timeout_while(guard, duration, |interrupted| !*interrupted)
            .unwrap_or_else(|err| err.into_inner());
        !*guard
    }
}

/// Runs a request, retrying failures with [`BackoffPolicy`].
///
/// The executor never fails itself: errors returned by the request are logged and retried, and
/// `None` means no attempt produced a value.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: BackoffPolicy,
    interrupter: Interrupter,
}

impl RetryExecutor {
    /// Create an executor following `policy`.
    pub fn new(policy: BackoffPolicy) -> RetryExecutor {
        RetryExecutor::with_interrupter(policy, Interrupter::new())
    }

    /// Create an executor whose backoff sleeps are cut short by `interrupter`.
    pub fn with_interrupter(policy: BackoffPolicy, interrupter: Interrupter) -> RetryExecutor {
        RetryExecutor {
            policy,
            interrupter,
        }
    }

    /// Handle that aborts pending retries of this executor.
    pub fn interrupter(&self) -> &Interrupter {
        &self.interrupter
    }

    /// Run `request` until it succeeds or the retry schedule is exhausted.
    ///
    /// An interrupt during a backoff sleep abandons the remaining attempts.
    pub fn execute<T, E, F>(&self, mut request: F) -> Option<T>
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut delays = self.policy.delays().into_iter();
        let mut attempt = 1;
        loop {
            match request() {
                Ok(value) => return Some(value),
                Err(err) => {
                    log::warn!(target: "datafile_sync", attempt; "request failed: {}", err);
                }
            }

            let Some(delay) = delays.next() else {
                log::warn!(target: "datafile_sync", attempt; "giving up after {} attempts", attempt);
                return None;
            };

            log::info!(target: "datafile_sync", "request failed, waiting {:?} to try again", delay);
            if !self.interrupter.sleep(delay) {
                log::warn!(target: "datafile_sync", "retry sleep interrupted, abandoning request");
                return None;
            }
            attempt += 1;
        }
    }
}
