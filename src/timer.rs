//! A background thread that fires a task at a fixed interval until stopped.
use std::{
    sync::{mpsc::RecvTimeoutError, Arc},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{Error, Result};

/// Task invoked on every timer fire.
pub type TimerTask = Arc<dyn Fn() + Send + Sync>;

/// A repeating timer thread.
///
/// The first fire happens one interval after start. A panicking task is logged and does not
/// stop the timer.
pub struct RepeatingTimer {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the timer thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,
}

impl RepeatingTimer {
    /// Start a timer thread named `name` that runs `task` every `interval`, minus a random
    /// `jitter`.
    ///
    /// # Errors
    ///
    /// - IO Error if the thread failed to start.
    pub fn start(
        name: &str,
        interval: Duration,
        jitter: Duration,
        task: TimerTask,
    ) -> std::io::Result<RepeatingTimer> {
        // Using `sync_channel` here as it makes `stop_sender` `Sync`. Buffer size of 1 is
        // enough: a second stop command can be dropped.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let join_handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || loop {
                let timeout = self::jitter(interval, jitter);
                match stop_receiver.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => {
                        log::debug!(target: "datafile_sync", "periodic timer fired");
                        let result =
                            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task()));
                        if result.is_err() {
                            log::error!(target: "datafile_sync", "periodic task panicked");
                        }
                    }
                    Ok(()) => {
                        log::debug!(target: "datafile_sync", "timer thread received stop command");
                        return;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        // The owner is gone; nobody can stop us anymore, so stop now.
                        log::debug!(target: "datafile_sync", "timer thread received disconnected");
                        return;
                    }
                }
            })?;

        Ok(RepeatingTimer {
            join_handle,
            stop_sender,
        })
    }

    /// Stop the timer. A fire already in progress completes.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means the thread already exited or a stop command is already queued.
        let _ = self.stop_sender.try_send(());
    }

    /// Whether the timer thread is still alive.
    pub fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }

    /// Stop the timer and block waiting for its thread to exit.
    ///
    /// # Errors
    ///
    /// - [`Error::SyncThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::SyncThreadPanicked)?;
        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::RepeatingTimer;

    #[test]
    fn fires_repeatedly_until_shutdown() {
        let fires = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fires);
        let timer = RepeatingTimer::start(
            "test-timer",
            Duration::from_millis(10),
            Duration::ZERO,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        timer.shutdown().unwrap();

        let after_shutdown = fires.load(Ordering::SeqCst);
        assert!(after_shutdown >= 2, "fired {after_shutdown} times");
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fires.load(Ordering::SeqCst), after_shutdown);
    }

    #[test]
    fn panicking_task_keeps_timer_alive() {
        let fires = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fires);
        let timer = RepeatingTimer::start(
            "test-timer",
            Duration::from_millis(10),
            Duration::ZERO,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("task failure");
            }),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert!(timer.is_running());
        timer.shutdown().unwrap();
        assert!(fires.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(30);
        let result = super::jitter(interval, Duration::from_secs(30));
        assert!(result <= interval, "{result:?} must be <= {interval:?}");
    }

    #[test]
    fn jitter_truncates_to_zero() {
        assert_eq!(
            super::jitter(Duration::ZERO, Duration::from_secs(30)),
            Duration::ZERO
        );
    }
}
