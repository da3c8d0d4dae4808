//! Coarse monitor clock and the background thread that advances it.
//!
//! Jobs check elapsed time far more often than the clock needs to change, so
//! the monitor thread publishes the time into an atomic on every tick and
//! readers pay a single load instead of a syscall. The same tick drives
//! periodic housekeeping through [`MonitorTask`] (asynchronous operation
//! timeouts).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// MonitorClock
// ---------------------------------------------------------------------------

/// Coarse millisecond clock shared by teams and jobs.
///
/// Reads return the time published by the last tick, measured from the
/// clock's creation.
#[derive(Debug, Clone)]
pub struct MonitorClock {
    inner: Arc<ClockInner>,
}

#[derive(Debug)]
struct ClockInner {
    origin: Instant,
    millis: AtomicU64,
}

impl MonitorClock {
    /// Creates a clock reading zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClockInner {
                origin: Instant::now(),
                millis: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the coarse time in milliseconds.
    #[must_use]
    pub fn current_millis(&self) -> u64 {
        self.inner.millis.load(Ordering::Acquire)
    }

    /// Publishes the current time. Called on every monitor tick.
    pub fn update(&self) {
        #[allow(clippy::cast_possible_truncation)]
        let elapsed = self.inner.origin.elapsed().as_millis() as u64;
        self.inner.millis.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Moves the clock forward by `millis`, for deterministic tests.
    #[cfg(test)]
    pub(crate) fn advance(&self, millis: u64) {
        self.inner.millis.fetch_add(millis, Ordering::AcqRel);
    }
}

impl Default for MonitorClock {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// MonitorTask trait
// ---------------------------------------------------------------------------

/// Housekeeping run by the [`Monitor`] after each clock update.
pub trait MonitorTask: Send + 'static {
    /// Called once per tick with the freshly published time.
    fn on_tick(&mut self, now_millis: u64);

    /// Called once when the monitor stops. Default is a no-op.
    fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Background thread that ticks the [`MonitorClock`] at a fixed interval.
///
/// The thread:
/// 1. Waits for the tick interval (or the stop signal)
/// 2. Publishes the time into the clock
/// 3. Calls `MonitorTask::on_tick()`
/// 4. Calls `MonitorTask::shutdown()` when stopped
pub struct Monitor {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Starts the monitor thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the operating system refuses to spawn the thread.
    pub fn start<T: MonitorTask>(
        clock: MonitorClock,
        mut task: T,
        interval: Duration,
        thread_name: String,
    ) -> anyhow::Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);

        let handle = std::thread::Builder::new().name(thread_name).spawn(move || {
            let (lock, condvar) = &*signal;
            loop {
                {
                    let mut stopped = lock.lock();
                    if !*stopped {
                        condvar.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        break;
                    }
                }
                clock.update();
                task.on_tick(clock.current_millis());
            }
            task.shutdown();
            debug!("monitor stopped");
        })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the monitor, waiting for the thread to finish.
    pub fn stop(&mut self) {
        {
            let (lock, condvar) = &*self.stop;
            *lock.lock() = true;
            condvar.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("monitor thread panicked");
            }
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    struct CountingTask {
        ticks: Arc<AtomicU32>,
        last_seen: Arc<AtomicU64>,
        shutdown_called: Arc<AtomicU32>,
    }

    impl MonitorTask for CountingTask {
        fn on_tick(&mut self, now_millis: u64) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            self.last_seen.store(now_millis, Ordering::SeqCst);
        }

        fn shutdown(&mut self) {
            self.shutdown_called.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn clock_only_moves_forward() {
        let clock = MonitorClock::new();
        assert_eq!(clock.current_millis(), 0);
        clock.advance(500);
        clock.update();
        assert!(clock.current_millis() >= 500);
    }

    #[test]
    fn ticks_until_stopped() {
        let clock = MonitorClock::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let last_seen = Arc::new(AtomicU64::new(0));
        let shutdown_called = Arc::new(AtomicU32::new(0));

        let mut monitor = Monitor::start(
            clock.clone(),
            CountingTask {
                ticks: ticks.clone(),
                last_seen: last_seen.clone(),
                shutdown_called: shutdown_called.clone(),
            },
            Duration::from_millis(10),
            "monitor-test".to_string(),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        monitor.stop();

        assert!(ticks.load(Ordering::SeqCst) >= 2);
        assert_eq!(shutdown_called.load(Ordering::SeqCst), 1);
        assert_eq!(last_seen.load(Ordering::SeqCst), clock.current_millis());
    }

    #[test]
    fn stop_is_prompt_with_long_interval() {
        let started = Instant::now();
        let mut monitor = Monitor::start(
            MonitorClock::new(),
            CountingTask {
                ticks: Arc::new(AtomicU32::new(0)),
                last_seen: Arc::new(AtomicU64::new(0)),
                shutdown_called: Arc::new(AtomicU32::new(0)),
            },
            Duration::from_secs(60),
            "monitor-test".to_string(),
        )
        .unwrap();
        monitor.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
