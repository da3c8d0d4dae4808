//! Readiness flags for asynchronous managed objects.
//!
//! A job that needs an object whose operation is in flight parks on the
//! object's [`AsynchronousFlag`] and gives up its worker. Completing the
//! operation wakes every parked job exactly once; so does the monitor when an
//! operation outlives its timeout, except that the jobs then resume with an
//! `AsynchronousTimeout` escalation.

use std::sync::{Arc, Weak};

use officefloor_core::{EngineEscalation, Escalation};
use parking_lot::Mutex;
use tracing::warn;

use crate::monitor::{MonitorClock, MonitorTask};

/// Something that can resume a parked job.
pub trait Wakeable: Send + Sync {
    /// Resumes the job parked under `token`, if it is still parked.
    fn wake(&self, token: u64, escalation: Option<Escalation>);
}

/// A parked job waiting on a flag or lease.
pub struct Waiter {
    pub target: Arc<dyn Wakeable>,
    pub token: u64,
}

impl Waiter {
    pub fn wake(self, escalation: Option<Escalation>) {
        self.target.wake(self.token, escalation);
    }
}

// ---------------------------------------------------------------------------
// AsynchronousFlag
// ---------------------------------------------------------------------------

struct FlagState {
    ready: bool,
    started_at: u64,
    waiters: Vec<Waiter>,
}

/// Ready/not-ready state of one asynchronous managed object instance.
pub struct AsynchronousFlag {
    object: String,
    timeout_ms: Option<u64>,
    clock: MonitorClock,
    state: Mutex<FlagState>,
}

impl AsynchronousFlag {
    #[must_use]
    pub fn new(object: impl Into<String>, timeout_ms: Option<u64>, clock: MonitorClock) -> Self {
        Self {
            object: object.into(),
            timeout_ms,
            clock,
            state: Mutex::new(FlagState {
                ready: true,
                started_at: 0,
                waiters: Vec::new(),
            }),
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    /// Flags the object not ready.
    pub fn start_operation(&self) {
        let mut state = self.state.lock();
        if state.ready {
            state.ready = false;
            state.started_at = self.clock.current_millis();
        }
    }

    /// Flags the object ready, waking parked jobs. Returns how many were
    /// woken; a repeated completion wakes nobody.
    pub fn complete_operation(&self) -> usize {
        let waiters = {
            let mut state = self.state.lock();
            state.ready = true;
            std::mem::take(&mut state.waiters)
        };
        let woken = waiters.len();
        for waiter in waiters {
            waiter.wake(None);
        }
        woken
    }

    /// Parks `waiter` until the operation completes.
    ///
    /// # Errors
    ///
    /// Hands the waiter back if the object is already ready.
    pub fn park(&self, waiter: Waiter) -> Result<(), Waiter> {
        let mut state = self.state.lock();
        if state.ready {
            return Err(waiter);
        }
        state.waiters.push(waiter);
        Ok(())
    }

    /// Wakes parked jobs with a timeout escalation once the operation has
    /// run longer than the timeout. Returns how many were woken.
    pub fn check_timeout(&self, now_millis: u64) -> usize {
        let Some(timeout_ms) = self.timeout_ms else {
            return 0;
        };
        let waiters = {
            let mut state = self.state.lock();
            if state.ready
                || state.waiters.is_empty()
                || now_millis.saturating_sub(state.started_at) < timeout_ms
            {
                return 0;
            }
            std::mem::take(&mut state.waiters)
        };
        warn!(object = %self.object, timeout_ms, "asynchronous operation timed out");
        let escalation = Escalation::from(EngineEscalation::AsynchronousTimeout {
            object: self.object.clone(),
            timeout_ms,
        });
        let woken = waiters.len();
        for waiter in waiters {
            waiter.wake(Some(escalation.clone()));
        }
        woken
    }
}

/// Handed to asynchronous managed objects to report their operations.
#[derive(Clone)]
pub struct AsynchronousContext {
    flag: Arc<AsynchronousFlag>,
}

impl AsynchronousContext {
    #[must_use]
    pub fn new(flag: Arc<AsynchronousFlag>) -> Self {
        Self { flag }
    }

    /// Marks the object not ready until `complete_operation`.
    pub fn start_operation(&self) {
        self.flag.start_operation();
    }

    /// Marks the object ready, resuming jobs waiting on it.
    pub fn complete_operation(&self) {
        self.flag.complete_operation();
    }
}

// ---------------------------------------------------------------------------
// FlagRegistry
// ---------------------------------------------------------------------------

/// Every live flag with a timeout, swept by the monitor.
#[derive(Default)]
pub struct FlagRegistry {
    flags: Mutex<Vec<Weak<AsynchronousFlag>>>,
}

impl FlagRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, flag: &Arc<AsynchronousFlag>) {
        if flag.timeout_ms.is_some() {
            self.flags.lock().push(Arc::downgrade(flag));
        }
    }

    /// Checks every flag for a timeout, dropping flags no longer alive.
    pub fn sweep(&self, now_millis: u64) -> usize {
        let live: Vec<Arc<AsynchronousFlag>> = {
            let mut flags = self.flags.lock();
            flags.retain(|flag| flag.strong_count() > 0);
            flags.iter().filter_map(Weak::upgrade).collect()
        };
        live.iter().map(|flag| flag.check_timeout(now_millis)).sum()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.flags.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Monitor task sweeping asynchronous timeouts.
pub struct TimeoutSweep {
    pub flags: Arc<FlagRegistry>,
}

impl MonitorTask for TimeoutSweep {
    fn on_tick(&mut self, now_millis: u64) {
        self.flags.sweep(now_millis);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    use super::*;

    #[derive(Default)]
    struct CountingWake {
        woken: AtomicUsize,
        timed_out: AtomicUsize,
    }

    impl Wakeable for CountingWake {
        fn wake(&self, _token: u64, escalation: Option<Escalation>) {
            self.woken.fetch_add(1, Ordering::SeqCst);
            if escalation.is_some() {
                self.timed_out.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn waiter(target: &Arc<CountingWake>) -> Waiter {
        Waiter {
            target: Arc::clone(target) as Arc<dyn Wakeable>,
            token: 1,
        }
    }

    #[test]
    fn ready_flag_refuses_to_park() {
        let flag = AsynchronousFlag::new("socket", None, MonitorClock::new());
        let target = Arc::new(CountingWake::default());
        assert!(flag.park(waiter(&target)).is_err());

        flag.start_operation();
        assert!(!flag.is_ready());
        assert!(flag.park(waiter(&target)).is_ok());
        assert_eq!(flag.complete_operation(), 1);
        assert_eq!(target.woken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_wakes_parked_jobs_with_escalation() {
        let clock = MonitorClock::new();
        let flag = Arc::new(AsynchronousFlag::new("socket", Some(100), clock.clone()));
        let registry = FlagRegistry::new();
        registry.register(&flag);

        let target = Arc::new(CountingWake::default());
        flag.start_operation();
        assert!(flag.park(waiter(&target)).is_ok());

        clock.advance(50);
        assert_eq!(registry.sweep(clock.current_millis()), 0);
        clock.advance(60);
        assert_eq!(registry.sweep(clock.current_millis()), 1);
        assert_eq!(target.timed_out.load(Ordering::SeqCst), 1);

        // Later completion finds nobody left to wake.
        assert_eq!(flag.complete_operation(), 0);
        assert_eq!(target.woken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registry_forgets_dropped_flags() {
        let registry = FlagRegistry::new();
        let flag = Arc::new(AsynchronousFlag::new("socket", Some(10), MonitorClock::new()));
        registry.register(&flag);
        registry.register(&Arc::new(AsynchronousFlag::new("untimed", None, MonitorClock::new())));
        assert_eq!(registry.len(), 1);

        drop(flag);
        registry.sweep(0);
        assert!(registry.is_empty());
    }

    proptest! {
        #[test]
        fn repeated_completion_wakes_each_job_once(
            parked in 1_usize..8,
            completions in 1_usize..5,
        ) {
            let flag = AsynchronousFlag::new("socket", None, MonitorClock::new());
            let target = Arc::new(CountingWake::default());
            flag.start_operation();
            for _ in 0..parked {
                prop_assert!(flag.park(waiter(&target)).is_ok());
            }
            for _ in 0..completions {
                flag.complete_operation();
            }
            prop_assert_eq!(target.woken.load(Ordering::SeqCst), parked);
        }
    }
}
