//! Office floor lifecycle with in-flight process tracking.
//!
//! The floor state lives in an `ArcSwap` so `invoke` reads it without
//! locking. Every running process holds a [`ProcessGuard`]; dropping the last
//! one wakes `close()` waiting in [`ShutdownController::wait_for_drain`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};

/// Lifecycle state of an office floor.
///
/// State machine: Opening -> Open -> Closing -> Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloorState {
    /// Offices are being loaded and teams started.
    Opening,
    /// Accepting invocations.
    Open,
    /// Shutdown escalation delivered; no new processes accepted.
    Closing,
    /// Every team has stopped.
    Closed,
}

#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<u64>,
    drained: Condvar,
}

/// Coordinates closing the floor with the processes still running on it.
///
/// 1. `invoke` takes a [`ProcessGuard`] through `begin_process()`, which
///    fails once closing has started
/// 2. `trigger_close()` moves to `Closing`
/// 3. `wait_for_drain()` blocks until every guard has been dropped
#[derive(Debug)]
pub struct ShutdownController {
    in_flight: Arc<InFlight>,
    state: ArcSwap<FloorState>,
}

impl ShutdownController {
    /// Creates a controller in the `Opening` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(InFlight::default()),
            state: ArcSwap::from_pointee(FloorState::Opening),
        }
    }

    /// Transitions to `Open`.
    pub fn set_open(&self) {
        self.state.store(Arc::new(FloorState::Open));
    }

    /// Starts closing. Returns `false` if closing had already started.
    pub fn trigger_close(&self) -> bool {
        let previous = self.state.swap(Arc::new(FloorState::Closing));
        if matches!(*previous, FloorState::Closing | FloorState::Closed) {
            self.state.store(previous);
            return false;
        }
        true
    }

    /// Marks the floor closed.
    pub fn set_closed(&self) {
        self.state.store(Arc::new(FloorState::Closed));
    }

    #[must_use]
    pub fn state(&self) -> FloorState {
        **self.state.load()
    }

    /// Registers a new process, unless the floor is not open.
    #[must_use]
    pub fn begin_process(&self) -> Option<ProcessGuard> {
        if self.state() != FloorState::Open {
            return None;
        }
        let mut count = self.in_flight.count.lock();
        // Re-check under the lock so a process racing close() is either
        // counted before the drain starts or refused.
        if self.state() != FloorState::Open {
            return None;
        }
        *count += 1;
        Some(ProcessGuard {
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Returns the number of processes not yet finished.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        *self.in_flight.count.lock()
    }

    /// Blocks until every process has finished, up to `timeout`.
    ///
    /// Returns `false` if the timeout expired first.
    pub fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.in_flight.count.lock();
        while *count > 0 {
            if self
                .in_flight
                .drained
                .wait_until(&mut count, deadline)
                .timed_out()
            {
                return *count == 0;
            }
        }
        true
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard held by a running process.
#[derive(Debug)]
pub struct ProcessGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        let mut count = self.in_flight.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.in_flight.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_opening() {
        let controller = ShutdownController::new();
        assert_eq!(controller.state(), FloorState::Opening);
        assert!(controller.begin_process().is_none());
    }

    #[test]
    fn state_transitions_opening_open_closing_closed() {
        let controller = ShutdownController::new();
        controller.set_open();
        assert_eq!(controller.state(), FloorState::Open);

        assert!(controller.trigger_close());
        assert_eq!(controller.state(), FloorState::Closing);
        assert!(!controller.trigger_close());

        controller.set_closed();
        assert!(!controller.trigger_close());
        assert_eq!(controller.state(), FloorState::Closed);
    }

    #[test]
    fn process_guards_are_counted() {
        let controller = ShutdownController::new();
        controller.set_open();

        let first = controller.begin_process().unwrap();
        let second = controller.begin_process().unwrap();
        assert_eq!(controller.in_flight_count(), 2);

        drop(first);
        assert_eq!(controller.in_flight_count(), 1);
        drop(second);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn closing_refuses_new_processes() {
        let controller = ShutdownController::new();
        controller.set_open();
        controller.trigger_close();
        assert!(controller.begin_process().is_none());
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn drain_wakes_when_last_guard_drops() {
        let controller = ShutdownController::new();
        controller.set_open();
        let guard = controller.begin_process().unwrap();
        controller.trigger_close();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(guard);
        });

        let started = Instant::now();
        assert!(controller.wait_for_drain(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(4));
        releaser.join().unwrap();
    }

    #[test]
    fn drain_times_out_while_guard_held() {
        let controller = ShutdownController::new();
        controller.set_open();
        let _guard = controller.begin_process().unwrap();
        controller.trigger_close();
        assert!(!controller.wait_for_drain(Duration::from_millis(50)));
        assert_eq!(controller.state(), FloorState::Closing);
    }
}
