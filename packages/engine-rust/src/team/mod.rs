//! Teams: pluggable concurrency strategies that run [`Job`]s.
//!
//! A team accepts jobs, runs each on exactly one worker and honours a
//! cooperative stop signal. Jobs observe the signal through
//! [`JobContext::continue_execution`] and read time through the coarse
//! [`MonitorClock`] rather than the system clock.

pub mod passive;
pub mod pooled;
pub mod worker_per_job;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use officefloor_core::Escalation;

pub use crate::monitor::MonitorClock;
pub use passive::PassiveTeam;
pub use pooled::PooledTeam;
pub use worker_per_job::WorkerPerJobTeam;

// ---------------------------------------------------------------------------
// Identity and context
// ---------------------------------------------------------------------------

/// Identifies a team instance within an office floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TeamId(pub usize);

/// Everything a team factory receives when the floor creates a team.
#[derive(Debug, Clone)]
pub struct TeamContext {
    pub team_id: TeamId,
    /// Team name, qualified by its office.
    pub name: String,
    pub clock: MonitorClock,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
}

impl TeamContext {
    /// Builds a job context bound to this team and the given stop flag.
    #[must_use]
    pub fn job_context(&self, stop: Arc<AtomicBool>) -> JobContext {
        JobContext {
            team_id: self.team_id,
            clock: self.clock.clone(),
            stop,
        }
    }

    /// Name for the worker thread with the given index.
    #[must_use]
    pub fn worker_name(&self, index: usize) -> String {
        format!("{}-{}-{index}", self.thread_name_prefix, self.name)
    }
}

/// Per-run view a job has of the team executing it.
#[derive(Debug, Clone)]
pub struct JobContext {
    team_id: TeamId,
    clock: MonitorClock,
    stop: Arc<AtomicBool>,
}

impl JobContext {
    /// Creates a context outside any team, used when a job is cancelled.
    #[must_use]
    pub fn detached(clock: MonitorClock) -> Self {
        Self {
            team_id: TeamId(usize::MAX),
            clock,
            stop: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Returns `false` once the team has been asked to stop. Long-running
    /// jobs should check this and hand back control.
    #[must_use]
    pub fn continue_execution(&self) -> bool {
        !self.stop.load(Ordering::Acquire)
    }

    /// Coarse current time in milliseconds.
    #[must_use]
    pub fn time_millis(&self) -> u64 {
        self.clock.current_millis()
    }

    #[must_use]
    pub fn team_id(&self) -> TeamId {
        self.team_id
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work scheduled on a team.
pub trait Job: Send + 'static {
    /// Runs the job to completion or suspension.
    fn run(self: Box<Self>, context: &JobContext);

    /// Called instead of `run` when the team cannot execute the job
    /// (stopped before it started).
    fn cancel(self: Box<Self>, escalation: Escalation);

    /// Short description for logging.
    fn describe(&self) -> String;
}

/// A job the team refused. Ownership goes back to the caller.
pub struct Rejected(pub Box<dyn Job>);

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Rejected").field(&self.0.describe()).finish()
    }
}

// ---------------------------------------------------------------------------
// Team trait
// ---------------------------------------------------------------------------

/// Outcome of stopping a team.
#[derive(Default)]
pub struct TeamStopReport {
    /// Jobs accepted but never started. The caller cancels them.
    pub unstarted: Vec<Box<dyn Job>>,
    /// Workers still busy when the stop timeout expired.
    pub workers_still_running: usize,
}

impl fmt::Debug for TeamStopReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeamStopReport")
            .field("unstarted", &self.unstarted.len())
            .field("workers_still_running", &self.workers_still_running)
            .finish()
    }
}

/// A concurrency strategy.
pub trait Team: Send + Sync {
    fn name(&self) -> &str;

    /// Passive teams run jobs on the calling thread, so continuations bound
    /// to them can always run inline.
    fn is_passive(&self) -> bool {
        false
    }

    /// Starts the team's workers.
    ///
    /// # Errors
    ///
    /// Returns an error if workers cannot be created.
    fn start_working(&self) -> anyhow::Result<()>;

    /// Accepts a job for execution.
    ///
    /// # Errors
    ///
    /// Returns the job back inside [`Rejected`] once the team is stopping.
    fn assign_job(&self, job: Box<dyn Job>) -> Result<(), Rejected>;

    /// Raises the stop signal without waiting. Running jobs observe it
    /// through `continue_execution()`; queued jobs are no longer started.
    fn request_stop(&self);

    /// Stops the team, waiting up to `timeout` for busy workers.
    fn stop_working(&self, timeout: Duration) -> TeamStopReport;
}

/// Builds a team from its context. Registered for custom team kinds.
pub type TeamFactory =
    Arc<dyn Fn(&TeamContext) -> anyhow::Result<Arc<dyn Team>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Runs a job on the current thread, recording execution metrics.
pub(crate) fn run_job(team_name: &str, job: Box<dyn Job>, context: &JobContext) {
    let started = Instant::now();
    tracing::trace!(team = team_name, job = %job.describe(), "running job");
    job.run(context);
    metrics::counter!("officefloor_jobs_executed_total", "team" => team_name.to_string())
        .increment(1);
    metrics::histogram!("officefloor_job_duration_seconds", "team" => team_name.to_string())
        .record(started.elapsed().as_secs_f64());
}

/// Joins worker threads, giving up on those still running at `deadline`.
///
/// Returns the number of workers that did not finish in time.
pub(crate) fn join_until(
    handles: Vec<std::thread::JoinHandle<()>>,
    deadline: Instant,
    team_name: &str,
) -> usize {
    let mut pending = handles;
    loop {
        let (finished, running): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|handle| handle.is_finished());
        for handle in finished {
            if handle.join().is_err() {
                tracing::error!(team = team_name, "team worker panicked");
            }
        }
        if running.is_empty() {
            return 0;
        }
        if Instant::now() >= deadline {
            return running.len();
        }
        pending = running;
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_jobs {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use officefloor_core::Escalation;
    use parking_lot::Mutex;

    use super::{Job, JobContext};

    /// Job that records its label and optionally sleeps.
    pub struct RecordingJob {
        pub label: String,
        pub sleep: Duration,
        pub log: Arc<Mutex<Vec<String>>>,
        pub cancelled: Arc<AtomicUsize>,
    }

    impl Job for RecordingJob {
        fn run(self: Box<Self>, _context: &JobContext) {
            if !self.sleep.is_zero() {
                std::thread::sleep(self.sleep);
            }
            self.log.lock().push(self.label.clone());
        }

        fn cancel(self: Box<Self>, _escalation: Escalation) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }

        fn describe(&self) -> String {
            self.label.clone()
        }
    }

    pub fn recording(
        label: &str,
        sleep: Duration,
        log: &Arc<Mutex<Vec<String>>>,
        cancelled: &Arc<AtomicUsize>,
    ) -> Box<dyn Job> {
        Box::new(RecordingJob {
            label: label.to_string(),
            sleep,
            log: Arc::clone(log),
            cancelled: Arc::clone(cancelled),
        })
    }
}
