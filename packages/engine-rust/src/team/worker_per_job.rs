//! Team that gives every job its own worker thread.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error};

use super::{join_until, run_job, Job, Rejected, Team, TeamContext, TeamStopReport};

/// Spawns a dedicated worker per job. Suited to functions that block on
/// external I/O.
pub struct WorkerPerJobTeam {
    context: TeamContext,
    stop: Arc<AtomicBool>,
    spawned: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPerJobTeam {
    #[must_use]
    pub fn new(context: &TeamContext) -> Self {
        Self {
            context: context.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            spawned: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
        }
    }
}

impl Team for WorkerPerJobTeam {
    fn name(&self) -> &str {
        &self.context.name
    }

    fn start_working(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn assign_job(&self, job: Box<dyn Job>) -> Result<(), Rejected> {
        let mut workers = self.workers.lock();
        if self.stop.load(Ordering::Acquire) {
            return Err(Rejected(job));
        }
        workers.retain(|handle| !handle.is_finished());

        let index = self.spawned.fetch_add(1, Ordering::Relaxed);
        let name = self.context.name.clone();
        let context = self.context.job_context(Arc::clone(&self.stop));

        // The job moves into the worker; a failed spawn drops the closure, so
        // hand the job over through a slot we can take back.
        let slot = Arc::new(Mutex::new(Some(job)));
        let worker_slot = Arc::clone(&slot);
        let spawned = std::thread::Builder::new()
            .name(self.context.worker_name(index))
            .spawn(move || {
                if let Some(job) = worker_slot.lock().take() {
                    run_job(&name, job, &context);
                }
            });

        match spawned {
            Ok(handle) => {
                workers.push(handle);
                Ok(())
            }
            Err(e) => {
                error!(team = %self.context.name, error = %e, "failed to spawn worker");
                match slot.lock().take() {
                    Some(job) => Err(Rejected(job)),
                    None => Ok(()),
                }
            }
        }
    }

    fn request_stop(&self) {
        let _workers = self.workers.lock();
        self.stop.store(true, Ordering::Release);
    }

    fn stop_working(&self, timeout: Duration) -> TeamStopReport {
        let deadline = Instant::now() + timeout;
        self.request_stop();
        let handles = std::mem::take(&mut *self.workers.lock());
        let workers_still_running = join_until(handles, deadline, &self.context.name);
        debug!(team = %self.context.name, workers_still_running, "worker-per-job team stopped");
        TeamStopReport {
            unstarted: Vec::new(),
            workers_still_running,
        }
    }
}
