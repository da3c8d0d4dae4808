//! Fixed-size worker pool draining a shared queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use super::{join_until, run_job, Job, JobContext, Rejected, Team, TeamContext, TeamStopReport};

struct PoolQueue {
    jobs: VecDeque<Box<dyn Job>>,
    stopping: bool,
}

struct Shared {
    queue: Mutex<PoolQueue>,
    available: Condvar,
    stop: Arc<AtomicBool>,
}

/// Team of `size` workers taking jobs from one FIFO queue.
///
/// The queue is the only state shared between workers; it is guarded by a
/// mutex and workers sleep on a condition variable while it is empty.
pub struct PooledTeam {
    context: TeamContext,
    size: usize,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PooledTeam {
    /// Creates a pool of `size` workers. Workers start in `start_working`.
    #[must_use]
    pub fn new(context: &TeamContext, size: usize) -> Self {
        Self {
            context: context.clone(),
            size: size.max(1),
            shared: Arc::new(Shared {
                queue: Mutex::new(PoolQueue {
                    jobs: VecDeque::new(),
                    stopping: false,
                }),
                available: Condvar::new(),
                stop: Arc::new(AtomicBool::new(false)),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of jobs waiting for a worker.
    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    fn work(shared: &Shared, name: &str, context: &JobContext) {
        loop {
            let job = {
                let mut queue = shared.queue.lock();
                loop {
                    if queue.stopping {
                        return;
                    }
                    if let Some(job) = queue.jobs.pop_front() {
                        break job;
                    }
                    shared.available.wait(&mut queue);
                }
            };
            run_job(name, job, context);
        }
    }
}

impl Team for PooledTeam {
    fn name(&self) -> &str {
        &self.context.name
    }

    fn start_working(&self) -> anyhow::Result<()> {
        let mut workers = self.workers.lock();
        for index in workers.len()..self.size {
            let shared = Arc::clone(&self.shared);
            let name = self.context.name.clone();
            let context = self.context.job_context(Arc::clone(&self.shared.stop));
            let handle = std::thread::Builder::new()
                .name(self.context.worker_name(index))
                .spawn(move || Self::work(&shared, &name, &context))?;
            workers.push(handle);
        }
        info!(team = %self.context.name, size = self.size, "pooled team started");
        Ok(())
    }

    fn assign_job(&self, job: Box<dyn Job>) -> Result<(), Rejected> {
        let mut queue = self.shared.queue.lock();
        if queue.stopping {
            return Err(Rejected(job));
        }
        queue.jobs.push_back(job);
        self.shared.available.notify_one();
        Ok(())
    }

    fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.queue.lock().stopping = true;
        self.shared.available.notify_all();
    }

    fn stop_working(&self, timeout: Duration) -> TeamStopReport {
        let deadline = Instant::now() + timeout;
        self.request_stop();

        let unstarted: Vec<Box<dyn Job>> = self.shared.queue.lock().jobs.drain(..).collect();
        let handles = std::mem::take(&mut *self.workers.lock());
        let workers_still_running = join_until(handles, deadline, &self.context.name);

        debug!(
            team = %self.context.name,
            unstarted = unstarted.len(),
            workers_still_running,
            "pooled team stopped"
        );
        TeamStopReport {
            unstarted,
            workers_still_running,
        }
    }
}
