//! Team that runs jobs on the thread assigning them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{run_job, Job, JobContext, Rejected, Team, TeamContext, TeamStopReport};

/// Executes each job synchronously on the caller's thread. No hand-off, no
/// workers.
pub struct PassiveTeam {
    name: String,
    stop: Arc<AtomicBool>,
    context: JobContext,
}

impl PassiveTeam {
    #[must_use]
    pub fn new(context: &TeamContext) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        Self {
            name: context.name.clone(),
            context: context.job_context(Arc::clone(&stop)),
            stop,
        }
    }
}

impl Team for PassiveTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_passive(&self) -> bool {
        true
    }

    fn start_working(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn assign_job(&self, job: Box<dyn Job>) -> Result<(), Rejected> {
        if self.stop.load(Ordering::Acquire) {
            return Err(Rejected(job));
        }
        run_job(&self.name, job, &self.context);
        Ok(())
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn stop_working(&self, _timeout: Duration) -> TeamStopReport {
        self.request_stop();
        TeamStopReport::default()
    }
}
