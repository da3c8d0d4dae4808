use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use officefloor_core::{CleanupEscalation, Escalation, ThreadId};
use parking_lot::Mutex;
use tracing::debug;

use super::{FunctionJob, Invocation, ProcessState, ThreadStatus, ThreadSummary};
use crate::managed_object::{ScopeObjects, Wakeable};

struct ThreadInner {
    status: ThreadStatus,
    queue: VecDeque<Invocation>,
    /// A job of this thread exists: running, queued on a team or parked.
    job_active: bool,
    parked: Option<(u64, Box<FunctionJob>)>,
    park_sequence: u64,
    pending_children: usize,
    /// Set once the thread is escalated or forcibly terminated.
    terminated: Option<Escalation>,
    torn_down: bool,
}

impl ThreadInner {
    fn pop_runnable(&mut self) -> Option<Invocation> {
        if self.terminated.is_some() {
            return None;
        }
        self.queue.pop_front()
    }

    /// Claims teardown when nothing of the thread is left to run.
    fn claim_teardown(&mut self) -> bool {
        if self.job_active || self.pending_children > 0 || self.torn_down {
            return false;
        }
        if self.terminated.is_none() && !self.queue.is_empty() {
            return false;
        }
        self.torn_down = true;
        if self.status != ThreadStatus::Escalated {
            self.status = ThreadStatus::Complete;
        }
        true
    }
}

/// One logical thread of execution within a process.
///
/// At most one job of a thread exists at any time, which pulls the
/// thread's queued invocations in order.
pub(crate) struct ThreadState {
    id: ThreadId,
    function: String,
    process: Arc<ProcessState>,
    parent: Option<Weak<ThreadState>>,
    objects: ScopeObjects,
    inner: Mutex<ThreadInner>,
}

impl ThreadState {
    pub fn new(
        id: ThreadId,
        function: String,
        process: Arc<ProcessState>,
        parent: Option<&Arc<ThreadState>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            function,
            process,
            parent: parent.map(Arc::downgrade),
            objects: ScopeObjects::new(),
            inner: Mutex::new(ThreadInner {
                status: ThreadStatus::Running,
                queue: VecDeque::new(),
                job_active: false,
                parked: None,
                park_sequence: 0,
                pending_children: 0,
                terminated: None,
                torn_down: false,
            }),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn process(&self) -> &Arc<ProcessState> {
        &self.process
    }

    pub fn objects(&self) -> &ScopeObjects {
        &self.objects
    }

    pub fn summary(&self) -> ThreadSummary {
        let inner = self.inner.lock();
        ThreadSummary {
            thread_id: self.id,
            function: self.function.clone(),
            status: inner.status,
            escalation: inner.terminated.clone(),
        }
    }

    /// Starts the thread's job on `invocation`.
    pub fn start(self: &Arc<Self>, invocation: Invocation) {
        let teardown = {
            let mut inner = self.inner.lock();
            if inner.terminated.is_some() {
                inner.claim_teardown()
            } else {
                inner.job_active = true;
                inner.status = ThreadStatus::Running;
                false
            }
        };
        if teardown {
            self.tear_down();
        } else {
            FunctionJob::new(Arc::clone(self), invocation).dispatch();
        }
    }

    pub fn termination(&self) -> Option<Escalation> {
        self.inner.lock().terminated.clone()
    }

    /// Next invocation for the running job. `None` ends the job: the thread
    /// is either waiting for its parallel children or finished.
    pub fn next_invocation(&self) -> Option<Invocation> {
        let teardown = {
            let mut inner = self.inner.lock();
            if inner.terminated.is_none() && inner.pending_children > 0 {
                inner.status = ThreadStatus::Spawning;
                inner.job_active = false;
                false
            } else if let Some(invocation) = inner.pop_runnable() {
                inner.status = ThreadStatus::Running;
                return Some(invocation);
            } else {
                inner.job_active = false;
                inner.claim_teardown()
            }
        };
        if teardown {
            self.tear_down();
        }
        None
    }

    /// Ends the running job without a further invocation.
    pub fn job_stopped(&self) {
        let teardown = {
            let mut inner = self.inner.lock();
            inner.job_active = false;
            inner.claim_teardown()
        };
        if teardown {
            self.tear_down();
        }
    }

    /// Queues `invocations` ahead of the queued work, in order.
    pub fn push_front(&self, invocations: Vec<Invocation>) {
        let mut inner = self.inner.lock();
        if inner.terminated.is_some() {
            return;
        }
        for invocation in invocations.into_iter().rev() {
            inner.queue.push_front(invocation);
        }
    }

    /// Replaces the queued work with an escalation handler. The dropped
    /// continuations are recorded as cleanup escalations carrying the
    /// handled escalation. Returns `false` if the thread has been terminated
    /// meanwhile.
    pub fn redirect(&self, handler: Invocation, escalation: &Escalation) -> bool {
        let abandoned: Vec<Invocation> = {
            let mut inner = self.inner.lock();
            if inner.terminated.is_some() {
                return false;
            }
            let abandoned = inner.queue.drain(..).collect();
            inner.queue.push_back(handler);
            abandoned
        };
        if !abandoned.is_empty() {
            debug!(thread = %self.id, abandoned = abandoned.len(), "queued work abandoned for handler");
            self.record_abandoned(&abandoned, escalation);
        }
        true
    }

    fn record_abandoned(&self, abandoned: &[Invocation], escalation: &Escalation) {
        let office = self.process.office();
        self.process.add_cleanups(
            abandoned
                .iter()
                .filter_map(|invocation| office.functions.get(invocation.function))
                .map(|function| CleanupEscalation::new(function.name.clone(), escalation.clone()))
                .collect(),
        );
    }

    /// Marks the thread escalated: no handler of the thread resolved
    /// `escalation`.
    pub fn escalated(&self, escalation: Escalation) {
        let mut inner = self.inner.lock();
        inner.status = ThreadStatus::Escalated;
        inner.queue.clear();
        if inner.terminated.is_none() {
            inner.terminated = Some(escalation);
        }
    }

    /// Counts a parallel child. Only called by `ProcessState::new_thread`
    /// while it registers the child.
    pub(super) fn add_child(&self) {
        self.inner.lock().pending_children += 1;
    }

    /// Resumes the held continuation once the last parallel child is done.
    pub fn child_completed(self: &Arc<Self>) {
        let (resume, teardown) = {
            let mut inner = self.inner.lock();
            inner.pending_children = inner.pending_children.saturating_sub(1);
            if inner.pending_children > 0 || inner.job_active || inner.torn_down {
                (None, false)
            } else if let Some(invocation) = inner.pop_runnable() {
                inner.job_active = true;
                inner.status = ThreadStatus::Running;
                (Some(invocation), false)
            } else {
                (None, inner.claim_teardown())
            }
        };
        if let Some(invocation) = resume {
            FunctionJob::new(Arc::clone(self), invocation).dispatch();
        } else if teardown {
            self.tear_down();
        }
    }

    /// Parks the thread's job. Hands the job back if the thread was
    /// terminated meanwhile.
    pub fn store_parked(&self, job: Box<FunctionJob>) -> Result<u64, Box<FunctionJob>> {
        let mut inner = self.inner.lock();
        if inner.terminated.is_some() {
            return Err(job);
        }
        inner.park_sequence += 1;
        let token = inner.park_sequence;
        inner.parked = Some((token, job));
        inner.status = ThreadStatus::Waiting;
        Ok(token)
    }

    /// Forcibly ends the thread with `escalation`. Queued work is recorded
    /// as cleanup escalations and a parked job is abandoned; a running job
    /// stops at its next step.
    pub fn terminate(self: &Arc<Self>, escalation: &Escalation) {
        let (abandoned, parked, teardown) = {
            let mut inner = self.inner.lock();
            if inner.torn_down || inner.terminated.is_some() {
                return;
            }
            inner.terminated = Some(escalation.clone());
            inner.status = ThreadStatus::Escalated;
            let abandoned: Vec<Invocation> = inner.queue.drain(..).collect();
            let parked = inner.parked.take().map(|(_, job)| job);
            let teardown = parked.is_none() && inner.claim_teardown();
            (abandoned, parked, teardown)
        };
        debug!(thread = %self.id, error = %escalation, "thread terminated");

        self.record_abandoned(&abandoned, escalation);
        if let Some(job) = parked {
            job.abandon(escalation.clone());
        }
        if teardown {
            self.tear_down();
        }
    }

    /// Settles governance over the thread's objects, recycles them and
    /// reports the thread finished.
    fn tear_down(&self) {
        let enforce = self.inner.lock().status == ThreadStatus::Complete;
        self.process.close_scope(&self.objects.take_all(), enforce);

        let summary = self.summary();
        debug!(thread = %self.id, status = ?summary.status, "thread finished");
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.child_completed();
        }
        self.process.thread_finished(summary);
    }
}

impl Wakeable for ThreadState {
    fn wake(&self, token: u64, escalation: Option<Escalation>) {
        let job = {
            let mut inner = self.inner.lock();
            match inner.parked.take() {
                Some((parked, job)) if parked == token => {
                    inner.status = ThreadStatus::Running;
                    Some(job)
                }
                other => {
                    inner.parked = other;
                    None
                }
            }
        };
        if let Some(job) = job {
            debug!(thread = %self.id, timed_out = escalation.is_some(), "parked job resumed");
            job.resume(escalation);
        }
    }
}
