use std::sync::Arc;
use std::time::{Duration, Instant};

use officefloor_core::{CleanupEscalation, Escalation, ManagedObjectId, ProcessId, Value};
use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{
    EngineRuntime, Invocation, ProcessEscalationHandler, ProcessOutcome, ProcessReport,
    ThreadState, ThreadSummary,
};
use crate::governance::{settle_all, GovernanceSet};
use crate::managed_object::container::recycle_all;
use crate::managed_object::{
    AsynchronousFlag, ManagedObjectContainer, ManagedObjectMetaData, ScopeObjects,
};
use crate::office::OfficeMetaData;
use crate::shutdown::ProcessGuard;

// ---------------------------------------------------------------------------
// ProcessCompletion
// ---------------------------------------------------------------------------

/// One-shot completion of a process, awaitable from both blocking and async
/// callers.
pub(crate) struct ProcessCompletion {
    report: Mutex<Option<Arc<ProcessReport>>>,
    done: Condvar,
    notify: watch::Sender<Option<Arc<ProcessReport>>>,
}

impl ProcessCompletion {
    fn new() -> Self {
        let (notify, _) = watch::channel(None);
        Self {
            report: Mutex::new(None),
            done: Condvar::new(),
            notify,
        }
    }

    fn complete(&self, report: Arc<ProcessReport>) {
        *self.report.lock() = Some(Arc::clone(&report));
        self.done.notify_all();
        self.notify.send_replace(Some(report));
    }

    pub fn report(&self) -> Option<Arc<ProcessReport>> {
        self.report.lock().clone()
    }

    pub fn wait(&self) -> Arc<ProcessReport> {
        let mut report = self.report.lock();
        loop {
            if let Some(report) = report.as_ref() {
                return Arc::clone(report);
            }
            self.done.wait(&mut report);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Arc<ProcessReport>> {
        let deadline = Instant::now() + timeout;
        let mut report = self.report.lock();
        loop {
            if report.is_some() {
                return report.clone();
            }
            if self.done.wait_until(&mut report, deadline).timed_out() {
                return report.clone();
            }
        }
    }

    pub async fn completed(&self) -> Option<Arc<ProcessReport>> {
        let mut receiver = self.notify.subscribe();
        let report = receiver.wait_for(Option::is_some).await.ok()?;
        (*report).clone()
    }
}

// ---------------------------------------------------------------------------
// ProcessState
// ---------------------------------------------------------------------------

struct ProcessInner {
    threads: Vec<Arc<ThreadState>>,
    summaries: Vec<ThreadSummary>,
    handled: Vec<Escalation>,
    unhandled: Option<Escalation>,
    cleanups: Vec<CleanupEscalation>,
    terminating: bool,
    finished: bool,
}

/// The root unit of work: owns process-scoped objects and the governance of
/// the process, and finishes once its last thread has.
pub(crate) struct ProcessState {
    id: ProcessId,
    office: Arc<OfficeMetaData>,
    runtime: Arc<EngineRuntime>,
    objects: ScopeObjects,
    governance: Mutex<GovernanceSet>,
    handler: Option<Arc<dyn ProcessEscalationHandler>>,
    inner: Mutex<ProcessInner>,
    completion: ProcessCompletion,
    guard: Mutex<Option<ProcessGuard>>,
}

impl ProcessState {
    /// Creates the process and starts its first thread on `function`.
    pub fn start(
        runtime: &Arc<EngineRuntime>,
        office: &Arc<OfficeMetaData>,
        function: usize,
        argument: Option<Value>,
        handler: Option<Arc<dyn ProcessEscalationHandler>>,
        guard: ProcessGuard,
    ) -> Arc<Self> {
        let process = Arc::new(Self {
            id: runtime.next_process_id(),
            office: Arc::clone(office),
            runtime: Arc::clone(runtime),
            objects: ScopeObjects::new(),
            governance: Mutex::new(GovernanceSet::new(&office.governances)),
            handler,
            inner: Mutex::new(ProcessInner {
                threads: Vec::new(),
                summaries: Vec::new(),
                handled: Vec::new(),
                unhandled: None,
                cleanups: Vec::new(),
                terminating: false,
                finished: false,
            }),
            completion: ProcessCompletion::new(),
            guard: Mutex::new(Some(guard)),
        });
        runtime.processes.insert(process.id, Arc::clone(&process));
        metrics::counter!("officefloor_processes_started_total").increment(1);
        debug!(process = %process.id, office = %office.name, "process started");

        match process.new_thread(function, None) {
            Some(thread) => thread.start(Invocation::new(function, argument)),
            None => process.finish_if_idle(),
        }
        process
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn office(&self) -> &Arc<OfficeMetaData> {
        &self.office
    }

    pub fn objects(&self) -> &ScopeObjects {
        &self.objects
    }

    pub fn governance(&self) -> &Mutex<GovernanceSet> {
        &self.governance
    }

    pub fn completion(&self) -> &ProcessCompletion {
        &self.completion
    }

    /// Registers a new thread. Returns `None` once the process is
    /// terminating, so no work starts after an unhandled escalation or close.
    ///
    /// A `parent` waits for the new thread: it counts the child under the
    /// process lock, before `terminate` can reach the child.
    pub fn new_thread(
        self: &Arc<Self>,
        function: usize,
        parent: Option<&Arc<ThreadState>>,
    ) -> Option<Arc<ThreadState>> {
        let mut inner = self.inner.lock();
        if inner.terminating || inner.finished {
            return None;
        }
        let name = self
            .office
            .functions
            .get(function)
            .map_or_else(String::new, |function| function.name.clone());
        if let Some(parent) = parent {
            parent.add_child();
        }
        let thread = ThreadState::new(self.runtime.next_thread_id(), name, Arc::clone(self), parent);
        inner.threads.push(Arc::clone(&thread));
        Some(thread)
    }

    /// Creates the container for a managed object bound to any scope of
    /// this process.
    pub fn new_container(&self, meta: &Arc<ManagedObjectMetaData>) -> ManagedObjectContainer {
        let flag = meta.source_meta.asynchronous.then(|| {
            let flag = Arc::new(AsynchronousFlag::new(
                meta.name.clone(),
                meta.asynchronous_timeout_ms,
                self.runtime.clock.clone(),
            ));
            self.runtime.flags.register(&flag);
            flag
        });
        ManagedObjectContainer::new(
            self.runtime.next_managed_object_id(),
            Arc::clone(meta),
            flag,
        )
    }

    /// Settles the governance over `containers` and recycles them, most
    /// recently created first.
    pub fn close_scope(&self, containers: &[Arc<ManagedObjectContainer>], enforce: bool) {
        if containers.is_empty() {
            return;
        }
        let ids: Vec<ManagedObjectId> = containers.iter().map(|container| container.id()).collect();
        let cycles = self.governance.lock().close_for(&ids, enforce);
        let mut cleanups = settle_all(&cycles, enforce);
        cleanups.extend(recycle_all(containers));
        self.add_cleanups(cleanups);
    }

    pub fn record_handled(&self, escalation: Escalation) {
        self.inner.lock().handled.push(escalation);
    }

    pub fn add_cleanups(&self, cleanups: Vec<CleanupEscalation>) {
        if !cleanups.is_empty() {
            self.inner.lock().cleanups.extend(cleanups);
        }
    }

    /// Receives an escalation no thread handler resolved.
    pub fn escalate(&self, escalation: Escalation) {
        if let Some(handler) = &self.handler {
            debug!(process = %self.id, error = %escalation, "process handler resolving escalation");
            handler.handle(&escalation);
            self.record_handled(escalation);
            return;
        }
        warn!(
            process = %self.id,
            office = %self.office.name,
            error = %escalation,
            "unhandled escalation terminates process"
        );
        self.terminate(&escalation);
    }

    /// Stops every thread with `escalation`. The first terminating
    /// escalation becomes the process outcome.
    pub fn terminate(&self, escalation: &Escalation) {
        let threads = {
            let mut inner = self.inner.lock();
            if inner.finished {
                return;
            }
            inner.terminating = true;
            if inner.unhandled.is_none() {
                inner.unhandled = Some(escalation.clone());
            }
            inner.threads.clone()
        };
        for thread in threads {
            thread.terminate(escalation);
        }
    }

    /// Records a finished thread, finishing the process after the last.
    pub fn thread_finished(&self, summary: ThreadSummary) {
        let last = {
            let mut inner = self.inner.lock();
            inner.threads.retain(|thread| thread.id() != summary.thread_id);
            inner.summaries.push(summary);
            if inner.threads.is_empty() && !inner.finished {
                inner.finished = true;
                true
            } else {
                false
            }
        };
        if last {
            self.finish();
        }
    }

    fn finish_if_idle(&self) {
        let idle = {
            let mut inner = self.inner.lock();
            let idle = inner.threads.is_empty() && !inner.finished;
            inner.finished |= idle;
            idle
        };
        if idle {
            self.finish();
        }
    }

    /// Current state of every thread, finished ones first.
    pub fn thread_summaries(&self) -> Vec<ThreadSummary> {
        let (mut summaries, live) = {
            let inner = self.inner.lock();
            (inner.summaries.clone(), inner.threads.clone())
        };
        summaries.extend(live.iter().map(|thread| thread.summary()));
        summaries
    }

    fn finish(&self) {
        let enforce = self.inner.lock().unhandled.is_none();
        let containers = self.objects.take_all();
        let cycles = self.governance.lock().close_all(enforce);
        let mut cleanups = settle_all(&cycles, enforce);
        cleanups.extend(recycle_all(&containers));

        let report = {
            let mut inner = self.inner.lock();
            inner.cleanups.extend(cleanups);
            ProcessReport {
                process_id: self.id,
                office: self.office.name.clone(),
                outcome: inner
                    .unhandled
                    .clone()
                    .map_or(ProcessOutcome::Completed, ProcessOutcome::Escalated),
                handled_escalations: std::mem::take(&mut inner.handled),
                cleanup_escalations: std::mem::take(&mut inner.cleanups),
                threads: std::mem::take(&mut inner.summaries),
            }
        };

        metrics::counter!(
            "officefloor_processes_completed_total",
            "outcome" => report.outcome.label()
        )
        .increment(1);
        if !report.cleanup_escalations.is_empty() {
            metrics::counter!("officefloor_cleanup_escalations_total")
                .increment(report.cleanup_escalations.len() as u64);
            for cleanup in &report.cleanup_escalations {
                warn!(process = %self.id, source = %cleanup.source, error = %cleanup.escalation, "cleanup escalation");
            }
        }
        debug!(process = %self.id, outcome = report.outcome.label(), "process finished");

        self.runtime.processes.remove(&self.id);
        self.completion.complete(Arc::new(report));
        self.guard.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{OnceLock, Weak};

    use officefloor_core::{
        EngineEscalation, FunctionDescriptor, ManagedObjectDescriptor, ManagedObjectScope,
        OfficeDescriptor,
    };

    use super::*;
    use crate::execute::ThreadStatus;
    use crate::function::FunctionType;
    use crate::office::SourceRegistry;
    use crate::testing::{register_door, register_step, Door, Journal, PassiveOffice};

    type ProcessSlot = Arc<OnceLock<Weak<ProcessState>>>;

    /// Office whose `enter` function parks on a thread-scoped door, whose
    /// `child` function journals itself, and whose `hold` function
    /// terminates the process in `slot` twice while it runs.
    fn door_office(journal: &Journal) -> (PassiveOffice, ProcessSlot) {
        let registry = SourceRegistry::new();
        let _pending = register_door(&registry, None);
        register_step(&registry, "child", journal);
        registry.register_function(
            "enter",
            FunctionType::new(|context| {
                context.object::<Door>(0)?;
                Ok(None)
            })
            .object::<Door>("door"),
        );
        let slot = ProcessSlot::default();
        let (held, recorder) = (Arc::clone(&slot), journal.clone());
        registry.register_function(
            "hold",
            FunctionType::new(move |_| {
                if let Some(process) = held.get().and_then(Weak::upgrade) {
                    process.terminate(&Escalation::msg("first"));
                    process.terminate(&Escalation::msg("second"));
                    let finished = process.completion().report().is_some();
                    recorder.record(format!("finished:{finished}"));
                }
                Ok(None)
            }),
        );
        let office = OfficeDescriptor::new("sales")
            .managed_object(ManagedObjectDescriptor::new("door", "door", ManagedObjectScope::Thread))
            .function(FunctionDescriptor::new("enter", "enter").object("door", "door"))
            .function(FunctionDescriptor::new("child", "child"))
            .function(FunctionDescriptor::new("hold", "hold"));
        (PassiveOffice::load(&registry, &office), slot)
    }

    fn root_thread(process: &ProcessState) -> Arc<ThreadState> {
        Arc::clone(&process.inner.lock().threads[0])
    }

    #[test]
    fn process_completes_and_releases_its_guard() {
        let journal = Journal::default();
        let (office, _) = door_office(&journal);
        let process = office.start("child");

        let report = process.completion().report().unwrap();
        assert!(report.outcome.is_completed());
        assert_eq!(report.threads.len(), 1);
        assert_eq!(journal.count("child"), 1);
        assert_eq!(office.runtime.shutdown.in_flight_count(), 0);
        assert!(office.runtime.processes.is_empty());

        process.finish_if_idle();
        process.terminate(&Escalation::msg("late"));
        assert!(process.completion().report().unwrap().outcome.is_completed());
    }

    #[test]
    fn terminate_reaches_a_child_registered_before_it() {
        let journal = Journal::default();
        let (office, _) = door_office(&journal);
        let process = office.start("enter");
        let root = root_thread(&process);
        assert_eq!(root.summary().status, ThreadStatus::Waiting);

        let child = process
            .new_thread(office.function("child"), Some(&root))
            .unwrap();
        process.terminate(&EngineEscalation::Shutdown.into());

        let report = process.completion().report().unwrap();
        assert!(report.outcome.escalation().unwrap().is_shutdown());
        assert_eq!(report.threads.len(), 2);
        assert!(report
            .threads
            .iter()
            .all(|thread| thread.status == ThreadStatus::Escalated));

        child.start(Invocation::new(office.function("child"), None));
        assert_eq!(journal.count("child"), 0);
        assert!(process.new_thread(office.function("child"), None).is_none());
    }

    #[test]
    fn first_terminating_escalation_is_the_outcome() {
        let journal = Journal::default();
        let (office, slot) = door_office(&journal);
        let process = office.start("enter");
        let root = root_thread(&process);
        slot.set(Arc::downgrade(&process)).unwrap();

        let holder = process.new_thread(office.function("hold"), None).unwrap();
        holder.start(Invocation::new(office.function("hold"), None));

        assert_eq!(journal.entries(), vec!["finished:false"]);
        let report = process.completion().report().unwrap();
        assert_eq!(report.outcome.escalation().unwrap().to_string(), "first");
        assert_eq!(root.summary().escalation.unwrap().to_string(), "first");
        let sources: Vec<_> = report
            .cleanup_escalations
            .iter()
            .map(|cleanup| cleanup.source.as_str())
            .collect();
        assert_eq!(sources, vec!["enter"]);
    }

    #[test]
    fn terminating_process_refuses_new_threads() {
        let journal = Journal::default();
        let (office, _) = door_office(&journal);
        let process = office.start("enter");
        let root = root_thread(&process);

        process.terminate(&Escalation::msg("stop"));
        assert!(process
            .new_thread(office.function("child"), Some(&root))
            .is_none());
        let report = process.completion().report().unwrap();
        assert_eq!(report.threads.len(), 1);
        assert_eq!(report.threads[0].status, ThreadStatus::Escalated);
    }
}
