use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use officefloor_core::{
    CleanupEscalation, EngineEscalation, Escalation, FlowInstigation, GovernanceAction,
    ManagedObjectScope, ThreadId, Value,
};
use tracing::{debug, trace};

use super::{HandlerLevel, Invocation, ProcessState, ThreadState};
use crate::function::{FunctionContext, Invoker};
use crate::governance::{settle_all, GovernanceCycle, GovernanceState};
use crate::managed_object::{
    AsynchronousFlag, ManagedObjectContainer, ObjectRef, ScopeObjects, Waiter, Wakeable,
};
use crate::office::{FunctionMetaData, HandlerMetaData, OfficeMetaData};
use crate::team::{Job, JobContext, Rejected};

/// What a job waits on while parked.
enum ParkTarget {
    Flag(Arc<AsynchronousFlag>),
    Lease(Arc<ManagedObjectContainer>),
}

enum Step {
    /// The invocation finished; continue with the thread's next one.
    Next,
    Park(ParkTarget),
    /// The thread has nothing more for this job.
    Stop,
}

struct LoadedObject {
    index: usize,
    container: Arc<ManagedObjectContainer>,
    object: ObjectRef,
}

enum Loaded {
    Ready(Vec<LoadedObject>),
    Park(ParkTarget),
}

// ---------------------------------------------------------------------------
// FunctionJob
// ---------------------------------------------------------------------------

/// Runs a thread's invocations, one at a time, on the teams of their
/// functions.
pub(crate) struct FunctionJob {
    thread: Arc<ThreadState>,
    invocation: Invocation,
    /// Escalation to raise instead of running the function, set when a
    /// parked job is resumed by a timeout.
    pending: Option<Escalation>,
    function_objects: ScopeObjects,
    /// Governances this invocation activated.
    activated: Vec<usize>,
}

impl FunctionJob {
    pub fn new(thread: Arc<ThreadState>, invocation: Invocation) -> Box<Self> {
        Box::new(Self {
            thread,
            invocation,
            pending: None,
            function_objects: ScopeObjects::new(),
            activated: Vec::new(),
        })
    }

    fn office(&self) -> Arc<OfficeMetaData> {
        Arc::clone(self.thread.process().office())
    }

    fn function_name(&self) -> String {
        self.thread
            .process()
            .office()
            .functions
            .get(self.invocation.function)
            .map_or_else(String::new, |function| function.name.clone())
    }

    /// Hands the job to the team of its current function.
    pub fn dispatch(self: Box<Self>) {
        let team = self
            .thread
            .process()
            .office()
            .team_of(self.invocation.function)
            .map(|binding| Arc::clone(&binding.team));
        let Some(team) = team else {
            self.cancel(Escalation::msg("function has no team"));
            return;
        };
        if let Err(Rejected(job)) = team.assign_job(self) {
            job.cancel(EngineEscalation::Shutdown.into());
        }
    }

    /// Resumes a parked job, raising `escalation` in place of the function
    /// if one is given.
    pub fn resume(mut self: Box<Self>, escalation: Option<Escalation>) {
        if escalation.is_some() {
            self.pending = escalation;
        }
        self.dispatch();
    }

    /// Gives up on the job: its invocation is recorded as a cleanup
    /// escalation and the thread ends.
    pub fn abandon(mut self: Box<Self>, escalation: Escalation) {
        self.abandon_current(&escalation);
        let thread = Arc::clone(&self.thread);
        drop(self);
        thread.escalated(escalation);
        thread.job_stopped();
    }

    fn begin(&mut self, invocation: Invocation) {
        self.invocation = invocation;
        self.pending = None;
        self.function_objects = ScopeObjects::new();
        self.activated.clear();
    }

    fn abandon_current(&mut self, escalation: &Escalation) {
        debug!(thread = %self.thread.id(), function = %self.function_name(), error = %escalation, "job abandoned");
        self.thread.process().add_cleanups(vec![CleanupEscalation::new(
            self.function_name(),
            escalation.clone(),
        )]);
        self.disregard_activated();
        self.close_function_scope(false);
    }

    // -- execution ----------------------------------------------------------

    fn execute(&mut self, context: &JobContext) -> Step {
        let thread = Arc::clone(&self.thread);
        let process = Arc::clone(thread.process());
        let office = self.office();
        let Some(function) = office.functions.get(self.invocation.function) else {
            return Step::Stop;
        };

        if let Some(escalation) = thread.termination() {
            self.abandon_current(&escalation);
            return Step::Stop;
        }
        if let Some(escalation) = self.pending.take() {
            return self.escalate(function, escalation);
        }

        let loaded = match self.load_objects(&process, &thread, function) {
            Ok(Loaded::Ready(loaded)) => loaded,
            Ok(Loaded::Park(target)) => return Step::Park(target),
            Err(escalation) => return self.escalate(function, escalation),
        };
        if let Some(container) = acquire_leases(&loaded, thread.id()) {
            return Step::Park(ParkTarget::Lease(container));
        }
        if let Err(escalation) = self.apply_governance(&process, function, &loaded) {
            release_leases(&loaded, thread.id());
            return self.escalate(function, escalation);
        }

        let objects: Vec<ObjectRef> = function
            .objects
            .iter()
            .filter_map(|index| {
                loaded
                    .iter()
                    .find(|object| object.index == *index)
                    .map(|object| Arc::clone(&object.object))
            })
            .collect();
        trace!(thread = %thread.id(), function = %function.name, "executing function");
        let result = {
            let mut function_context = FunctionContext::new(
                Invoker {
                    function: &function.name,
                    process_id: process.id(),
                    thread_id: thread.id(),
                    job: context,
                },
                self.invocation.argument.take(),
                self.invocation.escalation.clone(),
                objects,
                &function.object_keys,
                &function.flow_keys,
            );
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                function.function.execute(&mut function_context)
            }))
            .unwrap_or_else(|panic| {
                Err(Escalation::msg(format!(
                    "function {} panicked: {}",
                    function.name,
                    panic_message(panic.as_ref())
                )))
            });
            outcome.map(|value| (value, function_context.into_flows()))
        };
        release_leases(&loaded, thread.id());

        match result {
            Ok((value, flows)) => self.complete(&process, &thread, function, value, flows),
            Err(escalation) => self.escalate(function, escalation),
        }
    }

    fn load_objects(
        &self,
        process: &Arc<ProcessState>,
        thread: &ThreadState,
        function: &FunctionMetaData,
    ) -> Result<Loaded, Escalation> {
        let office = process.office();
        let mut loaded: Vec<LoadedObject> = Vec::with_capacity(function.load_order.len());
        for &index in &function.load_order {
            let Some(meta) = office.managed_objects.get(index) else {
                continue;
            };
            let scope = match meta.scope {
                ManagedObjectScope::Function => &self.function_objects,
                ManagedObjectScope::Thread => thread.objects(),
                ManagedObjectScope::Process => process.objects(),
            };
            let container = scope
                .get_or_create(index, || process.new_container(meta))
                .ok_or_else(|| EngineEscalation::ObjectSourcing {
                    object: meta.name.clone(),
                    reason: "scope has been torn down".to_string(),
                })?;
            let dependencies = meta
                .dependencies
                .iter()
                .filter_map(|(key, dependency)| {
                    loaded
                        .iter()
                        .find(|object| object.index == *dependency)
                        .map(|object| (key.clone(), Arc::clone(&object.object)))
                })
                .collect();
            let object = container.load(dependencies)?;
            if let Some(flag) = container.flag() {
                if !flag.is_ready() {
                    trace!(thread = %thread.id(), object = %meta.name, "object not ready");
                    return Ok(Loaded::Park(ParkTarget::Flag(Arc::clone(flag))));
                }
            }
            loaded.push(LoadedObject {
                index,
                container,
                object,
            });
        }
        Ok(Loaded::Ready(loaded))
    }

    /// Runs the function's governance actions, then brings its loaded
    /// objects under every active governance covering them. Governance code
    /// runs with the process's governance lock released.
    fn apply_governance(
        &mut self,
        process: &ProcessState,
        function: &FunctionMetaData,
        loaded: &[LoadedObject],
    ) -> Result<(), Escalation> {
        let mut closed: Vec<(GovernanceCycle, bool)> = Vec::new();
        {
            let mut governance = process.governance().lock();
            for &(index, action) in &function.governances {
                let Some(container) = governance.get_mut(index) else {
                    continue;
                };
                let active = container.state() == GovernanceState::Active;
                match action {
                    GovernanceAction::Activate if !active => {
                        container.activate();
                        self.activated.push(index);
                    }
                    GovernanceAction::Enforce if active => {
                        closed.extend(container.close_cycle(true)?.map(|cycle| (cycle, true)));
                    }
                    GovernanceAction::Disregard if active => {
                        closed.extend(container.close_cycle(false)?.map(|cycle| (cycle, false)));
                    }
                    _ => {}
                }
            }
        }
        for (position, (cycle, enforce)) in closed.iter().enumerate() {
            let result = if *enforce {
                cycle.enforce()
            } else {
                cycle.disregard()
            };
            if let Err(e) = result {
                let mut cleanups = if *enforce { cycle.settle(false) } else { Vec::new() };
                for (remaining, _) in &closed[position + 1..] {
                    cleanups.extend(remaining.settle(false));
                }
                process.add_cleanups(cleanups);
                return Err(e.into());
            }
        }

        let mut governing = Vec::new();
        let planned = plan_governing(process, loaded, &mut governing);
        for (cycle, extension, object) in governing {
            cycle.govern(extension, object)?;
        }
        planned
    }

    fn complete(
        &mut self,
        process: &Arc<ProcessState>,
        thread: &Arc<ThreadState>,
        function: &FunctionMetaData,
        value: Option<Value>,
        flows: Vec<(usize, Option<Value>)>,
    ) -> Step {
        self.activated.clear();
        self.close_function_scope(true);

        let mut sequential = Vec::new();
        let mut spawned = Vec::new();
        for (index, argument) in flows {
            let Some(flow) = function.flows.get(index) else {
                continue;
            };
            let invocation = Invocation::new(flow.function, argument);
            match flow.instigation {
                FlowInstigation::Sequential => sequential.push(invocation),
                FlowInstigation::Parallel | FlowInstigation::Asynchronous => {
                    spawned.push((flow.instigation, invocation));
                }
            }
        }
        if let Some(next) = function.next {
            sequential.push(Invocation::new(next, value));
        }
        thread.push_front(sequential);

        for (instigation, invocation) in spawned {
            let parallel = instigation == FlowInstigation::Parallel;
            let parent = parallel.then_some(thread);
            match process.new_thread(invocation.function, parent) {
                Some(child) => child.start(invocation),
                None => debug!(thread = %thread.id(), "flow not started, process is terminating"),
            }
        }
        Step::Next
    }

    fn escalate(&mut self, function: &FunctionMetaData, escalation: Escalation) -> Step {
        debug!(
            thread = %self.thread.id(),
            function = %function.name,
            error = %escalation,
            "function escalated"
        );
        self.disregard_activated();
        self.close_function_scope(false);

        let office = self.office();
        let level = self.invocation.level;
        let handler = (level == HandlerLevel::None)
            .then(|| find_handler(&function.handlers, &escalation, HandlerLevel::Function))
            .flatten()
            .or_else(|| {
                (level <= HandlerLevel::Function)
                    .then(|| find_handler(&office.thread_handlers, &escalation, HandlerLevel::Thread))
                    .flatten()
            });

        let thread = Arc::clone(&self.thread);
        match handler {
            Some(handler) => {
                if thread.redirect(handler, &escalation) {
                    thread.process().record_handled(escalation);
                    Step::Next
                } else {
                    Step::Stop
                }
            }
            None => {
                thread.escalated(escalation.clone());
                thread.process().escalate(escalation);
                Step::Stop
            }
        }
    }

    // -- scope teardown -----------------------------------------------------

    fn disregard_activated(&mut self) {
        if self.activated.is_empty() {
            return;
        }
        let process = Arc::clone(self.thread.process());
        let cycles: Vec<GovernanceCycle> = {
            let mut governance = process.governance().lock();
            std::mem::take(&mut self.activated)
                .into_iter()
                .filter_map(|index| {
                    let container = governance.get_mut(index)?;
                    if container.state() != GovernanceState::Active {
                        return None;
                    }
                    container.close_cycle(false).ok().flatten()
                })
                .collect()
        };
        process.add_cleanups(settle_all(&cycles, false));
    }

    /// Settles governance over the function-scoped objects and recycles
    /// them.
    fn close_function_scope(&mut self, enforce: bool) {
        let containers = self.function_objects.take_all();
        self.thread.process().close_scope(&containers, enforce);
    }

    // -- parking ------------------------------------------------------------

    fn park(self: Box<Self>, target: ParkTarget) {
        let thread = Arc::clone(&self.thread);
        match thread.store_parked(self) {
            Err(job) => {
                let escalation = thread
                    .termination()
                    .unwrap_or_else(|| EngineEscalation::Shutdown.into());
                job.abandon(escalation);
            }
            Ok(token) => {
                trace!(thread = %thread.id(), token, "job parked");
                let waiter = Waiter {
                    target: Arc::clone(&thread) as Arc<dyn Wakeable>,
                    token,
                };
                let refused = match &target {
                    ParkTarget::Flag(flag) => flag.park(waiter).err(),
                    ParkTarget::Lease(container) => match container.lease() {
                        Some(lease) => lease.park(waiter).err(),
                        None => Some(waiter),
                    },
                };
                if let Some(waiter) = refused {
                    waiter.wake(None);
                }
            }
        }
    }
}

impl Job for FunctionJob {
    fn run(mut self: Box<Self>, context: &JobContext) {
        loop {
            match self.execute(context) {
                Step::Park(target) => {
                    self.park(target);
                    return;
                }
                Step::Stop => {
                    self.thread.job_stopped();
                    return;
                }
                Step::Next => {
                    let Some(invocation) = self.thread.next_invocation() else {
                        return;
                    };
                    self.begin(invocation);
                    let inline = context.continue_execution()
                        && self
                            .thread
                            .process()
                            .office()
                            .team_of(self.invocation.function)
                            .is_some_and(|binding| {
                                binding.id == context.team_id() || binding.team.is_passive()
                            });
                    if !inline {
                        self.dispatch();
                        return;
                    }
                }
            }
        }
    }

    fn cancel(self: Box<Self>, escalation: Escalation) {
        let process = Arc::clone(self.thread.process());
        self.abandon(escalation.clone());
        process.terminate(&escalation);
    }

    fn describe(&self) -> String {
        format!(
            "{} {} on {}",
            self.thread.process().office().name,
            self.function_name(),
            self.thread.id()
        )
    }
}

/// Marks the loaded objects as governed by each active governance covering
/// them, pushing the governing still to run. Objects marked before a failure
/// stay in `governing`.
fn plan_governing<'a>(
    process: &ProcessState,
    loaded: &'a [LoadedObject],
    governing: &mut Vec<(GovernanceCycle, ObjectRef, &'a str)>,
) -> Result<(), Escalation> {
    let mut governance = process.governance().lock();
    for index in governance.active() {
        let Some(container) = governance.get_mut(index) else {
            continue;
        };
        let meta = Arc::clone(container.meta());
        for object in loaded.iter().filter(|object| meta.covers(object.index)) {
            let extension = object
                .container
                .extension(&meta.extension)
                .ok_or_else(|| EngineEscalation::MissingExtension {
                    object: object.container.name().to_string(),
                    extension: meta.extension.clone(),
                })?;
            if let Some(cycle) = container.govern(object.container.id())? {
                governing.push((cycle, extension, object.container.name()));
            }
        }
    }
    Ok(())
}

fn find_handler(
    handlers: &[HandlerMetaData],
    escalation: &Escalation,
    level: HandlerLevel,
) -> Option<Invocation> {
    handlers
        .iter()
        .find(|handler| handler.matcher.matches(escalation))
        .map(|handler| Invocation::handler(handler.function, escalation.clone(), level))
}

/// Leases every leased object for `thread`, or none of them. Returns the
/// container whose lease is held elsewhere.
fn acquire_leases(loaded: &[LoadedObject], thread: ThreadId) -> Option<Arc<ManagedObjectContainer>> {
    let mut acquired = Vec::new();
    for object in loaded {
        let Some(lease) = object.container.lease() else {
            continue;
        };
        if lease.try_acquire(thread) {
            acquired.push(lease);
        } else {
            for lease in acquired {
                lease.release(thread);
            }
            return Some(Arc::clone(&object.container));
        }
    }
    None
}

fn release_leases(loaded: &[LoadedObject], thread: ThreadId) {
    for object in loaded {
        if let Some(lease) = object.container.lease() {
            lease.release(thread);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
