//! Scheduling of function invocations within threads and processes.
//!
//! A [`ProcessState`] is created per invocation of an office function. It
//! starts one [`ThreadState`], and each thread runs its invocations one at a
//! time through a [`FunctionJob`] handed to the function's team. Jobs park
//! on asynchronous objects and object leases without holding a worker, and
//! escalations walk the handler chain function, thread, process.

mod job;
mod process;
mod thread;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use officefloor_core::{
    CleanupEscalation, Escalation, ManagedObjectId, ProcessId, ThreadId, Value,
};
use serde::Serialize;

pub(crate) use job::FunctionJob;
pub(crate) use process::ProcessState;
pub(crate) use thread::ThreadState;

use crate::config::EngineConfig;
use crate::managed_object::FlagRegistry;
use crate::monitor::MonitorClock;
use crate::shutdown::ShutdownController;

// ---------------------------------------------------------------------------
// EngineRuntime
// ---------------------------------------------------------------------------

/// State shared by every process of an office floor.
pub(crate) struct EngineRuntime {
    pub config: EngineConfig,
    pub clock: MonitorClock,
    pub flags: Arc<FlagRegistry>,
    pub shutdown: ShutdownController,
    pub processes: DashMap<ProcessId, Arc<ProcessState>>,
    next_process: AtomicU64,
    next_thread: AtomicU64,
    next_managed_object: AtomicU64,
}

impl EngineRuntime {
    pub fn new(config: EngineConfig, clock: MonitorClock) -> Self {
        Self {
            config,
            clock,
            flags: Arc::new(FlagRegistry::new()),
            shutdown: ShutdownController::new(),
            processes: DashMap::new(),
            next_process: AtomicU64::new(1),
            next_thread: AtomicU64::new(1),
            next_managed_object: AtomicU64::new(1),
        }
    }

    pub fn next_process_id(&self) -> ProcessId {
        ProcessId(self.next_process.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_thread_id(&self) -> ThreadId {
        ThreadId(self.next_thread.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_managed_object_id(&self) -> ManagedObjectId {
        ManagedObjectId(self.next_managed_object.fetch_add(1, Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Which handler list ran the invocation. An escalation raised by a handler
/// resumes the search one level up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum HandlerLevel {
    None,
    Function,
    Thread,
}

/// One queued call of a function on a thread.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub function: usize,
    pub argument: Option<Value>,
    pub escalation: Option<Escalation>,
    pub level: HandlerLevel,
}

impl Invocation {
    pub fn new(function: usize, argument: Option<Value>) -> Self {
        Self {
            function,
            argument,
            escalation: None,
            level: HandlerLevel::None,
        }
    }

    pub fn handler(function: usize, escalation: Escalation, level: HandlerLevel) -> Self {
        Self {
            function,
            argument: None,
            escalation: Some(escalation),
            level,
        }
    }
}

// ---------------------------------------------------------------------------
// Process escalation handler
// ---------------------------------------------------------------------------

/// Last handler in the chain, installed per process by
/// `OfficeFloor::invoke_with_handler`.
pub trait ProcessEscalationHandler: Send + Sync + 'static {
    fn handle(&self, escalation: &Escalation);
}

impl<F> ProcessEscalationHandler for F
where
    F: Fn(&Escalation) + Send + Sync + 'static,
{
    fn handle(&self, escalation: &Escalation) {
        self(escalation);
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Lifecycle state of a thread of execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadStatus {
    /// Executing or queued jobs exist.
    Running,
    /// The thread's job is parked on an asynchronous object or a lease.
    Waiting,
    /// The thread's continuation waits for its parallel children.
    Spawning,
    Complete,
    /// An escalation no handler of the thread resolved ended the thread.
    Escalated,
}

/// State of one thread of a process.
#[derive(Debug, Clone)]
pub struct ThreadSummary {
    pub thread_id: ThreadId,
    /// Function the thread started with.
    pub function: String,
    pub status: ThreadStatus,
    pub escalation: Option<Escalation>,
}

/// How a process ended.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Completed,
    /// An escalation reached process scope with no handler, or the floor
    /// was closed underneath the process.
    Escalated(Escalation),
}

impl ProcessOutcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, ProcessOutcome::Completed)
    }

    #[must_use]
    pub fn escalation(&self) -> Option<&Escalation> {
        match self {
            ProcessOutcome::Completed => None,
            ProcessOutcome::Escalated(escalation) => Some(escalation),
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::Completed => "completed",
            ProcessOutcome::Escalated(_) => "escalated",
        }
    }
}

/// Final report of a process, available once every managed object bound to
/// it has been recycled.
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub process_id: ProcessId,
    pub office: String,
    pub outcome: ProcessOutcome,
    /// Escalations resolved by a function, thread or process handler.
    pub handled_escalations: Vec<Escalation>,
    /// Failures collected while tearing down scopes, in the order they
    /// occurred.
    pub cleanup_escalations: Vec<CleanupEscalation>,
    /// Final state of every thread, in the order they finished.
    pub threads: Vec<ThreadSummary>,
}
