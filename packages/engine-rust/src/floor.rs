//! The office floor: opens offices, starts processes and closes down.
//!
//! `open()` compiles every office, starts the teams and the monitor thread,
//! then accepts invocations. `close()` delivers a shutdown escalation to
//! every running process, waits for them to drain and stops the teams. It is
//! idempotent and also runs on drop.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use officefloor_core::{
    AssetType, CollectedIssues, ConfigurationIssue, EngineEscalation, Escalation, IssueSink,
    OfficeDescriptor, ParameterError, ParameterType, ProcessId, Value,
};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::execute::{
    EngineRuntime, ProcessEscalationHandler, ProcessReport, ProcessState, ThreadSummary,
};
use crate::managed_object::TimeoutSweep;
use crate::monitor::{Monitor, MonitorClock};
use crate::office::{OfficeLoader, OfficeMetaData, SourceRegistry};
use crate::shutdown::FloorState;

/// Interval at which `close()` re-delivers the shutdown escalation while
/// waiting for processes to drain.
const DRAIN_POLL: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from opening an office floor.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("office floor has {} configuration issue(s)", .issues.len())]
    Configuration { issues: Vec<ConfigurationIssue> },
    #[error("failed to start team {team}")]
    TeamStart {
        team: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to start monitor")]
    Monitor(#[source] anyhow::Error),
}

/// Errors from starting a process.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("unknown office {office}")]
    UnknownOffice { office: String },
    #[error("office {office} has no function {function}")]
    UnknownFunction { office: String, function: String },
    #[error("office floor is not open")]
    Closed,
    #[error("invalid parameter for function {function}")]
    Parameter {
        function: String,
        #[source]
        source: ParameterError,
    },
}

// ---------------------------------------------------------------------------
// Reports and handles
// ---------------------------------------------------------------------------

/// What `close()` had to force.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseReport {
    /// Processes still running when closing started.
    pub processes_terminated: usize,
    /// Jobs queued on teams that never started.
    pub abandoned_jobs: usize,
    /// Team workers still busy when the close timeout expired.
    pub workers_still_running: usize,
    /// Processes that had not finished when the close timeout expired.
    pub processes_not_drained: usize,
}

/// Handle on a started process.
#[derive(Clone)]
pub struct ProcessHandle {
    process: Arc<ProcessState>,
}

impl ProcessHandle {
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.process.id()
    }

    /// Whether the process has finished and its objects are recycled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.process.completion().report().is_some()
    }

    /// The final report, once complete.
    #[must_use]
    pub fn report(&self) -> Option<Arc<ProcessReport>> {
        self.process.completion().report()
    }

    /// Blocks until the process completes.
    #[must_use]
    pub fn wait(&self) -> Arc<ProcessReport> {
        self.process.completion().wait()
    }

    /// Blocks until the process completes or `timeout` elapses.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Arc<ProcessReport>> {
        self.process.completion().wait_timeout(timeout)
    }

    /// Resolves once the process completes.
    pub async fn completed(&self) -> Option<Arc<ProcessReport>> {
        self.process.completion().completed().await
    }

    /// Current state of every thread of the process.
    #[must_use]
    pub fn threads(&self) -> Vec<ThreadSummary> {
        self.process.thread_summaries()
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id())
            .field("office", &self.process.office().name)
            .field("complete", &self.is_complete())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// OfficeFloor
// ---------------------------------------------------------------------------

/// Records issues locally and forwards them to the caller's sink.
struct ForwardingSink<'a> {
    collected: CollectedIssues,
    forward: Option<&'a dyn IssueSink>,
}

impl IssueSink for ForwardingSink<'_> {
    fn add_issue(&self, issue: ConfigurationIssue) {
        if let Some(forward) = self.forward {
            forward.add_issue(issue.clone());
        }
        self.collected.add_issue(issue);
    }
}

/// A set of opened offices sharing teams' lifecycle, the monitor clock and
/// shutdown.
pub struct OfficeFloor {
    runtime: Arc<EngineRuntime>,
    offices: Vec<Arc<OfficeMetaData>>,
    office_index: HashMap<String, usize>,
    monitor: Mutex<Option<Monitor>>,
    close_report: Mutex<Option<CloseReport>>,
}

impl OfficeFloor {
    /// Loads and opens `offices`.
    ///
    /// # Errors
    ///
    /// Returns `OpenError::Configuration` with every issue found if any
    /// office fails to load, or the failure to start a team or the monitor.
    pub fn open(
        config: EngineConfig,
        offices: &[OfficeDescriptor],
        registry: &SourceRegistry,
    ) -> Result<Self, OpenError> {
        Self::load_and_open(config, offices, registry, None)
    }

    /// As [`OfficeFloor::open`], also reporting each issue to `sink` as it
    /// is found.
    ///
    /// # Errors
    ///
    /// As [`OfficeFloor::open`].
    pub fn open_with_issues(
        config: EngineConfig,
        offices: &[OfficeDescriptor],
        registry: &SourceRegistry,
        sink: &dyn IssueSink,
    ) -> Result<Self, OpenError> {
        Self::load_and_open(config, offices, registry, Some(sink))
    }

    fn load_and_open(
        config: EngineConfig,
        descriptors: &[OfficeDescriptor],
        registry: &SourceRegistry,
        forward: Option<&dyn IssueSink>,
    ) -> Result<Self, OpenError> {
        let clock = MonitorClock::new();
        let sink = ForwardingSink {
            collected: CollectedIssues::new(),
            forward,
        };

        let mut offices = Vec::with_capacity(descriptors.len());
        {
            let mut loader = OfficeLoader::new(registry, &config, &clock, &sink);
            let mut names = HashSet::new();
            for descriptor in descriptors {
                if !names.insert(descriptor.name.as_str()) {
                    sink.add_issue(ConfigurationIssue {
                        office: descriptor.name.clone(),
                        asset_type: AssetType::Office,
                        asset_name: descriptor.name.clone(),
                        message: "office is configured more than once".to_string(),
                    });
                    continue;
                }
                if let Some(office) = loader.load(descriptor) {
                    offices.push(Arc::new(office));
                }
            }
        }
        if !sink.collected.is_empty() {
            return Err(OpenError::Configuration {
                issues: sink.collected.issues(),
            });
        }

        let runtime = Arc::new(EngineRuntime::new(config, clock));
        let mut started = Vec::new();
        for office in &offices {
            for binding in &office.teams {
                if let Err(source) = binding.team.start_working() {
                    let team = format!("{}.{}", office.name, binding.name);
                    warn!(team = %team, error = %source, "team failed to start");
                    stop_teams(&started, runtime.config.close_timeout());
                    return Err(OpenError::TeamStart { team, source });
                }
                info!(office = %office.name, team = %binding.name, "team started");
                started.push(Arc::clone(&binding.team));
            }
        }

        let monitor = Monitor::start(
            runtime.clock.clone(),
            TimeoutSweep {
                flags: Arc::clone(&runtime.flags),
            },
            runtime.config.monitor_interval(),
            format!("{}-monitor", runtime.config.thread_name_prefix),
        )
        .map_err(|source| {
            stop_teams(&started, runtime.config.close_timeout());
            OpenError::Monitor(source)
        })?;

        let office_index = offices
            .iter()
            .enumerate()
            .map(|(index, office)| (office.name.clone(), index))
            .collect();
        runtime.shutdown.set_open();
        info!(offices = offices.len(), teams = started.len(), "office floor open");
        Ok(Self {
            runtime,
            offices,
            office_index,
            monitor: Mutex::new(Some(monitor)),
            close_report: Mutex::new(None),
        })
    }

    fn office(&self, office: &str) -> Result<&Arc<OfficeMetaData>, InvokeError> {
        self.office_index
            .get(office)
            .and_then(|index| self.offices.get(*index))
            .ok_or_else(|| InvokeError::UnknownOffice {
                office: office.to_string(),
            })
    }

    // -- invocation ---------------------------------------------------------

    /// Starts a process running `function` of `office` with `argument`.
    ///
    /// An escalation that no function or thread handler resolves terminates
    /// the process.
    ///
    /// # Errors
    ///
    /// Fails for unknown names and once the floor is closing.
    pub fn invoke(
        &self,
        office: &str,
        function: &str,
        argument: Option<Value>,
    ) -> Result<ProcessHandle, InvokeError> {
        self.start_process(office, function, argument, None)
    }

    /// As [`OfficeFloor::invoke`], with `handler` resolving escalations
    /// that reach process scope.
    ///
    /// # Errors
    ///
    /// As [`OfficeFloor::invoke`].
    pub fn invoke_with_handler<H: ProcessEscalationHandler>(
        &self,
        office: &str,
        function: &str,
        argument: Option<Value>,
        handler: H,
    ) -> Result<ProcessHandle, InvokeError> {
        self.start_process(office, function, argument, Some(Arc::new(handler)))
    }

    /// Starts a process from a string-encoded parameter, parsed according
    /// to the function's declared parameter type. Functions declaring no
    /// parameter type receive the string as is.
    ///
    /// # Errors
    ///
    /// Also fails with `InvokeError::Parameter` if the string does not parse.
    pub fn invoke_by_name(
        &self,
        office: &str,
        function: &str,
        parameter: Option<&str>,
    ) -> Result<ProcessHandle, InvokeError> {
        let argument = match (self.parameter_type(office, function)?, parameter) {
            (_, None) => None,
            (Some(parameter_type), Some(raw)) => {
                Some(parameter_type.parse(raw).map_err(|source| InvokeError::Parameter {
                    function: function.to_string(),
                    source,
                })?)
            }
            (None, Some(raw)) => Some(Value::String(raw.to_string())),
        };
        self.invoke(office, function, argument)
    }

    fn start_process(
        &self,
        office: &str,
        function: &str,
        argument: Option<Value>,
        handler: Option<Arc<dyn ProcessEscalationHandler>>,
    ) -> Result<ProcessHandle, InvokeError> {
        let meta = self.office(office)?;
        let index = meta
            .function_index(function)
            .ok_or_else(|| InvokeError::UnknownFunction {
                office: office.to_string(),
                function: function.to_string(),
            })?;
        let guard = self
            .runtime
            .shutdown
            .begin_process()
            .ok_or(InvokeError::Closed)?;
        let process = ProcessState::start(&self.runtime, meta, index, argument, handler, guard);
        Ok(ProcessHandle { process })
    }

    // -- introspection ------------------------------------------------------

    #[must_use]
    pub fn office_names(&self) -> Vec<String> {
        self.offices.iter().map(|office| office.name.clone()).collect()
    }

    /// Function names of `office`, in configuration order.
    ///
    /// # Errors
    ///
    /// Fails if the office is unknown.
    pub fn function_names(&self, office: &str) -> Result<Vec<String>, InvokeError> {
        Ok(self.office(office)?.function_names())
    }

    /// Declared parameter type of a function.
    ///
    /// # Errors
    ///
    /// Fails if the office or function is unknown.
    pub fn parameter_type(
        &self,
        office: &str,
        function: &str,
    ) -> Result<Option<ParameterType>, InvokeError> {
        self.office(office)?
            .function(function)
            .map(|meta| meta.parameter)
            .ok_or_else(|| InvokeError::UnknownFunction {
                office: office.to_string(),
                function: function.to_string(),
            })
    }

    #[must_use]
    pub fn state(&self) -> FloorState {
        self.runtime.shutdown.state()
    }

    /// Number of processes started and not yet complete.
    #[must_use]
    pub fn active_processes(&self) -> usize {
        self.runtime.processes.len()
    }

    // -- close --------------------------------------------------------------

    /// Closes the floor.
    ///
    /// 1. Refuses new invocations
    /// 2. Terminates every running process with a shutdown escalation
    /// 3. Waits up to the close timeout for them to finish
    /// 4. Stops the teams, cancelling jobs they never started
    /// 5. Stops the monitor
    ///
    /// Calling it again returns the first report.
    pub fn close(&self) -> CloseReport {
        let mut slot = self.close_report.lock();
        if let Some(report) = slot.as_ref() {
            return report.clone();
        }
        self.runtime.shutdown.trigger_close();
        info!(active = self.active_processes(), "closing office floor");

        let shutdown: Escalation = EngineEscalation::Shutdown.into();
        let timeout = self.runtime.config.close_timeout();
        let deadline = Instant::now() + timeout;
        let mut terminated = HashSet::new();
        let drained = loop {
            let processes: Vec<Arc<ProcessState>> = self
                .runtime
                .processes
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            for process in processes {
                if terminated.insert(process.id()) {
                    process.terminate(&shutdown);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.runtime.shutdown.wait_for_drain(remaining.min(DRAIN_POLL)) {
                break true;
            }
            if remaining.is_zero() {
                break false;
            }
        };
        let processes_not_drained = if drained {
            0
        } else {
            usize::try_from(self.runtime.shutdown.in_flight_count()).unwrap_or(usize::MAX)
        };

        let teams: Vec<_> = self
            .offices
            .iter()
            .flat_map(|office| office.teams.iter().map(|binding| Arc::clone(&binding.team)))
            .collect();
        let (abandoned_jobs, workers_still_running) = stop_teams(&teams, timeout);

        if let Some(mut monitor) = self.monitor.lock().take() {
            monitor.stop();
        }
        self.runtime.shutdown.set_closed();

        let report = CloseReport {
            processes_terminated: terminated.len(),
            abandoned_jobs,
            workers_still_running,
            processes_not_drained,
        };
        if processes_not_drained > 0 || workers_still_running > 0 {
            warn!(?report, "office floor closed without draining");
        } else {
            info!(?report, "office floor closed");
        }
        *slot = Some(report.clone());
        report
    }
}

impl Drop for OfficeFloor {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for OfficeFloor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfficeFloor")
            .field("offices", &self.office_names())
            .field("state", &self.state())
            .field("active_processes", &self.active_processes())
            .finish_non_exhaustive()
    }
}

/// Stops `teams`, cancelling the jobs they never started. Returns the
/// number of cancelled jobs and of workers still running.
fn stop_teams(teams: &[Arc<dyn crate::team::Team>], timeout: Duration) -> (usize, usize) {
    for team in teams {
        team.request_stop();
    }
    let shutdown: Escalation = EngineEscalation::Shutdown.into();
    let mut abandoned = 0;
    let mut still_running = 0;
    for team in teams {
        let report = team.stop_working(timeout);
        abandoned += report.unstarted.len();
        still_running += report.workers_still_running;
        for job in report.unstarted {
            job.cancel(shutdown.clone());
        }
        info!(team = team.name(), "team stopped");
    }
    (abandoned, still_running)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
