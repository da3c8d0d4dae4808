//! Governance: cross-cutting enforcement over managed objects.
//!
//! A governance covers managed objects that expose its extension interface.
//! Each process keeps one [`GovernanceContainer`] per configured governance
//! and drives it through an activation cycle:
//!
//! ```text
//! Unregistered -> Active -> Enforced | Disregarded -> Active -> ...
//! ```
//!
//! A governed object may only be recycled once its governance has been
//! enforced or disregarded. Closing a cycle happens under the process's
//! governance lock; the governance's own code runs on the returned
//! [`GovernanceCycle`] once that lock is released.

use std::any::Any;
use std::sync::Arc;

use officefloor_core::{CleanupEscalation, EngineEscalation, Escalation, ManagedObjectId};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::managed_object::{ObjectRef, SourceContext};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// One activation cycle of a governance.
pub trait Governance: Send + 'static {
    /// Brings the extension of a managed object under governance.
    ///
    /// # Errors
    ///
    /// Returns an escalation if the object cannot be governed.
    fn govern(&mut self, extension: ObjectRef, object: &str) -> Result<(), Escalation>;

    /// Commits pending effects.
    ///
    /// # Errors
    ///
    /// Returns an escalation if the effects cannot be committed.
    fn enforce(&mut self) -> Result<(), Escalation>;

    /// Discards pending effects.
    ///
    /// # Errors
    ///
    /// Returns an escalation if the effects cannot be discarded.
    fn disregard(&mut self) -> Result<(), Escalation>;
}

/// Factory for governance instances.
pub trait GovernanceSource: Send + Sync + 'static {
    /// Names of properties that must be configured.
    fn specification(&self) -> &[&'static str] {
        &[]
    }

    /// Initialises the source from its configuration.
    ///
    /// # Errors
    ///
    /// Any error becomes a configuration issue.
    fn init(&mut self, _context: &SourceContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Creates the instance for a new activation cycle.
    fn create(&self) -> Box<dyn Governance>;
}

/// Downcasts a governed extension to its concrete interface.
#[must_use]
pub fn extension_as<T: Any + Send + Sync>(extension: &ObjectRef) -> Option<Arc<T>> {
    Arc::clone(extension).downcast::<T>().ok()
}

// ---------------------------------------------------------------------------
// Metadata and errors
// ---------------------------------------------------------------------------

/// A governance as compiled by the office loader.
pub struct GovernanceMetaData {
    pub index: usize,
    pub name: String,
    pub extension: String,
    /// Indices of the managed objects it covers.
    pub managed_objects: Vec<usize>,
    pub source: Arc<dyn GovernanceSource>,
}

impl GovernanceMetaData {
    #[must_use]
    pub fn covers(&self, managed_object: usize) -> bool {
        self.managed_objects.contains(&managed_object)
    }
}

/// State of a governance within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernanceState {
    Unregistered,
    Active,
    Enforced,
    Disregarded,
}

/// Errors from driving a governance.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GovernanceError {
    #[error("governance {governance} is {state:?}, not active")]
    NotActive {
        governance: String,
        state: GovernanceState,
    },
    #[error("governance {governance} failed to {action}: {escalation}")]
    Failed {
        governance: String,
        action: &'static str,
        escalation: Escalation,
    },
}

impl From<GovernanceError> for Escalation {
    fn from(error: GovernanceError) -> Self {
        match error {
            GovernanceError::NotActive { governance, state } => {
                EngineEscalation::Governance {
                    governance,
                    action: "use",
                    reason: format!("governance is {state:?}"),
                }
                .into()
            }
            GovernanceError::Failed {
                governance,
                action,
                escalation,
            } => EngineEscalation::Governance {
                governance,
                action,
                reason: escalation.to_string(),
            }
            .into(),
        }
    }
}

// ---------------------------------------------------------------------------
// GovernanceCycle
// ---------------------------------------------------------------------------

/// The governance instance of one activation cycle.
///
/// Handed out by [`GovernanceContainer`] so the governance's own code runs
/// after the process's governance lock is released.
#[derive(Clone)]
pub struct GovernanceCycle {
    name: String,
    instance: Arc<Mutex<Box<dyn Governance>>>,
}

impl GovernanceCycle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Brings the extension of a managed object under governance.
    ///
    /// # Errors
    ///
    /// Fails if the governance refuses the object.
    pub fn govern(&self, extension: ObjectRef, object: &str) -> Result<(), GovernanceError> {
        self.instance
            .lock()
            .govern(extension, object)
            .map_err(|escalation| self.failed("govern", escalation))
    }

    /// Commits the cycle's pending effects.
    ///
    /// # Errors
    ///
    /// Fails if the governance's enforce fails.
    pub fn enforce(&self) -> Result<(), GovernanceError> {
        self.instance
            .lock()
            .enforce()
            .map_err(|escalation| self.failed("enforce", escalation))
    }

    /// Discards the cycle's pending effects.
    ///
    /// # Errors
    ///
    /// Fails if the governance's disregard fails.
    pub fn disregard(&self) -> Result<(), GovernanceError> {
        self.instance
            .lock()
            .disregard()
            .map_err(|escalation| self.failed("disregard", escalation))
    }

    /// Settles the cycle during teardown. Failures are returned as cleanup
    /// escalations; a failed enforce falls back to disregard.
    pub fn settle(&self, enforce: bool) -> Vec<CleanupEscalation> {
        let mut cleanups = Vec::new();
        if enforce {
            match self.enforce() {
                Ok(()) => return cleanups,
                Err(e) => cleanups.push(self.cleanup(e)),
            }
        }
        if let Err(e) = self.disregard() {
            cleanups.push(self.cleanup(e));
        }
        cleanups
    }

    fn failed(&self, action: &'static str, escalation: Escalation) -> GovernanceError {
        GovernanceError::Failed {
            governance: self.name.clone(),
            action,
            escalation,
        }
    }

    fn cleanup(&self, error: GovernanceError) -> CleanupEscalation {
        warn!(governance = %self.name, error = %error, "governance failed during teardown");
        CleanupEscalation::new(self.name.clone(), Escalation::from(error))
    }
}

/// Settles every cycle in turn, collecting the failures.
pub fn settle_all(cycles: &[GovernanceCycle], enforce: bool) -> Vec<CleanupEscalation> {
    cycles.iter().flat_map(|cycle| cycle.settle(enforce)).collect()
}

// ---------------------------------------------------------------------------
// GovernanceContainer
// ---------------------------------------------------------------------------

/// A governance's state within one process.
pub struct GovernanceContainer {
    meta: Arc<GovernanceMetaData>,
    state: GovernanceState,
    cycle: Option<GovernanceCycle>,
    governed: Vec<ManagedObjectId>,
}

impl GovernanceContainer {
    #[must_use]
    pub fn new(meta: Arc<GovernanceMetaData>) -> Self {
        Self {
            meta,
            state: GovernanceState::Unregistered,
            cycle: None,
            governed: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> GovernanceState {
        self.state
    }

    #[must_use]
    pub fn meta(&self) -> &Arc<GovernanceMetaData> {
        &self.meta
    }

    /// Starts an activation cycle. A no-op while already active.
    pub fn activate(&mut self) {
        if self.state == GovernanceState::Active {
            return;
        }
        self.cycle = Some(GovernanceCycle {
            name: self.meta.name.clone(),
            instance: Arc::new(Mutex::new(self.meta.source.create())),
        });
        self.governed.clear();
        self.state = GovernanceState::Active;
        debug!(governance = %self.meta.name, "governance activated");
    }

    /// Records `id` as governed by the active cycle and returns the cycle to
    /// govern it with. Returns `None` if the cycle already governs it.
    ///
    /// # Errors
    ///
    /// Fails if the governance is not active.
    pub fn govern(&mut self, id: ManagedObjectId) -> Result<Option<GovernanceCycle>, GovernanceError> {
        self.ensure_active()?;
        if self.governed.contains(&id) {
            return Ok(None);
        }
        self.governed.push(id);
        Ok(self.cycle.clone())
    }

    /// Whether `id` is governed by the current active cycle.
    #[must_use]
    pub fn governs(&self, id: ManagedObjectId) -> bool {
        self.state == GovernanceState::Active && self.governed.contains(&id)
    }

    /// Whether the cycle governs any of `ids`.
    #[must_use]
    pub fn governs_any(&self, ids: &[ManagedObjectId]) -> bool {
        ids.iter().any(|id| self.governs(*id))
    }

    /// Ends the active cycle, enforced or disregarded, and returns it for
    /// the caller to settle.
    ///
    /// # Errors
    ///
    /// Fails if the governance is not active.
    pub fn close_cycle(&mut self, enforce: bool) -> Result<Option<GovernanceCycle>, GovernanceError> {
        self.ensure_active()?;
        let state = if enforce {
            GovernanceState::Enforced
        } else {
            GovernanceState::Disregarded
        };
        self.governed.clear();
        self.state = state;
        debug!(governance = %self.meta.name, ?state, "governance cycle ended");
        Ok(self.cycle.take())
    }

    fn ensure_active(&self) -> Result<(), GovernanceError> {
        if self.state != GovernanceState::Active {
            return Err(GovernanceError::NotActive {
                governance: self.meta.name.clone(),
                state: self.state,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GovernanceSet
// ---------------------------------------------------------------------------

/// The governance containers of one process.
pub struct GovernanceSet {
    containers: Vec<GovernanceContainer>,
}

impl GovernanceSet {
    #[must_use]
    pub fn new(governances: &[Arc<GovernanceMetaData>]) -> Self {
        Self {
            containers: governances
                .iter()
                .map(|meta| GovernanceContainer::new(Arc::clone(meta)))
                .collect(),
        }
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut GovernanceContainer> {
        self.containers.get_mut(index)
    }

    /// Indices of the active governances.
    #[must_use]
    pub fn active(&self) -> Vec<usize> {
        self.containers
            .iter()
            .enumerate()
            .filter(|(_, container)| container.state() == GovernanceState::Active)
            .map(|(index, _)| index)
            .collect()
    }

    /// Closes every active cycle governing one of `ids`.
    pub fn close_for(&mut self, ids: &[ManagedObjectId], enforce: bool) -> Vec<GovernanceCycle> {
        self.containers
            .iter_mut()
            .filter(|container| container.governs_any(ids))
            .filter_map(|container| container.close_cycle(enforce).ok().flatten())
            .collect()
    }

    /// Closes every active cycle.
    pub fn close_all(&mut self, enforce: bool) -> Vec<GovernanceCycle> {
        self.containers
            .iter_mut()
            .filter(|container| container.state() == GovernanceState::Active)
            .filter_map(|container| container.close_cycle(enforce).ok().flatten())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingGovernance {
        log: Arc<Mutex<Vec<String>>>,
        fail_enforce: bool,
    }

    impl Governance for RecordingGovernance {
        fn govern(&mut self, extension: ObjectRef, object: &str) -> Result<(), Escalation> {
            let tag = extension_as::<String>(&extension).map_or_else(String::new, |s| (*s).clone());
            self.log.lock().push(format!("govern {object} {tag}"));
            Ok(())
        }

        fn enforce(&mut self) -> Result<(), Escalation> {
            self.log.lock().push("enforce".to_string());
            if self.fail_enforce {
                return Err(Escalation::msg("commit failed"));
            }
            Ok(())
        }

        fn disregard(&mut self) -> Result<(), Escalation> {
            self.log.lock().push("disregard".to_string());
            Ok(())
        }
    }

    struct RecordingSource {
        log: Arc<Mutex<Vec<String>>>,
        fail_enforce: bool,
    }

    impl GovernanceSource for RecordingSource {
        fn create(&self) -> Box<dyn Governance> {
            Box::new(RecordingGovernance {
                log: Arc::clone(&self.log),
                fail_enforce: self.fail_enforce,
            })
        }
    }

    fn container(fail_enforce: bool) -> (GovernanceContainer, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let meta = GovernanceMetaData {
            index: 0,
            name: "transaction".to_string(),
            extension: "tx".to_string(),
            managed_objects: vec![0],
            source: Arc::new(RecordingSource {
                log: Arc::clone(&log),
                fail_enforce,
            }),
        };
        (GovernanceContainer::new(Arc::new(meta)), log)
    }

    fn extension(tag: &str) -> ObjectRef {
        Arc::new(tag.to_string())
    }

    #[test]
    fn activation_cycle_governs_then_enforces() {
        let (mut container, log) = container(false);
        assert_eq!(container.state(), GovernanceState::Unregistered);

        container.activate();
        let cycle = container.govern(ManagedObjectId(1)).unwrap().unwrap();
        cycle.govern(extension("a"), "db").unwrap();
        assert!(container.govern(ManagedObjectId(1)).unwrap().is_none());
        assert!(container.governs(ManagedObjectId(1)));

        let closed = container.close_cycle(true).unwrap().unwrap();
        assert_eq!(container.state(), GovernanceState::Enforced);
        assert!(!container.governs(ManagedObjectId(1)));
        assert_eq!(closed.name(), "transaction");
        closed.enforce().unwrap();
        assert_eq!(*log.lock(), vec!["govern db a", "enforce"]);

        // A new cycle starts from scratch.
        container.activate();
        assert_eq!(container.state(), GovernanceState::Active);
        assert!(!container.governs(ManagedObjectId(1)));
    }

    #[test]
    fn using_inactive_governance_is_an_error() {
        let (mut container, _) = container(false);
        assert!(matches!(
            container.govern(ManagedObjectId(1)),
            Err(GovernanceError::NotActive {
                state: GovernanceState::Unregistered,
                ..
            })
        ));
        assert!(container.close_cycle(true).is_err());
    }

    #[test]
    fn failed_enforce_during_teardown_becomes_cleanup_then_disregards() {
        let (mut container, log) = container(true);
        container.activate();
        container
            .govern(ManagedObjectId(4))
            .unwrap()
            .unwrap()
            .govern(extension("a"), "db")
            .unwrap();

        let cycle = container.close_cycle(true).unwrap().unwrap();
        let cleanups = cycle.settle(true);
        assert_eq!(cleanups.len(), 1);
        assert_eq!(cleanups[0].source, "transaction");
        assert!(cleanups[0].escalation.to_string().contains("commit failed"));
        assert_eq!(*log.lock(), vec!["govern db a", "enforce", "disregard"]);
    }

    #[test]
    fn closed_cycle_runs_without_the_set_locked() {
        let (container, log) = container(false);
        let set = Mutex::new(GovernanceSet {
            containers: vec![container],
        });
        let cycles = {
            let mut governance = set.lock();
            let container = governance.get_mut(0).unwrap();
            container.activate();
            container.govern(ManagedObjectId(1)).unwrap();
            governance.close_all(true)
        };
        assert!(set.try_lock().is_some());
        assert!(settle_all(&cycles, true).is_empty());
        assert_eq!(*log.lock(), vec!["enforce"]);
    }

    #[test]
    fn set_closes_only_governances_covering_ids() {
        let (first, first_log) = container(false);
        let (second, second_log) = container(false);
        let mut set = GovernanceSet {
            containers: vec![first, second],
        };
        for index in 0..2 {
            set.get_mut(index).unwrap().activate();
        }
        set.get_mut(0).unwrap().govern(ManagedObjectId(1)).unwrap();
        set.get_mut(1).unwrap().govern(ManagedObjectId(2)).unwrap();

        let closed = set.close_for(&[ManagedObjectId(1)], false);
        assert_eq!(closed.len(), 1);
        assert!(settle_all(&closed, false).is_empty());
        assert_eq!(set.active(), vec![1]);

        let rest = set.close_all(true);
        assert!(settle_all(&rest, true).is_empty());
        assert!(set.active().is_empty());
        assert_eq!(first_log.lock().last().map(String::as_str), Some("disregard"));
        assert_eq!(second_log.lock().last().map(String::as_str), Some("enforce"));
    }
}
