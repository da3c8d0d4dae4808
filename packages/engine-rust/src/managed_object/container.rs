//! Lifecycle of managed object instances within a scope.
//!
//! A [`ManagedObjectContainer`] binds one instance to one scope. It loads the
//! instance on first use, hands out the object, and recycles the instance
//! exactly once when the scope is torn down. [`ScopeObjects`] holds the
//! containers of one scope in load order.

use std::collections::HashMap;
use std::sync::Arc;

use officefloor_core::{
    CleanupEscalation, EngineEscalation, Escalation, ManagedObjectId, ManagedObjectScope, ThreadId,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::asynchronous::{AsynchronousContext, AsynchronousFlag, Waiter};
use super::pool::BoundedPool;
use super::{ManagedObject, ManagedObjectSource, ManagedObjectSourceMetaData, ObjectRef, ObjectRegistry, RecycleParameter};

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// A managed object as compiled by the office loader.
pub struct ManagedObjectMetaData {
    /// Position within the office's managed objects.
    pub index: usize,
    pub name: String,
    pub scope: ManagedObjectScope,
    pub source: Arc<dyn ManagedObjectSource>,
    pub source_meta: ManagedObjectSourceMetaData,
    /// Dependency key -> index of the managed object supplying it.
    pub dependencies: Vec<(String, usize)>,
    pub pool: Option<BoundedPool>,
    /// Effective timeout: the source's own, else the engine default.
    pub asynchronous_timeout_ms: Option<u64>,
}

impl ManagedObjectMetaData {
    /// Whether jobs of different threads must take turns using the object.
    #[must_use]
    pub fn requires_lease(&self) -> bool {
        self.scope == ManagedObjectScope::Process && !self.source_meta.concurrent
    }
}

/// Errors from recycling a container.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecycleError {
    #[error("managed object {object} has already been recycled")]
    AlreadyRecycled { object: String },
}

// ---------------------------------------------------------------------------
// ObjectLease
// ---------------------------------------------------------------------------

struct LeaseState {
    holder: Option<ThreadId>,
    waiters: Vec<Waiter>,
}

/// Exclusive use of a process-scoped object by one thread at a time.
pub struct ObjectLease {
    state: Mutex<LeaseState>,
}

impl ObjectLease {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LeaseState {
                holder: None,
                waiters: Vec::new(),
            }),
        }
    }

    /// Takes the lease for `thread`. Re-entrant for the holder.
    pub fn try_acquire(&self, thread: ThreadId) -> bool {
        let mut state = self.state.lock();
        match state.holder {
            Some(holder) => holder == thread,
            None => {
                state.holder = Some(thread);
                true
            }
        }
    }

    /// Releases the lease and wakes every waiter. Each retries, and those
    /// that lose the race park again.
    pub fn release(&self, thread: ThreadId) {
        let waiters = {
            let mut state = self.state.lock();
            if state.holder != Some(thread) {
                return;
            }
            state.holder = None;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter.wake(None);
        }
    }

    /// Parks `waiter` until the lease is released.
    ///
    /// # Errors
    ///
    /// Hands the waiter back if the lease is free now.
    pub fn park(&self, waiter: Waiter) -> Result<(), Waiter> {
        let mut state = self.state.lock();
        if state.holder.is_none() {
            return Err(waiter);
        }
        state.waiters.push(waiter);
        Ok(())
    }

    #[cfg(test)]
    pub fn holder(&self) -> Option<ThreadId> {
        self.state.lock().holder
    }
}

impl Default for ObjectLease {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ManagedObjectContainer
// ---------------------------------------------------------------------------

enum ContainerState {
    Unloaded,
    Loaded {
        managed_object: Box<dyn ManagedObject>,
        object: ObjectRef,
    },
    /// Sourced but failed to coordinate; still recycled with its scope.
    Failed {
        managed_object: Box<dyn ManagedObject>,
        escalation: Escalation,
    },
    Recycled,
}

/// One managed object instance bound to one scope.
pub struct ManagedObjectContainer {
    id: ManagedObjectId,
    meta: Arc<ManagedObjectMetaData>,
    state: Mutex<ContainerState>,
    flag: Option<Arc<AsynchronousFlag>>,
    lease: Option<ObjectLease>,
}

impl ManagedObjectContainer {
    #[must_use]
    pub fn new(
        id: ManagedObjectId,
        meta: Arc<ManagedObjectMetaData>,
        flag: Option<Arc<AsynchronousFlag>>,
    ) -> Self {
        let lease = meta.requires_lease().then(ObjectLease::new);
        Self {
            id,
            meta,
            state: Mutex::new(ContainerState::Unloaded),
            flag,
            lease,
        }
    }

    #[must_use]
    pub fn id(&self) -> ManagedObjectId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    #[must_use]
    pub fn meta(&self) -> &Arc<ManagedObjectMetaData> {
        &self.meta
    }

    #[must_use]
    pub fn flag(&self) -> Option<&Arc<AsynchronousFlag>> {
        self.flag.as_ref()
    }

    #[must_use]
    pub fn lease(&self) -> Option<&ObjectLease> {
        self.lease.as_ref()
    }

    /// Loads the instance if needed and returns its object.
    ///
    /// `dependencies` are the objects of the managed objects this one
    /// coordinates on, keyed as the source declared them.
    ///
    /// # Errors
    ///
    /// Returns an `ObjectSourcing` escalation if the instance cannot be
    /// sourced, or the coordination failure if its dependencies are rejected.
    pub fn load(&self, dependencies: Vec<(String, ObjectRef)>) -> Result<ObjectRef, Escalation> {
        let mut state = self.state.lock();
        match &*state {
            ContainerState::Loaded { object, .. } => return Ok(Arc::clone(object)),
            ContainerState::Failed { escalation, .. } => return Err(escalation.clone()),
            ContainerState::Recycled => {
                return Err(EngineEscalation::ObjectSourcing {
                    object: self.meta.name.clone(),
                    reason: "scope already recycled the object".to_string(),
                }
                .into())
            }
            ContainerState::Unloaded => {}
        }

        let pooled = self.meta.pool.as_ref().and_then(BoundedPool::take);
        let mut managed_object = match pooled {
            Some(managed_object) => managed_object,
            None => self.meta.source.source().map_err(|e| {
                Escalation::from(EngineEscalation::ObjectSourcing {
                    object: self.meta.name.clone(),
                    reason: e.to_string(),
                })
            })?,
        };

        let coordinated = match managed_object.coordinating() {
            Some(coordinating) => {
                coordinating.load_objects(&ObjectRegistry::new(self.meta.name.clone(), dependencies))
            }
            None => Ok(()),
        };
        if let Err(escalation) = coordinated {
            *state = ContainerState::Failed {
                managed_object,
                escalation: escalation.clone(),
            };
            return Err(escalation);
        }
        if let (Some(flag), Some(asynchronous)) = (&self.flag, managed_object.asynchronous()) {
            asynchronous.set_asynchronous_context(AsynchronousContext::new(Arc::clone(flag)));
        }

        let object = managed_object.object();
        debug!(object = %self.meta.name, id = %self.id, "managed object loaded");
        *state = ContainerState::Loaded {
            managed_object,
            object: Arc::clone(&object),
        };
        Ok(object)
    }

    /// Returns the named extension of the loaded instance.
    #[must_use]
    pub fn extension(&self, name: &str) -> Option<ObjectRef> {
        match &*self.state.lock() {
            ContainerState::Loaded { managed_object, .. } => managed_object.extension(name),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn is_recycled(&self) -> bool {
        matches!(*self.state.lock(), ContainerState::Recycled)
    }

    /// Recycles the instance. Governance over the object must have been
    /// settled first.
    ///
    /// `cleanups` are the failures of earlier recycles in the same sweep.
    /// Returns this recycle's own failure, if any.
    ///
    /// # Errors
    ///
    /// Refuses any recycle after the first.
    pub fn recycle(
        &self,
        cleanups: &[CleanupEscalation],
    ) -> Result<Option<CleanupEscalation>, RecycleError> {
        let mut state = self.state.lock();
        if matches!(*state, ContainerState::Recycled) {
            return Err(RecycleError::AlreadyRecycled {
                object: self.meta.name.clone(),
            });
        }

        let managed_object = match std::mem::replace(&mut *state, ContainerState::Recycled) {
            ContainerState::Loaded { managed_object, .. }
            | ContainerState::Failed { managed_object, .. } => managed_object,
            ContainerState::Unloaded | ContainerState::Recycled => return Ok(None),
        };
        drop(state);

        if !self.meta.source_meta.recyclable {
            if let Some(pool) = &self.meta.pool {
                pool.give_back(managed_object);
            }
            return Ok(None);
        }

        let mut parameter = RecycleParameter::new(managed_object, cleanups.to_vec());
        let failure = self.meta.source.recycle(&mut parameter).err();
        let (managed_object, reuse) = parameter.into_parts();
        if reuse {
            if let Some(pool) = &self.meta.pool {
                pool.give_back(managed_object);
            }
        }

        Ok(failure.map(|escalation| {
            warn!(object = %self.meta.name, error = %escalation, "managed object recycle failed");
            CleanupEscalation::new(self.meta.name.clone(), escalation)
        }))
    }
}

// ---------------------------------------------------------------------------
// ScopeObjects
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScopeInner {
    containers: HashMap<usize, Arc<ManagedObjectContainer>>,
    order: Vec<usize>,
    closed: bool,
}

/// Containers bound to one function, thread or process scope.
#[derive(Default)]
pub struct ScopeObjects {
    inner: Mutex<ScopeInner>,
}

impl ScopeObjects {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the container for managed object `index`, creating it on
    /// first use. Returns `None` once the scope has been torn down.
    pub fn get_or_create(
        &self,
        index: usize,
        create: impl FnOnce() -> ManagedObjectContainer,
    ) -> Option<Arc<ManagedObjectContainer>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        if let Some(container) = inner.containers.get(&index) {
            return Some(Arc::clone(container));
        }
        let container = Arc::new(create());
        inner.containers.insert(index, Arc::clone(&container));
        inner.order.push(index);
        Some(container)
    }

    /// Closes the scope and returns its containers, most recently created
    /// first. Later calls return nothing, so each container is handed out
    /// for recycling once.
    pub fn take_all(&self) -> Vec<Arc<ManagedObjectContainer>> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let mut order = std::mem::take(&mut inner.order);
        order.reverse();
        order
            .into_iter()
            .filter_map(|index| inner.containers.remove(&index))
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().containers.len()
    }
}

/// Recycles `containers` in order, feeding each recycle the failures of
/// those before it. Returns every failure.
pub fn recycle_all(containers: &[Arc<ManagedObjectContainer>]) -> Vec<CleanupEscalation> {
    let mut cleanups: Vec<CleanupEscalation> = Vec::new();
    for container in containers {
        match container.recycle(&cleanups) {
            Ok(Some(cleanup)) => cleanups.push(cleanup),
            Ok(None) => {}
            Err(e) => {
                warn!(object = %container.name(), error = %e, "managed object not recycled");
                cleanups.push(CleanupEscalation::new(
                    container.name().to_string(),
                    Escalation::new(e),
                ));
            }
        }
    }
    cleanups
}
