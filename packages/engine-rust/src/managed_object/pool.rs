use parking_lot::Mutex;

use super::ManagedObject;

/// Bounded take/return pool of idle managed objects.
///
/// Ownership moves in and out by value: `take` hands an idle instance to a
/// container and `give_back` returns it after recycling. Instances returned
/// to a full pool are dropped.
pub struct BoundedPool {
    capacity: usize,
    idle: Mutex<Vec<Box<dyn ManagedObject>>>,
}

impl BoundedPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            idle: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Takes an idle instance, if any.
    pub fn take(&self) -> Option<Box<dyn ManagedObject>> {
        self.idle.lock().pop()
    }

    /// Returns an instance. Returns `false` if the pool was full and the
    /// instance was dropped.
    pub fn give_back(&self, managed_object: Box<dyn ManagedObject>) -> bool {
        let mut idle = self.idle.lock();
        if idle.len() >= self.capacity {
            return false;
        }
        idle.push(managed_object);
        true
    }

    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
