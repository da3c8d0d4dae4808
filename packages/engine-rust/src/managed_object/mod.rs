//! Managed objects: scoped resource instances and the sources producing them.
//!
//! Capabilities are independent: an instance may coordinate on other
//! objects, run asynchronous operations and expose extensions for
//! governance, each through its own optional accessor on [`ManagedObject`].
//! Sources describe their objects once, in [`ManagedObjectSourceMetaData`],
//! so the office loader can check wiring before anything runs.

pub mod asynchronous;
pub mod container;
pub mod pool;

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use officefloor_core::{CleanupEscalation, EngineEscalation, Escalation};

pub use asynchronous::{
    AsynchronousContext, AsynchronousFlag, FlagRegistry, TimeoutSweep, Waiter, Wakeable,
};
pub use container::{ManagedObjectContainer, ManagedObjectMetaData, RecycleError, ScopeObjects};
pub use pool::BoundedPool;

/// Shared handle to the object a managed object exposes to functions.
pub type ObjectRef = Arc<dyn Any + Send + Sync>;

// ---------------------------------------------------------------------------
// ObjectType
// ---------------------------------------------------------------------------

/// Rust type of an object, used to check wiring at load time.
#[derive(Clone, Copy)]
pub struct ObjectType {
    id: TypeId,
    name: &'static str,
}

impl ObjectType {
    #[must_use]
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ObjectType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ObjectType {}

impl fmt::Debug for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// ---------------------------------------------------------------------------
// Instance capabilities
// ---------------------------------------------------------------------------

/// One resource instance.
pub trait ManagedObject: Send + 'static {
    /// The object handed to functions depending on this managed object.
    fn object(&self) -> ObjectRef;

    /// Present when the object depends on other managed objects.
    fn coordinating(&mut self) -> Option<&mut dyn CoordinatingManagedObject> {
        None
    }

    /// Present when the object runs asynchronous operations.
    fn asynchronous(&mut self) -> Option<&mut dyn AsynchronousManagedObject> {
        None
    }

    /// Returns the named extension interface, used by governance.
    fn extension(&self, _name: &str) -> Option<ObjectRef> {
        None
    }
}

/// A managed object that resolves its own dependencies before first use.
pub trait CoordinatingManagedObject {
    /// Receives the dependencies declared by the source, keyed as declared.
    ///
    /// # Errors
    ///
    /// Returns an escalation if a dependency is unusable.
    fn load_objects(&mut self, registry: &ObjectRegistry) -> Result<(), Escalation>;
}

/// A managed object that may flag itself "not ready".
pub trait AsynchronousManagedObject {
    /// Receives the context used to start and complete operations.
    fn set_asynchronous_context(&mut self, context: AsynchronousContext);
}

/// Managed object exposing a single shared value and no capabilities.
pub struct PlainManagedObject<T: Any + Send + Sync> {
    object: Arc<T>,
}

impl<T: Any + Send + Sync> PlainManagedObject<T> {
    pub fn new(object: T) -> Self {
        Self {
            object: Arc::new(object),
        }
    }
}

impl<T: Any + Send + Sync> ManagedObject for PlainManagedObject<T> {
    fn object(&self) -> ObjectRef {
        Arc::clone(&self.object) as ObjectRef
    }
}

// ---------------------------------------------------------------------------
// ObjectRegistry
// ---------------------------------------------------------------------------

/// Dependencies handed to a coordinating managed object.
pub struct ObjectRegistry {
    owner: String,
    objects: Vec<(String, ObjectRef)>,
}

impl ObjectRegistry {
    #[must_use]
    pub fn new(owner: impl Into<String>, objects: Vec<(String, ObjectRef)>) -> Self {
        Self {
            owner: owner.into(),
            objects,
        }
    }

    /// Returns the dependency registered under `key`.
    ///
    /// # Errors
    ///
    /// Returns an escalation if the key is unknown or the object is not a `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, Escalation> {
        let (_, object) = self
            .objects
            .iter()
            .find(|(name, _)| name == key)
            .ok_or_else(|| EngineEscalation::UnknownDependency {
                function: self.owner.clone(),
                dependency: key.to_string(),
            })?;
        Arc::clone(object).downcast::<T>().map_err(|_| {
            EngineEscalation::ObjectType {
                function: self.owner.clone(),
                dependency: key.to_string(),
                expected: std::any::type_name::<T>(),
            }
            .into()
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// A dependency a coordinating source declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyType {
    pub key: String,
    pub object_type: ObjectType,
}

/// What a source declares about the objects it produces.
#[derive(Debug, Clone)]
pub struct ManagedObjectSourceMetaData {
    pub object_type: ObjectType,
    /// Non-empty for coordinating objects.
    pub dependencies: Vec<DependencyType>,
    pub asynchronous: bool,
    pub recyclable: bool,
    /// Safe for concurrent use by jobs of different threads.
    pub concurrent: bool,
    pub extensions: Vec<String>,
    pub pool_capacity: Option<usize>,
    pub asynchronous_timeout_ms: Option<u64>,
}

impl ManagedObjectSourceMetaData {
    /// Metadata for a source producing objects of type `T`.
    #[must_use]
    pub fn new<T: Any>() -> Self {
        Self {
            object_type: ObjectType::of::<T>(),
            dependencies: Vec::new(),
            asynchronous: false,
            recyclable: false,
            concurrent: false,
            extensions: Vec::new(),
            pool_capacity: None,
            asynchronous_timeout_ms: None,
        }
    }

    #[must_use]
    pub fn dependency<T: Any>(mut self, key: impl Into<String>) -> Self {
        self.dependencies.push(DependencyType {
            key: key.into(),
            object_type: ObjectType::of::<T>(),
        });
        self
    }

    #[must_use]
    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    #[must_use]
    pub fn recyclable(mut self) -> Self {
        self.recyclable = true;
        self
    }

    #[must_use]
    pub fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }

    #[must_use]
    pub fn extension(mut self, name: impl Into<String>) -> Self {
        self.extensions.push(name.into());
        self
    }

    #[must_use]
    pub fn pooled(mut self, capacity: usize) -> Self {
        self.pool_capacity = Some(capacity);
        self
    }

    #[must_use]
    pub fn asynchronous_timeout(mut self, timeout_ms: u64) -> Self {
        self.asynchronous_timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn is_coordinating(&self) -> bool {
        !self.dependencies.is_empty()
    }
}

/// Properties and identity handed to a source during `init`.
#[derive(Debug, Clone)]
pub struct SourceContext {
    name: String,
    properties: BTreeMap<String, String>,
}

impl SourceContext {
    #[must_use]
    pub fn new(name: impl Into<String>, properties: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            properties,
        }
    }

    /// Name of the configured element being initialised.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a required property.
    ///
    /// # Errors
    ///
    /// Returns an error naming the property if it is not configured.
    pub fn property(&self, name: &str) -> anyhow::Result<&str> {
        self.properties
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| anyhow::anyhow!("missing property '{name}' for {}", self.name))
    }

    #[must_use]
    pub fn property_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.properties.get(name).map_or(default, String::as_str)
    }

    /// Returns the names of required properties absent from the context.
    #[must_use]
    pub fn missing<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required
            .iter()
            .copied()
            .filter(|name| !self.properties.contains_key(*name))
            .collect()
    }
}

/// Factory for managed objects of one configured kind.
pub trait ManagedObjectSource: Send + Sync + 'static {
    /// Names of properties that must be configured.
    fn specification(&self) -> &[&'static str] {
        &[]
    }

    /// Initialises the source from its configuration.
    ///
    /// # Errors
    ///
    /// Any error becomes a configuration issue and prevents the office from
    /// opening.
    fn init(&mut self, context: &SourceContext) -> anyhow::Result<ManagedObjectSourceMetaData>;

    /// Creates a fresh instance.
    ///
    /// # Errors
    ///
    /// Returns an escalation if the resource cannot be obtained.
    fn source(&self) -> Result<Box<dyn ManagedObject>, Escalation>;

    /// Recycles an instance. Only called when the metadata is `recyclable`.
    ///
    /// # Errors
    ///
    /// A failure is collected as a cleanup escalation.
    fn recycle(&self, _parameter: &mut RecycleParameter) -> Result<(), Escalation> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecycleParameter
// ---------------------------------------------------------------------------

/// Handed to [`ManagedObjectSource::recycle`].
pub struct RecycleParameter {
    managed_object: Box<dyn ManagedObject>,
    cleanup_escalations: Vec<CleanupEscalation>,
    reuse: bool,
}

impl RecycleParameter {
    #[must_use]
    pub fn new(
        managed_object: Box<dyn ManagedObject>,
        cleanup_escalations: Vec<CleanupEscalation>,
    ) -> Self {
        Self {
            managed_object,
            cleanup_escalations,
            reuse: false,
        }
    }

    /// The instance being recycled.
    pub fn managed_object(&mut self) -> &mut dyn ManagedObject {
        &mut *self.managed_object
    }

    /// The instance's object, if it is a `T`.
    #[must_use]
    pub fn object<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.managed_object.object().downcast::<T>().ok()
    }

    /// Failures from earlier recycles in the same teardown.
    #[must_use]
    pub fn cleanup_escalations(&self) -> &[CleanupEscalation] {
        &self.cleanup_escalations
    }

    /// Returns the instance to the source's pool instead of discarding it.
    pub fn reuse_managed_object(&mut self) {
        self.reuse = true;
    }

    /// Splits into the instance and whether it should be reused.
    #[must_use]
    pub fn into_parts(self) -> (Box<dyn ManagedObject>, bool) {
        (self.managed_object, self.reuse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Connection {
        url: String,
    }

    #[test]
    fn object_types_compare_by_type() {
        assert_eq!(ObjectType::of::<String>(), ObjectType::of::<String>());
        assert_ne!(ObjectType::of::<String>(), ObjectType::of::<u64>());
        assert!(ObjectType::of::<Connection>().name().ends_with("Connection"));
    }

    #[test]
    fn registry_downcasts_dependencies() {
        let connection: ObjectRef = Arc::new(Connection {
            url: "mem:".to_string(),
        });
        let registry = ObjectRegistry::new("repository", vec![("db".to_string(), connection)]);

        assert_eq!(registry.get::<Connection>("db").unwrap().url, "mem:");
        let wrong = registry.get::<String>("db").unwrap_err();
        assert!(matches!(
            wrong.downcast_ref::<EngineEscalation>(),
            Some(EngineEscalation::ObjectType { .. })
        ));
        let missing = registry.get::<Connection>("cache").unwrap_err();
        assert!(matches!(
            missing.downcast_ref::<EngineEscalation>(),
            Some(EngineEscalation::UnknownDependency { .. })
        ));
    }

    #[test]
    fn source_context_reports_missing_properties() {
        let mut properties = BTreeMap::new();
        properties.insert("url".to_string(), "mem:".to_string());
        let context = SourceContext::new("connection", properties);

        assert_eq!(context.property("url").unwrap(), "mem:");
        assert!(context
            .property("user")
            .unwrap_err()
            .to_string()
            .contains("'user'"));
        assert_eq!(context.property_or("user", "sa"), "sa");
        assert_eq!(context.missing(&["url", "user"]), vec!["user"]);
    }

    #[test]
    fn metadata_builder_sets_capabilities() {
        let meta = ManagedObjectSourceMetaData::new::<Connection>()
            .dependency::<String>("config")
            .asynchronous()
            .recyclable()
            .extension("transaction")
            .pooled(4)
            .asynchronous_timeout(250);

        assert!(meta.is_coordinating());
        assert!(meta.asynchronous && meta.recyclable && !meta.concurrent);
        assert_eq!(meta.pool_capacity, Some(4));
        assert_eq!(meta.extensions, vec!["transaction"]);
        assert_eq!(meta.asynchronous_timeout_ms, Some(250));
    }

    #[test]
    fn recycle_parameter_tracks_reuse() {
        let mut parameter =
            RecycleParameter::new(Box::new(PlainManagedObject::new(7_u32)), Vec::new());
        assert_eq!(*parameter.object::<u32>().unwrap(), 7);
        assert!(parameter.cleanup_escalations().is_empty());
        parameter.reuse_managed_object();
        let (_, reuse) = parameter.into_parts();
        assert!(reuse);
    }
}
