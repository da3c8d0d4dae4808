use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use officefloor_core::{EngineEscalation, Escalation, MessageEscalation};

use crate::function::FunctionType;
use crate::governance::GovernanceSource;
use crate::managed_object::ManagedObjectSource;
use crate::team::TeamFactory;

/// Creates a fresh managed object source for each configured managed object.
pub type ManagedObjectSourceFactory = Arc<dyn Fn() -> Box<dyn ManagedObjectSource> + Send + Sync>;

/// Creates a fresh governance source for each configured governance.
pub type GovernanceSourceFactory = Arc<dyn Fn() -> Box<dyn GovernanceSource> + Send + Sync>;

// ---------------------------------------------------------------------------
// EscalationMatcher
// ---------------------------------------------------------------------------

/// Decides whether an escalation is of a named escalation type.
#[derive(Clone)]
pub struct EscalationMatcher {
    name: String,
    matches: Arc<dyn Fn(&Escalation) -> bool + Send + Sync>,
}

impl EscalationMatcher {
    pub fn new(
        name: impl Into<String>,
        matches: impl Fn(&Escalation) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            matches: Arc::new(matches),
        }
    }

    /// Matches escalations whose failure is a `E`.
    pub fn of<E: StdError + 'static>(name: impl Into<String>) -> Self {
        Self::new(name, Escalation::is::<E>)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn matches(&self, escalation: &Escalation) -> bool {
        (self.matches)(escalation)
    }
}

impl fmt::Debug for EscalationMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EscalationMatcher").field(&self.name).finish()
    }
}

fn engine_escalation(escalation: &Escalation, check: fn(&EngineEscalation) -> bool) -> bool {
    escalation
        .downcast_ref::<EngineEscalation>()
        .is_some_and(check)
}

// ---------------------------------------------------------------------------
// SourceRegistry
// ---------------------------------------------------------------------------

/// Explicit table of everything descriptors may refer to by name.
///
/// Built once before opening the office floor and passed by reference:
/// - **Function types** by `FunctionDescriptor::function_type`
/// - **Managed object sources** by `ManagedObjectDescriptor::source`
/// - **Governance sources** by `GovernanceDescriptor::source`
/// - **Team sources** by `TeamKind::Custom { source }`
/// - **Escalation types** by handler `escalation_type`
pub struct SourceRegistry {
    functions: DashMap<String, FunctionType>,
    managed_object_sources: DashMap<String, ManagedObjectSourceFactory>,
    governance_sources: DashMap<String, GovernanceSourceFactory>,
    team_sources: DashMap<String, TeamFactory>,
    escalation_types: DashMap<String, EscalationMatcher>,
}

impl SourceRegistry {
    /// Creates a registry holding only the built-in escalation types:
    /// `any`, `shutdown`, `asynchronous-timeout`, `object-sourcing`,
    /// `governance` and `message`.
    #[must_use]
    pub fn new() -> Self {
        let registry = Self {
            functions: DashMap::new(),
            managed_object_sources: DashMap::new(),
            governance_sources: DashMap::new(),
            team_sources: DashMap::new(),
            escalation_types: DashMap::new(),
        };
        registry.register_escalation_matcher(EscalationMatcher::new("any", |_| true));
        registry.register_escalation_matcher(EscalationMatcher::new(
            "shutdown",
            Escalation::is_shutdown,
        ));
        registry.register_escalation_matcher(EscalationMatcher::new(
            "asynchronous-timeout",
            |e| engine_escalation(e, |e| matches!(e, EngineEscalation::AsynchronousTimeout { .. })),
        ));
        registry.register_escalation_matcher(EscalationMatcher::new("object-sourcing", |e| {
            engine_escalation(e, |e| matches!(e, EngineEscalation::ObjectSourcing { .. }))
        }));
        registry.register_escalation_matcher(EscalationMatcher::new("governance", |e| {
            engine_escalation(e, |e| matches!(e, EngineEscalation::Governance { .. }))
        }));
        registry.register_escalation_matcher(EscalationMatcher::of::<MessageEscalation>("message"));
        registry
    }

    pub fn register_function(&self, name: impl Into<String>, function_type: FunctionType) {
        self.functions.insert(name.into(), function_type);
    }

    pub fn register_managed_object_source<S, F>(&self, name: impl Into<String>, factory: F)
    where
        S: ManagedObjectSource,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.managed_object_sources.insert(
            name.into(),
            Arc::new(move || Box::new(factory()) as Box<dyn ManagedObjectSource>),
        );
    }

    pub fn register_governance_source<S, F>(&self, name: impl Into<String>, factory: F)
    where
        S: GovernanceSource,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.governance_sources.insert(
            name.into(),
            Arc::new(move || Box::new(factory()) as Box<dyn GovernanceSource>),
        );
    }

    pub fn register_team_source(&self, name: impl Into<String>, factory: TeamFactory) {
        self.team_sources.insert(name.into(), factory);
    }

    /// Registers escalation type `name` as failures of Rust type `E`.
    pub fn register_escalation_type<E: StdError + Any>(&self, name: impl Into<String>) {
        self.register_escalation_matcher(EscalationMatcher::of::<E>(name));
    }

    pub fn register_escalation_matcher(&self, matcher: EscalationMatcher) {
        self.escalation_types
            .insert(matcher.name().to_string(), matcher);
    }

    #[must_use]
    pub fn function(&self, name: &str) -> Option<FunctionType> {
        self.functions.get(name).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn managed_object_source(&self, name: &str) -> Option<Box<dyn ManagedObjectSource>> {
        self.managed_object_sources
            .get(name)
            .map(|entry| (entry.value())())
    }

    #[must_use]
    pub fn governance_source(&self, name: &str) -> Option<Box<dyn GovernanceSource>> {
        self.governance_sources
            .get(name)
            .map(|entry| (entry.value())())
    }

    #[must_use]
    pub fn team_source(&self, name: &str) -> Option<TeamFactory> {
        self.team_sources.get(name).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn escalation_type(&self, name: &str) -> Option<EscalationMatcher> {
        self.escalation_types
            .get(name)
            .map(|entry| entry.value().clone())
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
