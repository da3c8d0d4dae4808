//! `OfficeFloor` Core: office descriptors, escalations, configuration issues and values.

pub mod descriptor;
pub mod escalation;
pub mod issues;
pub mod types;

pub use descriptor::{
    EscalationHandlerDescriptor, FlowDescriptor, FlowInstigation, FunctionDescriptor,
    GovernanceAction, GovernanceDescriptor, GovernanceRequirement, ManagedObjectDescriptor,
    ManagedObjectScope, OfficeDescriptor, TeamDescriptor, TeamKind,
};
pub use escalation::{CleanupEscalation, EngineEscalation, Escalation, MessageEscalation};
pub use issues::{AssetType, CollectedIssues, ConfigurationIssue, IssueSink};
pub use types::{JobId, ManagedObjectId, ParameterError, ParameterType, ProcessId, ThreadId, Value};

