//! Office descriptors consumed by the engine.
//!
//! Descriptors are the read-only output of the configuration compiler: they
//! name functions, managed objects, teams and governances and describe how
//! they are wired together. The engine validates them once when an office is
//! opened and never mutates them afterwards. All descriptors deserialize from
//! JSON so an office can be handed over as a document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Scope a managed object is bound to. Ordered from narrowest to widest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManagedObjectScope {
    /// One instance per function invocation.
    Function,
    /// One instance per `ThreadState`.
    Thread,
    /// One instance per `ProcessState`.
    Process,
}

/// How a flow instigated by a function is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowInstigation {
    /// Runs on the same `ThreadState` before the function's continuation.
    Sequential,
    /// Spawns a child `ThreadState`; the parent's continuation waits for it.
    Parallel,
    /// Spawns a detached child `ThreadState`.
    Asynchronous,
}

/// What a function does to a governance when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GovernanceAction {
    /// Activate the governance and govern the function's covered objects.
    Activate,
    /// Enforce the active governance before the function runs.
    Enforce,
    /// Disregard the active governance before the function runs.
    Disregard,
}

/// Concurrency strategy of a team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TeamKind {
    /// Runs jobs on the calling thread.
    Passive,
    /// Fixed pool of workers draining a shared queue.
    Pooled { size: usize },
    /// Dedicated worker per job.
    WorkerPerJob,
    /// Team built by a factory registered under `source`.
    Custom { source: String },
}

// ---------------------------------------------------------------------------
// Office
// ---------------------------------------------------------------------------

/// A named office: the unit of configuration loaded by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfficeDescriptor {
    pub name: String,
    #[serde(default)]
    pub functions: Vec<FunctionDescriptor>,
    #[serde(default)]
    pub managed_objects: Vec<ManagedObjectDescriptor>,
    #[serde(default)]
    pub teams: Vec<TeamDescriptor>,
    #[serde(default)]
    pub governances: Vec<GovernanceDescriptor>,
    /// Thread-level escalation handlers, tried in order.
    #[serde(default)]
    pub escalation_handlers: Vec<EscalationHandlerDescriptor>,
    /// Team for functions not assigned to any team. Passive when absent.
    #[serde(default)]
    pub default_team: Option<String>,
}

impl OfficeDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn function(mut self, function: FunctionDescriptor) -> Self {
        self.functions.push(function);
        self
    }

    #[must_use]
    pub fn managed_object(mut self, managed_object: ManagedObjectDescriptor) -> Self {
        self.managed_objects.push(managed_object);
        self
    }

    #[must_use]
    pub fn team(mut self, team: TeamDescriptor) -> Self {
        self.teams.push(team);
        self
    }

    #[must_use]
    pub fn governance(mut self, governance: GovernanceDescriptor) -> Self {
        self.governances.push(governance);
        self
    }

    /// Appends a thread-level escalation handler.
    #[must_use]
    pub fn on_escalation(
        mut self,
        escalation_type: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        self.escalation_handlers.push(EscalationHandlerDescriptor {
            escalation_type: escalation_type.into(),
            function: function.into(),
        });
        self
    }

    #[must_use]
    pub fn default_team(mut self, team: impl Into<String>) -> Self {
        self.default_team = Some(team.into());
        self
    }

    /// Parses an office from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Function
// ---------------------------------------------------------------------------

/// A managed function within an office.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,
    /// Registry key of the function type implementing this function.
    pub function_type: String,
    /// Object dependency key -> managed object name.
    #[serde(default)]
    pub objects: BTreeMap<String, String>,
    #[serde(default)]
    pub flows: Vec<FlowDescriptor>,
    /// Function receiving this function's return value as its argument.
    #[serde(default)]
    pub next: Option<String>,
    /// Function-level escalation handlers, tried in order.
    #[serde(default)]
    pub escalation_handlers: Vec<EscalationHandlerDescriptor>,
    #[serde(default)]
    pub governances: Vec<GovernanceRequirement>,
}

impl FunctionDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, function_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            function_type: function_type.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn object(mut self, key: impl Into<String>, managed_object: impl Into<String>) -> Self {
        self.objects.insert(key.into(), managed_object.into());
        self
    }

    #[must_use]
    pub fn flow(
        mut self,
        key: impl Into<String>,
        function: impl Into<String>,
        instigation: FlowInstigation,
    ) -> Self {
        self.flows.push(FlowDescriptor {
            key: key.into(),
            function: function.into(),
            instigation,
        });
        self
    }

    #[must_use]
    pub fn next(mut self, function: impl Into<String>) -> Self {
        self.next = Some(function.into());
        self
    }

    #[must_use]
    pub fn on_escalation(
        mut self,
        escalation_type: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        self.escalation_handlers.push(EscalationHandlerDescriptor {
            escalation_type: escalation_type.into(),
            function: function.into(),
        });
        self
    }

    #[must_use]
    pub fn govern(mut self, governance: impl Into<String>, action: GovernanceAction) -> Self {
        self.governances.push(GovernanceRequirement {
            governance: governance.into(),
            action,
        });
        self
    }
}

/// A named continuation point of a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDescriptor {
    /// Flow key as declared by the function type.
    pub key: String,
    /// Function the flow starts with.
    pub function: String,
    pub instigation: FlowInstigation,
}

/// Maps an escalation type name to the function handling it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationHandlerDescriptor {
    /// Registered escalation type name (`"any"` matches every escalation).
    pub escalation_type: String,
    pub function: String,
}

/// Governance a function takes part in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceRequirement {
    pub governance: String,
    pub action: GovernanceAction,
}

// ---------------------------------------------------------------------------
// Managed object
// ---------------------------------------------------------------------------

/// A managed object bound to a scope, produced by a registered source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedObjectDescriptor {
    pub name: String,
    /// Registry key of the managed object source.
    pub source: String,
    pub scope: ManagedObjectScope,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Dependency key declared by the source -> managed object name.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

impl ManagedObjectDescriptor {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        scope: ManagedObjectScope,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            scope,
            properties: BTreeMap::new(),
            dependencies: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn dependency(mut self, key: impl Into<String>, managed_object: impl Into<String>) -> Self {
        self.dependencies.insert(key.into(), managed_object.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Team
// ---------------------------------------------------------------------------

/// A named team and the functions assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub kind: TeamKind,
    #[serde(default)]
    pub functions: Vec<String>,
}

impl TeamDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: TeamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            functions: Vec::new(),
        }
    }

    #[must_use]
    pub fn assign(mut self, function: impl Into<String>) -> Self {
        self.functions.push(function.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Governance
// ---------------------------------------------------------------------------

/// A governance covering managed objects that expose its extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceDescriptor {
    pub name: String,
    /// Registry key of the governance source.
    pub source: String,
    /// Extension interface the covered managed objects must provide.
    pub extension: String,
    #[serde(default)]
    pub managed_objects: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl GovernanceDescriptor {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            extension: extension.into(),
            managed_objects: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn covers(mut self, managed_object: impl Into<String>) -> Self {
        self.managed_objects.push(managed_object.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_order_narrow_to_wide() {
        assert!(ManagedObjectScope::Function < ManagedObjectScope::Thread);
        assert!(ManagedObjectScope::Thread < ManagedObjectScope::Process);
    }

    #[test]
    fn builder_assembles_office() {
        let office = OfficeDescriptor::new("sales")
            .function(
                FunctionDescriptor::new("take-order", "order")
                    .object("db", "connection")
                    .flow("audit", "audit", FlowInstigation::Asynchronous)
                    .next("confirm")
                    .on_escalation("any", "apologise")
                    .govern("transaction", GovernanceAction::Activate),
            )
            .managed_object(
                ManagedObjectDescriptor::new("connection", "jdbc", ManagedObjectScope::Process)
                    .property("url", "mem:"),
            )
            .team(TeamDescriptor::new("workers", TeamKind::Pooled { size: 2 }).assign("take-order"))
            .on_escalation("shutdown", "log");

        assert_eq!(office.functions.len(), 1);
        let function = &office.functions[0];
        assert_eq!(function.objects.get("db").map(String::as_str), Some("connection"));
        assert_eq!(function.next.as_deref(), Some("confirm"));
        assert_eq!(office.teams[0].functions, vec!["take-order"]);
        assert_eq!(office.escalation_handlers[0].escalation_type, "shutdown");
    }

    #[test]
    fn parses_office_from_json() {
        let office = OfficeDescriptor::from_json(
            r#"{
                "name": "sales",
                "functions": [
                    { "name": "greet", "function_type": "greet", "next": "done",
                      "flows": [{ "key": "side", "function": "done", "instigation": "parallel" }] },
                    { "name": "done", "function_type": "noop" }
                ],
                "managed_objects": [
                    { "name": "clock", "source": "clock", "scope": "thread" }
                ],
                "teams": [
                    { "name": "io", "kind": "worker-per-job", "functions": ["greet"] },
                    { "name": "pool", "kind": "pooled", "size": 4 }
                ],
                "default_team": "pool"
            }"#,
        )
        .unwrap();

        assert_eq!(office.functions[0].flows[0].instigation, FlowInstigation::Parallel);
        assert_eq!(office.managed_objects[0].scope, ManagedObjectScope::Thread);
        assert_eq!(office.teams[0].kind, TeamKind::WorkerPerJob);
        assert_eq!(office.teams[1].kind, TeamKind::Pooled { size: 4 });
        assert_eq!(office.default_team.as_deref(), Some("pool"));
    }
}
