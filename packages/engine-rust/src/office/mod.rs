//! Offices: the registry of named sources and the loader that compiles
//! descriptors into the metadata the scheduler runs on.
//!
//! Everything the scheduler needs is resolved here, once: names become
//! indices, object dependencies are checked against function signatures and
//! source metadata, and teams are built. Problems are reported as
//! configuration issues and the office does not open.

mod loader;
mod registry;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use officefloor_core::{FlowInstigation, GovernanceAction, ParameterType};

pub use loader::OfficeLoader;
pub use registry::{
    EscalationMatcher, GovernanceSourceFactory, ManagedObjectSourceFactory, SourceRegistry,
};

use crate::function::ManagedFunction;
use crate::governance::GovernanceMetaData;
use crate::managed_object::ManagedObjectMetaData;
use crate::team::{Team, TeamId};

/// A flow of a function, resolved to its target.
#[derive(Debug, Clone)]
pub struct FlowMetaData {
    pub key: String,
    pub function: usize,
    pub instigation: FlowInstigation,
}

/// An escalation handler, resolved to its matcher and function.
#[derive(Debug, Clone)]
pub struct HandlerMetaData {
    pub matcher: EscalationMatcher,
    pub function: usize,
}

/// A team of an office together with the id jobs observe it by.
pub struct TeamBinding {
    pub id: TeamId,
    pub name: String,
    pub team: Arc<dyn Team>,
}

impl fmt::Debug for TeamBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeamBinding")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A function as compiled by the loader.
pub struct FunctionMetaData {
    pub index: usize,
    pub name: String,
    pub function: Arc<dyn ManagedFunction>,
    /// Managed object bound to each declared dependency, in declaration
    /// order.
    pub objects: Vec<usize>,
    pub object_keys: Vec<String>,
    /// Every managed object the function needs, dependencies before the
    /// objects coordinating on them.
    pub load_order: Vec<usize>,
    pub flows: Vec<FlowMetaData>,
    pub flow_keys: Vec<String>,
    pub next: Option<usize>,
    pub handlers: Vec<HandlerMetaData>,
    pub governances: Vec<(usize, GovernanceAction)>,
    /// Index into [`OfficeMetaData::teams`].
    pub team: usize,
    pub parameter: Option<ParameterType>,
}

impl fmt::Debug for FunctionMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionMetaData")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("objects", &self.objects)
            .field("load_order", &self.load_order)
            .field("flows", &self.flows)
            .field("next", &self.next)
            .field("team", &self.team)
            .finish_non_exhaustive()
    }
}

/// A loaded office.
pub struct OfficeMetaData {
    pub name: String,
    pub functions: Vec<FunctionMetaData>,
    pub managed_objects: Vec<Arc<ManagedObjectMetaData>>,
    pub governances: Vec<Arc<GovernanceMetaData>>,
    pub teams: Vec<TeamBinding>,
    /// Handlers every thread of the office consults after the function's
    /// own handlers.
    pub thread_handlers: Vec<HandlerMetaData>,
    function_index: HashMap<String, usize>,
}

impl OfficeMetaData {
    /// Index of the function named `name`.
    #[must_use]
    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.function_index.get(name).copied()
    }

    #[must_use]
    pub fn function(&self, name: &str) -> Option<&FunctionMetaData> {
        self.function_index(name)
            .and_then(|index| self.functions.get(index))
    }

    /// Function names in declaration order.
    #[must_use]
    pub fn function_names(&self) -> Vec<String> {
        self.functions
            .iter()
            .map(|function| function.name.clone())
            .collect()
    }

    /// The team binding that runs function `index`.
    #[must_use]
    pub fn team_of(&self, function: usize) -> Option<&TeamBinding> {
        self.functions
            .get(function)
            .and_then(|function| self.teams.get(function.team))
    }
}

impl fmt::Debug for OfficeMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfficeMetaData")
            .field("name", &self.name)
            .field("functions", &self.functions)
            .field("managed_objects", &self.managed_objects.len())
            .field("governances", &self.governances.len())
            .field("teams", &self.teams)
            .finish_non_exhaustive()
    }
}
