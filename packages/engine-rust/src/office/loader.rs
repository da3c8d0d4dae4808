use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use officefloor_core::{
    AssetType, ConfigurationIssue, IssueSink, ManagedObjectScope, OfficeDescriptor, TeamKind,
};
use tracing::debug;

use super::{
    FlowMetaData, FunctionMetaData, HandlerMetaData, OfficeMetaData, SourceRegistry, TeamBinding,
};
use crate::config::EngineConfig;
use crate::governance::GovernanceMetaData;
use crate::managed_object::{
    BoundedPool, ManagedObjectMetaData, ManagedObjectSource, ManagedObjectSourceMetaData,
    SourceContext,
};
use crate::monitor::MonitorClock;
use crate::team::{PassiveTeam, PooledTeam, Team, TeamContext, TeamId, WorkerPerJobTeam};

/// Name of the passive team functions run on when an office names no
/// default team.
const IMPLICIT_TEAM: &str = "default";

// ---------------------------------------------------------------------------
// Issue recording
// ---------------------------------------------------------------------------

struct Issues<'a> {
    office: &'a str,
    sink: &'a dyn IssueSink,
    count: usize,
}

impl<'a> Issues<'a> {
    fn new(office: &'a str, sink: &'a dyn IssueSink) -> Self {
        Self {
            office,
            sink,
            count: 0,
        }
    }

    fn add(&mut self, asset_type: AssetType, asset_name: &str, message: impl Into<String>) {
        self.count += 1;
        self.sink.add_issue(ConfigurationIssue {
            office: self.office.to_string(),
            asset_type,
            asset_name: asset_name.to_string(),
            message: message.into(),
        });
    }
}

/// Maps names to their position, reporting empty and duplicate names.
fn index_names<'d>(
    names: impl Iterator<Item = &'d str>,
    asset_type: AssetType,
    issues: &mut Issues<'_>,
) -> HashMap<String, usize> {
    let mut index = HashMap::new();
    for (position, name) in names.enumerate() {
        if name.trim().is_empty() {
            issues.add(asset_type, name, "name is empty");
        } else if index.insert(name.to_string(), position).is_some() {
            issues.add(asset_type, name, "name is configured more than once");
        }
    }
    index
}

struct SourcedObject {
    source: Box<dyn ManagedObjectSource>,
    meta: ManagedObjectSourceMetaData,
}

// ---------------------------------------------------------------------------
// OfficeLoader
// ---------------------------------------------------------------------------

/// Compiles office descriptors into [`OfficeMetaData`].
///
/// Team ids are allocated across every office the loader compiles, so one
/// loader is used per office floor.
pub struct OfficeLoader<'a> {
    registry: &'a SourceRegistry,
    config: &'a EngineConfig,
    clock: &'a MonitorClock,
    sink: &'a dyn IssueSink,
    next_team_id: usize,
}

impl<'a> OfficeLoader<'a> {
    #[must_use]
    pub fn new(
        registry: &'a SourceRegistry,
        config: &'a EngineConfig,
        clock: &'a MonitorClock,
        sink: &'a dyn IssueSink,
    ) -> Self {
        Self {
            registry,
            config,
            clock,
            sink,
            next_team_id: 0,
        }
    }

    /// Loads one office. Returns `None` if any issue was reported; teams
    /// built along the way are dropped without having been started.
    pub fn load(&mut self, descriptor: &OfficeDescriptor) -> Option<OfficeMetaData> {
        let mut issues = Issues::new(&descriptor.name, self.sink);
        if descriptor.name.trim().is_empty() {
            issues.add(AssetType::Office, &descriptor.name, "office name is empty");
        }

        let function_index = index_names(
            descriptor.functions.iter().map(|f| f.name.as_str()),
            AssetType::Function,
            &mut issues,
        );
        let object_index = index_names(
            descriptor.managed_objects.iter().map(|m| m.name.as_str()),
            AssetType::ManagedObject,
            &mut issues,
        );
        let governance_index = index_names(
            descriptor.governances.iter().map(|g| g.name.as_str()),
            AssetType::Governance,
            &mut issues,
        );

        let sourced = self.source_managed_objects(descriptor, &mut issues);
        let dependencies = Self::resolve_dependencies(descriptor, &object_index, &sourced, &mut issues);
        let governances =
            self.load_governances(descriptor, &object_index, &sourced, &mut issues);
        let (teams, function_teams) = self.load_teams(descriptor, &function_index, &mut issues);
        let functions = self.load_functions(
            descriptor,
            &function_index,
            &object_index,
            &governance_index,
            &sourced,
            &dependencies,
            &function_teams,
            &mut issues,
        );
        let thread_handlers = self.load_handlers(
            &descriptor.escalation_handlers,
            &descriptor.name,
            &function_index,
            &mut issues,
        );

        if issues.count > 0 {
            debug!(office = %descriptor.name, issues = issues.count, "office not loaded");
            return None;
        }

        let managed_objects = descriptor
            .managed_objects
            .iter()
            .zip(sourced)
            .zip(dependencies)
            .enumerate()
            .filter_map(|(index, ((descriptor, sourced), dependencies))| {
                sourced.map(|sourced| self.object_meta(index, descriptor, sourced, dependencies))
            })
            .collect();

        Some(OfficeMetaData {
            name: descriptor.name.clone(),
            functions,
            managed_objects,
            governances,
            teams,
            thread_handlers,
            function_index,
        })
    }

    fn object_meta(
        &self,
        index: usize,
        descriptor: &officefloor_core::ManagedObjectDescriptor,
        sourced: SourcedObject,
        dependencies: Vec<(String, usize)>,
    ) -> Arc<ManagedObjectMetaData> {
        let SourcedObject { source, meta } = sourced;
        let pool = meta
            .pool_capacity
            .filter(|capacity| *capacity > 0)
            .map(BoundedPool::new);
        let asynchronous_timeout_ms = if meta.asynchronous {
            meta.asynchronous_timeout_ms
                .or(self.config.default_asynchronous_timeout_ms)
        } else {
            None
        };
        Arc::new(ManagedObjectMetaData {
            index,
            name: descriptor.name.clone(),
            scope: descriptor.scope,
            source: Arc::from(source),
            source_meta: meta,
            dependencies,
            pool,
            asynchronous_timeout_ms,
        })
    }

    // -- managed objects ----------------------------------------------------

    fn source_managed_objects(
        &self,
        descriptor: &OfficeDescriptor,
        issues: &mut Issues<'_>,
    ) -> Vec<Option<SourcedObject>> {
        descriptor
            .managed_objects
            .iter()
            .map(|mo| {
                let Some(mut source) = self.registry.managed_object_source(&mo.source) else {
                    issues.add(
                        AssetType::ManagedObject,
                        &mo.name,
                        format!("unknown managed object source {}", mo.source),
                    );
                    return None;
                };
                let context = SourceContext::new(mo.name.clone(), mo.properties.clone());
                let missing = context.missing(source.specification());
                if !missing.is_empty() {
                    for property in missing {
                        issues.add(
                            AssetType::ManagedObject,
                            &mo.name,
                            format!("required property {property} is not configured"),
                        );
                    }
                    return None;
                }
                match source.init(&context) {
                    Ok(meta) => Some(SourcedObject { source, meta }),
                    Err(e) => {
                        issues.add(
                            AssetType::ManagedObject,
                            &mo.name,
                            format!("failed to initialise source {}: {e:#}", mo.source),
                        );
                        None
                    }
                }
            })
            .collect()
    }

    fn resolve_dependencies(
        descriptor: &OfficeDescriptor,
        object_index: &HashMap<String, usize>,
        sourced: &[Option<SourcedObject>],
        issues: &mut Issues<'_>,
    ) -> Vec<Vec<(String, usize)>> {
        let mut resolved = Vec::with_capacity(descriptor.managed_objects.len());
        for (mo, sourced_object) in descriptor.managed_objects.iter().zip(sourced) {
            let Some(sourced_object) = sourced_object else {
                resolved.push(Vec::new());
                continue;
            };
            let mut dependencies = Vec::new();
            for dependency in &sourced_object.meta.dependencies {
                let Some(target_name) = mo.dependencies.get(&dependency.key) else {
                    issues.add(
                        AssetType::ManagedObject,
                        &mo.name,
                        format!("dependency {} is not configured", dependency.key),
                    );
                    continue;
                };
                let Some(&target) = object_index.get(target_name) else {
                    issues.add(
                        AssetType::ManagedObject,
                        &mo.name,
                        format!(
                            "dependency {} refers to unknown managed object {target_name}",
                            dependency.key
                        ),
                    );
                    continue;
                };
                if let Some(target_object) = &sourced[target] {
                    if target_object.meta.object_type != dependency.object_type {
                        issues.add(
                            AssetType::ManagedObject,
                            &mo.name,
                            format!(
                                "dependency {} requires {} but {target_name} provides {}",
                                dependency.key,
                                dependency.object_type.name(),
                                target_object.meta.object_type.name()
                            ),
                        );
                    }
                }
                let target_scope = descriptor.managed_objects[target].scope;
                if target_scope < mo.scope {
                    issues.add(
                        AssetType::ManagedObject,
                        &mo.name,
                        format!(
                            "{:?} scoped object depends on {target_name} of narrower {:?} scope",
                            mo.scope, target_scope
                        ),
                    );
                }
                dependencies.push((dependency.key.clone(), target));
            }
            for key in mo.dependencies.keys() {
                if !sourced_object
                    .meta
                    .dependencies
                    .iter()
                    .any(|dependency| &dependency.key == key)
                {
                    issues.add(
                        AssetType::ManagedObject,
                        &mo.name,
                        format!("dependency {key} is not declared by source {}", mo.source),
                    );
                }
            }
            resolved.push(dependencies);
        }

        for start in 0..resolved.len() {
            if reaches(&resolved, start, start) {
                issues.add(
                    AssetType::ManagedObject,
                    &descriptor.managed_objects[start].name,
                    "managed object dependencies form a cycle",
                );
            }
        }
        resolved
    }

    // -- governances --------------------------------------------------------

    fn load_governances(
        &self,
        descriptor: &OfficeDescriptor,
        object_index: &HashMap<String, usize>,
        sourced: &[Option<SourcedObject>],
        issues: &mut Issues<'_>,
    ) -> Vec<Arc<GovernanceMetaData>> {
        let mut governances = Vec::new();
        for (index, gd) in descriptor.governances.iter().enumerate() {
            let Some(mut source) = self.registry.governance_source(&gd.source) else {
                issues.add(
                    AssetType::Governance,
                    &gd.name,
                    format!("unknown governance source {}", gd.source),
                );
                continue;
            };
            let context = SourceContext::new(gd.name.clone(), gd.properties.clone());
            let missing = context.missing(source.specification());
            for property in &missing {
                issues.add(
                    AssetType::Governance,
                    &gd.name,
                    format!("required property {property} is not configured"),
                );
            }
            if !missing.is_empty() {
                continue;
            }
            if let Err(e) = source.init(&context) {
                issues.add(
                    AssetType::Governance,
                    &gd.name,
                    format!("failed to initialise source {}: {e:#}", gd.source),
                );
                continue;
            }

            let mut managed_objects = Vec::new();
            for name in &gd.managed_objects {
                let Some(&mo) = object_index.get(name) else {
                    issues.add(
                        AssetType::Governance,
                        &gd.name,
                        format!("covers unknown managed object {name}"),
                    );
                    continue;
                };
                let provides = sourced[mo]
                    .as_ref()
                    .map_or(true, |object| object.meta.extensions.contains(&gd.extension));
                if !provides {
                    issues.add(
                        AssetType::Governance,
                        &gd.name,
                        format!(
                            "managed object {name} does not provide extension {}",
                            gd.extension
                        ),
                    );
                }
                managed_objects.push(mo);
            }
            governances.push(Arc::new(GovernanceMetaData {
                index,
                name: gd.name.clone(),
                extension: gd.extension.clone(),
                managed_objects,
                source: Arc::from(source),
            }));
        }
        governances
    }

    // -- teams --------------------------------------------------------------

    fn team_context(&mut self, office: &str, team: &str) -> TeamContext {
        let team_id = TeamId(self.next_team_id);
        self.next_team_id += 1;
        TeamContext {
            team_id,
            name: format!("{office}.{team}"),
            clock: self.clock.clone(),
            thread_name_prefix: self.config.thread_name_prefix.clone(),
        }
    }

    fn build_team(
        &mut self,
        office: &str,
        name: &str,
        kind: &TeamKind,
        issues: &mut Issues<'_>,
    ) -> Option<TeamBinding> {
        let context = self.team_context(office, name);
        let team: Arc<dyn Team> = match kind {
            TeamKind::Passive => Arc::new(PassiveTeam::new(&context)),
            TeamKind::Pooled { size: 0 } => {
                issues.add(AssetType::Team, name, "pooled team needs at least one worker");
                return None;
            }
            TeamKind::Pooled { size } => Arc::new(PooledTeam::new(&context, *size)),
            TeamKind::WorkerPerJob => Arc::new(WorkerPerJobTeam::new(&context)),
            TeamKind::Custom { source } => {
                let Some(factory) = self.registry.team_source(source) else {
                    issues.add(AssetType::Team, name, format!("unknown team source {source}"));
                    return None;
                };
                match factory(&context) {
                    Ok(team) => team,
                    Err(e) => {
                        issues.add(
                            AssetType::Team,
                            name,
                            format!("failed to create team from source {source}: {e:#}"),
                        );
                        return None;
                    }
                }
            }
        };
        Some(TeamBinding {
            id: context.team_id,
            name: name.to_string(),
            team,
        })
    }

    /// Builds the office's teams and assigns each function a team index.
    fn load_teams(
        &mut self,
        descriptor: &OfficeDescriptor,
        function_index: &HashMap<String, usize>,
        issues: &mut Issues<'_>,
    ) -> (Vec<TeamBinding>, Vec<usize>) {
        let team_index = index_names(
            descriptor.teams.iter().map(|t| t.name.as_str()),
            AssetType::Team,
            issues,
        );

        let mut teams = Vec::new();
        let mut assigned: Vec<Option<(usize, &str)>> = vec![None; descriptor.functions.len()];
        for td in &descriptor.teams {
            let Some(binding) = self.build_team(&descriptor.name, &td.name, &td.kind, issues) else {
                continue;
            };
            let position = teams.len();
            teams.push(binding);
            for function in &td.functions {
                let Some(&index) = function_index.get(function) else {
                    issues.add(
                        AssetType::Team,
                        &td.name,
                        format!("assigned unknown function {function}"),
                    );
                    continue;
                };
                match assigned[index] {
                    Some((_, other)) => issues.add(
                        AssetType::Function,
                        function,
                        format!("assigned to both team {other} and team {}", td.name),
                    ),
                    None => assigned[index] = Some((position, &td.name)),
                }
            }
        }

        let default_team = match &descriptor.default_team {
            Some(name) => {
                if !team_index.contains_key(name) {
                    issues.add(AssetType::Office, &descriptor.name, format!("unknown default team {name}"));
                }
                teams.iter().position(|binding| &binding.name == name)
            }
            None => {
                let binding =
                    self.build_team(&descriptor.name, IMPLICIT_TEAM, &TeamKind::Passive, issues);
                binding.map(|binding| {
                    teams.push(binding);
                    teams.len() - 1
                })
            }
        };

        let function_teams = assigned
            .into_iter()
            .map(|assigned| assigned.map(|(team, _)| team).or(default_team).unwrap_or(0))
            .collect();
        (teams, function_teams)
    }

    // -- functions ----------------------------------------------------------

    fn load_handlers(
        &self,
        handlers: &[officefloor_core::EscalationHandlerDescriptor],
        owner: &str,
        function_index: &HashMap<String, usize>,
        issues: &mut Issues<'_>,
    ) -> Vec<HandlerMetaData> {
        let mut resolved = Vec::new();
        for handler in handlers {
            let matcher = self.registry.escalation_type(&handler.escalation_type);
            if matcher.is_none() {
                issues.add(
                    AssetType::Escalation,
                    &handler.escalation_type,
                    format!("unknown escalation type handled by {owner}"),
                );
            }
            let function = function_index.get(&handler.function).copied();
            if function.is_none() {
                issues.add(
                    AssetType::Escalation,
                    &handler.escalation_type,
                    format!("handler of {owner} is unknown function {}", handler.function),
                );
            }
            if let (Some(matcher), Some(function)) = (matcher, function) {
                resolved.push(HandlerMetaData { matcher, function });
            }
        }
        resolved
    }

    #[allow(clippy::too_many_arguments, clippy::too_many_lines)]
    fn load_functions(
        &self,
        descriptor: &OfficeDescriptor,
        function_index: &HashMap<String, usize>,
        object_index: &HashMap<String, usize>,
        governance_index: &HashMap<String, usize>,
        sourced: &[Option<SourcedObject>],
        dependencies: &[Vec<(String, usize)>],
        function_teams: &[usize],
        issues: &mut Issues<'_>,
    ) -> Vec<FunctionMetaData> {
        let mut functions = Vec::new();
        for (index, fd) in descriptor.functions.iter().enumerate() {
            let Some(function_type) = self.registry.function(&fd.function_type) else {
                issues.add(
                    AssetType::Function,
                    &fd.name,
                    format!("unknown function type {}", fd.function_type),
                );
                continue;
            };

            let mut objects = Vec::new();
            for (key, expected) in function_type.objects() {
                let Some(mo_name) = fd.objects.get(key) else {
                    issues.add(AssetType::Function, &fd.name, format!("object {key} is not configured"));
                    continue;
                };
                let Some(&mo) = object_index.get(mo_name) else {
                    issues.add(
                        AssetType::Function,
                        &fd.name,
                        format!("object {key} refers to unknown managed object {mo_name}"),
                    );
                    continue;
                };
                if let Some(object) = &sourced[mo] {
                    if object.meta.object_type != *expected {
                        issues.add(
                            AssetType::Function,
                            &fd.name,
                            format!(
                                "object {key} requires {} but {mo_name} provides {}",
                                expected.name(),
                                object.meta.object_type.name()
                            ),
                        );
                    }
                }
                objects.push(mo);
            }
            for key in fd.objects.keys() {
                if !function_type.objects().iter().any(|(declared, _)| declared == key) {
                    issues.add(
                        AssetType::Function,
                        &fd.name,
                        format!("object {key} is not declared by function type {}", fd.function_type),
                    );
                }
            }

            let mut flows = Vec::new();
            for key in function_type.flows() {
                let Some(flow) = fd.flows.iter().find(|flow| &flow.key == key) else {
                    issues.add(AssetType::Function, &fd.name, format!("flow {key} is not configured"));
                    continue;
                };
                match function_index.get(&flow.function) {
                    Some(&function) => flows.push(FlowMetaData {
                        key: key.clone(),
                        function,
                        instigation: flow.instigation,
                    }),
                    None => issues.add(
                        AssetType::Function,
                        &fd.name,
                        format!("flow {key} targets unknown function {}", flow.function),
                    ),
                }
            }
            for flow in &fd.flows {
                if !function_type.flows().contains(&flow.key) {
                    issues.add(
                        AssetType::Function,
                        &fd.name,
                        format!("flow {} is not declared by function type {}", flow.key, fd.function_type),
                    );
                }
            }

            let next = fd.next.as_ref().and_then(|next| {
                let resolved = function_index.get(next).copied();
                if resolved.is_none() {
                    issues.add(AssetType::Function, &fd.name, format!("next function {next} is unknown"));
                }
                resolved
            });

            for escalation in function_type.escalations() {
                if self.registry.escalation_type(escalation).is_none() {
                    issues.add(
                        AssetType::Escalation,
                        escalation,
                        format!("unknown escalation type declared by function {}", fd.name),
                    );
                }
            }
            let handlers =
                self.load_handlers(&fd.escalation_handlers, &fd.name, function_index, issues);

            let mut governances = Vec::new();
            for requirement in &fd.governances {
                match governance_index.get(&requirement.governance) {
                    Some(&governance) => governances.push((governance, requirement.action)),
                    None => issues.add(
                        AssetType::Function,
                        &fd.name,
                        format!("unknown governance {}", requirement.governance),
                    ),
                }
            }

            functions.push(FunctionMetaData {
                index,
                name: fd.name.clone(),
                function: Arc::clone(function_type.function()),
                load_order: load_order(&objects, dependencies),
                objects,
                object_keys: function_type
                    .objects()
                    .iter()
                    .map(|(key, _)| key.clone())
                    .collect(),
                flow_keys: function_type.flows().to_vec(),
                flows,
                next,
                handlers,
                governances,
                team: function_teams.get(index).copied().unwrap_or(0),
                parameter: function_type.parameter_type(),
            });
        }
        functions
    }
}

/// Whether `target` is reachable from `from` by following at least one
/// dependency edge.
fn reaches(dependencies: &[Vec<(String, usize)>], from: usize, target: usize) -> bool {
    let mut visited = BTreeSet::new();
    let mut stack: Vec<usize> = dependencies[from].iter().map(|(_, to)| *to).collect();
    while let Some(next) = stack.pop() {
        if next == target {
            return true;
        }
        if visited.insert(next) {
            stack.extend(dependencies[next].iter().map(|(_, to)| *to));
        }
    }
    false
}

/// Every managed object reachable from `roots`, each after its dependencies.
fn load_order(roots: &[usize], dependencies: &[Vec<(String, usize)>]) -> Vec<usize> {
    fn visit(
        mo: usize,
        dependencies: &[Vec<(String, usize)>],
        visited: &mut BTreeSet<usize>,
        order: &mut Vec<usize>,
    ) {
        if !visited.insert(mo) {
            return;
        }
        if let Some(edges) = dependencies.get(mo) {
            for (_, dependency) in edges {
                visit(*dependency, dependencies, visited, order);
            }
        }
        order.push(mo);
    }

    let mut visited = BTreeSet::new();
    let mut order = Vec::new();
    for root in roots {
        visit(*root, dependencies, &mut visited, &mut order);
    }
    order
}
