//! Compiler: turns the registry's manifests into one node's catalog.
//!
//! A `Compiler` owns all per-compilation state (scope arena, resources,
//! collectors, pending overrides) and borrows the shared [`Registry`]
//! through an `Arc`. Compilation runs in fixed phases:
//!
//! 1. node facts and parameters become top-scope variables
//! 2. `Class[main]` is evaluated
//! 3. the matching node definition and the node's classes are evaluated
//! 4. the generation loop evaluates collectors and pending defines until
//!    nothing changes (bounded by `max_generation_passes`)
//! 5. finishing applies late overrides and defaults, resolves relationship
//!    edges and builds the [`Catalog`]

use super::ast::DefinitionKind;
use super::catalog::{Catalog, CatalogResource, EdgeKind};
use super::collector::Collector;
use super::error::{Error, Result};
use super::registry::{Registry, ResourceType, MAIN_CLASS};
use super::resource::{Override, Param, Resource, ResourceId, ResourceKind, INHERITABLE_METAPARAMS};
use super::scope::{ScopeArena, ScopeId};
use super::types::{canonical_type, Location, NodeInfo, ResourceRef, Value};
use crate::store::{ExportStore, NodeClassifier, ResourceDescriptor};
use indexmap::{IndexMap, IndexSet};
use regex::Regex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Resource types accepted without a define.
pub const BUILTIN_TYPES: &[&str] = &[
    "augeas",
    "computer",
    "cron",
    "exec",
    "file",
    "filebucket",
    "group",
    "host",
    "interface",
    "k5login",
    "macauthorization",
    "mailalias",
    "maillist",
    "mcx",
    "mount",
    "notify",
    "package",
    "resources",
    "router",
    "schedule",
    "selboolean",
    "selmodule",
    "service",
    "ssh_authorized_key",
    "sshkey",
    "tidy",
    "user",
    "vlan",
    "yumrepo",
    "zfs",
    "zone",
    "zpool",
];

pub const DEFAULT_GENERATION_PASSES: usize = 1000;

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Referencing an undefined variable is an error rather than `undef`.
    pub strict_variables: bool,
    /// Reassigning a variable in the same scope is an error.
    pub declarative: bool,
    pub max_generation_passes: usize,
    /// Lowercase builtin type names. Empty accepts any type.
    pub builtin_types: Vec<String>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            strict_variables: false,
            declarative: true,
            max_generation_passes: DEFAULT_GENERATION_PASSES,
            builtin_types: BUILTIN_TYPES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    MainEvaluated,
    NodeClassesEvaluated,
    Generating,
    Finishing,
    Done,
}

/// One side of a relationship chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Resource(ResourceRef),
    /// Whatever the collector at this index realized.
    Collector(usize),
}

#[derive(Debug, Clone)]
pub struct Relationship {
    pub source: Endpoint,
    pub target: Endpoint,
    pub kind: EdgeKind,
    pub loc: Location,
}

type EdgeSet = IndexSet<(ResourceRef, ResourceRef, EdgeKind)>;

#[derive(Debug)]
pub struct Compiler {
    registry: Arc<Registry>,
    node: NodeInfo,
    options: CompileOptions,
    phase: Phase,
    pub(crate) scopes: ScopeArena,
    resources: Vec<Resource>,
    index: FxHashMap<ResourceRef, ResourceId>,
    collectors: Vec<Collector>,
    overrides: IndexMap<ResourceRef, Vec<Override>>,
    relationships: Vec<Relationship>,
    classes: IndexSet<String>,
    /// Catalog-level tags, such as classes the node names but nobody defines.
    tags: IndexSet<String>,
    main_class: ResourceId,
    node_match: Option<(String, Vec<String>)>,
    node_scope: Option<ScopeId>,
    classified_parent: Option<String>,
    classified: bool,
    classifier: Option<Arc<dyn NodeClassifier>>,
    exports: Option<Arc<dyn ExportStore>>,
    regexes: FxHashMap<String, Regex>,
    /// Captures of the last successful `=~`, consumed by `if`.
    pub(crate) last_match: Option<Vec<String>>,
}

impl Compiler {
    pub fn new(registry: Arc<Registry>, node: NodeInfo, options: CompileOptions) -> Self {
        let mut scopes = ScopeArena::new(options.declarative);
        let top = scopes.top();
        let stage = Resource::new(
            ResourceRef::new("stage", MAIN_CLASS),
            ResourceKind::Stage,
            top,
            MAIN_CLASS,
            Location::default(),
        );
        let mut main = Resource::new(
            ResourceRef::new("class", MAIN_CLASS),
            ResourceKind::Class,
            top,
            MAIN_CLASS,
            Location::default(),
        );
        let main_stage = ResourceId(0);
        let main_class = ResourceId(1);
        main.container = Some(main_stage);
        scopes.get_mut(top).resource = Some(main_class);

        let mut index = FxHashMap::default();
        index.insert(stage.reference.clone(), main_stage);
        index.insert(main.reference.clone(), main_class);

        Self {
            registry,
            node,
            options,
            phase: Phase::Init,
            scopes,
            resources: vec![stage, main],
            index,
            collectors: Vec::new(),
            overrides: IndexMap::new(),
            relationships: Vec::new(),
            classes: IndexSet::new(),
            tags: IndexSet::new(),
            main_class,
            node_match: None,
            node_scope: None,
            classified_parent: None,
            classified: false,
            classifier: None,
            exports: None,
            regexes: FxHashMap::default(),
            last_match: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn NodeClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_export_store(mut self, store: Arc<dyn ExportStore>) -> Self {
        self.exports = Some(store);
        self
    }

    /// Compile the node's catalog. Errors are wrapped with the node name.
    pub fn compile(mut self) -> Result<Catalog> {
        let node = self.node.name.clone();
        self.run().map_err(|e| e.in_node(&node))
    }

    fn run(&mut self) -> Result<Catalog> {
        let start = Instant::now();
        info!(node = %self.node.name, "compiling catalog");

        self.set_node_parameters()?;
        self.evaluate_resource(self.main_class)?;
        self.enter(Phase::MainEvaluated);

        self.evaluate_ast_node()?;
        self.evaluate_node_classes()?;
        self.enter(Phase::NodeClassesEvaluated);

        self.enter(Phase::Generating);
        self.evaluate_generators()?;

        self.enter(Phase::Finishing);
        let edges = self.finish()?;
        let catalog = self.build_catalog(edges);
        self.publish_exports(&catalog)?;
        self.enter(Phase::Done);

        info!(
            node = %catalog.name,
            resources = catalog.len(),
            edges = catalog.edges.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "catalog compiled"
        );
        Ok(catalog)
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "compiler phase");
        self.phase = phase;
    }

    // ========================================================================
    // Accessors used by the evaluator, registry and collectors
    // ========================================================================

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn node_name(&self) -> &str {
        &self.node.name
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn resource(&self, id: ResourceId) -> &Resource {
        &self.resources[id.0]
    }

    pub fn resource_mut(&mut self, id: ResourceId) -> &mut Resource {
        &mut self.resources[id.0]
    }

    pub fn resource_ids(&self) -> impl Iterator<Item = ResourceId> + '_ {
        (0..self.resources.len()).map(ResourceId)
    }

    pub fn find(&self, reference: &ResourceRef) -> Option<ResourceId> {
        self.index.get(reference).copied()
    }

    pub fn export_store(&self) -> Option<Arc<dyn ExportStore>> {
        self.exports.clone()
    }

    pub fn find_definition(&self, namespace: &str, name: &str) -> Result<Option<Arc<ResourceType>>> {
        self.registry.find_definition(namespace, name)
    }

    pub fn find_hostclass(&self, namespace: &str, name: &str) -> Result<Option<Arc<ResourceType>>> {
        self.registry.find_hostclass(namespace, name)
    }

    /// Classes evaluated so far, in evaluation order.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(String::as_str)
    }

    pub fn record_class(&mut self, name: &str) {
        self.classes.insert(name.to_string());
    }

    /// Regex captures for the node definition being evaluated, if it was
    /// matched by a regex.
    pub fn node_captures(&self, name: &str) -> Option<Vec<String>> {
        self.node_match
            .as_ref()
            .filter(|(matched, captures)| matched == name && !captures.is_empty())
            .map(|(_, captures)| captures.clone())
    }

    pub(crate) fn lookup_var(&self, scope: ScopeId, name: &str, loc: &Location) -> Result<Value> {
        match self.scopes.lookup(scope, name) {
            Some(value) => Ok(value.clone()),
            None if self.options.strict_variables => Err(Error::UndefinedVariable {
                name: name.to_string(),
                loc: loc.clone(),
            }),
            None => {
                warn!(variable = name, at = %loc, "undefined variable");
                Ok(Value::Undef)
            }
        }
    }

    /// Compiled regex for `source`, cached per compilation.
    pub(crate) fn regex(&mut self, source: &str, loc: &Location) -> Result<Regex> {
        if let Some(re) = self.regexes.get(source) {
            return Ok(re.clone());
        }
        let re = Regex::new(source)
            .map_err(|e| Error::parse(format!("invalid regex /{}/: {}", source, e), loc.clone()))?;
        self.regexes.insert(source.to_string(), re.clone());
        Ok(re)
    }

    /// Resolve a resource type name as written in `scope` to its canonical
    /// name and kind.
    pub(crate) fn resolve_type(
        &self,
        scope: ScopeId,
        type_name: &str,
        loc: &Location,
    ) -> Result<(String, ResourceKind)> {
        let lower = type_name.trim_start_matches("::").to_lowercase();
        match lower.as_str() {
            "class" => return Ok(("Class".to_string(), ResourceKind::Class)),
            "stage" => return Ok(("Stage".to_string(), ResourceKind::Stage)),
            "node" => return Ok(("Node".to_string(), ResourceKind::Node)),
            _ => {}
        }
        let namespace = self.scopes.get(scope).namespace.clone();
        if let Some(def) = self.registry.find_definition(&namespace, type_name)? {
            return Ok((canonical_type(&def.name), ResourceKind::Define));
        }
        if self.options.builtin_types.is_empty()
            || self.options.builtin_types.iter().any(|t| *t == lower)
        {
            return Ok((canonical_type(&lower), ResourceKind::Builtin));
        }
        Err(Error::parse(
            format!("invalid resource type {}", canonical_type(type_name)),
            loc.clone(),
        ))
    }

    // ========================================================================
    // Resources
    // ========================================================================

    /// Add a resource to the catalog and place it in its container.
    pub fn add_resource(&mut self, mut resource: Resource) -> Result<ResourceId> {
        if let Some(existing) = self.find(&resource.reference) {
            return Err(Error::DuplicateResource {
                reference: resource.reference.to_string(),
                previous: self.resources[existing.0].loc.clone(),
                loc: resource.loc.clone(),
            });
        }
        resource.container = self.container_for(&resource)?;
        let id = ResourceId(self.resources.len());
        self.index.insert(resource.reference.clone(), id);
        self.resources.push(resource);
        Ok(id)
    }

    /// Stages have no container. Classes live in the stage named by their
    /// `stage` parameter or else `Class[main]`, everything else in the
    /// resource whose scope declared it.
    fn container_for(&self, resource: &Resource) -> Result<Option<ResourceId>> {
        let container = match resource.kind {
            ResourceKind::Stage => return Ok(None),
            ResourceKind::Class => match resource.get("stage") {
                Some(stage) if !stage.is_undef() => {
                    let reference = ResourceRef::new("stage", stage.to_string());
                    self.find(&reference).ok_or_else(|| {
                        Error::parse(
                            format!(
                                "could not find stage {} specified by {}",
                                stage, resource.reference
                            ),
                            resource.loc.clone(),
                        )
                    })?
                }
                _ => self.main_class,
            },
            ResourceKind::Node => self.main_class,
            ResourceKind::Builtin | ResourceKind::Define => {
                if resource.get("stage").is_some() {
                    return Err(Error::parse(
                        format!("only classes can set 'stage'; {} cannot", resource.reference),
                        resource.loc.clone(),
                    ));
                }
                self.scopes
                    .get(resource.scope)
                    .resource
                    .unwrap_or(self.main_class)
            }
        };
        Ok(Some(container))
    }

    /// Merge an override now if its target exists, otherwise keep it until
    /// the catalog is finished.
    pub fn add_override(&mut self, ov: Override) -> Result<()> {
        match self.find(&ov.target) {
            Some(id) => self.apply_override(id, &ov),
            None => {
                self.overrides.entry(ov.target.clone()).or_default().push(ov);
                Ok(())
            }
        }
    }

    fn apply_override(&mut self, id: ResourceId, ov: &Override) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        self.resources[id.0].merge(ov, |child, ancestor| registry.is_child_of(child, ancestor))
    }

    /// Register a collector; the returned index names it in relationships.
    pub fn add_collector(&mut self, collector: Collector) -> usize {
        self.collectors.push(collector);
        self.collectors.len() - 1
    }

    pub fn add_relationship(&mut self, relationship: Relationship) {
        self.relationships.push(relationship);
    }

    /// Apply the defaults visible from the resource's scope.
    pub(crate) fn apply_defaults(&self, resource: &mut Resource) {
        let defaults = self
            .scopes
            .lookup_defaults(resource.scope, &resource.reference.type_name);
        for param in defaults.values() {
            resource.set_default(param);
        }
    }

    // ========================================================================
    // Classes and definitions
    // ========================================================================

    /// Return the catalog resource for a class or node type, creating it
    /// (unevaluated) when it does not exist yet.
    pub fn ensure_in_catalog(
        &mut self,
        ty: &Arc<ResourceType>,
        scope: ScopeId,
        loc: &Location,
    ) -> Result<ResourceId> {
        let (type_name, kind) = match ty.kind {
            DefinitionKind::Class => ("class", ResourceKind::Class),
            DefinitionKind::Node => ("node", ResourceKind::Node),
            DefinitionKind::Define => {
                return Err(Error::internal(
                    "class",
                    format!("define {} cannot be added as a class", ty.name),
                    loc.clone(),
                ))
            }
        };
        let reference = ResourceRef::new(type_name, ty.name.clone());
        if let Some(id) = self.find(&reference) {
            return Ok(id);
        }
        let source = self.scopes.get(scope).class_name.clone();
        let mut resource = Resource::new(reference, kind, scope, source, loc.clone());
        self.apply_defaults(&mut resource);
        self.add_resource(resource)
    }

    /// Find, add and (unless `lazy`) evaluate each named class. `include`
    /// semantics: a class already in the catalog is not declared again.
    pub fn evaluate_classes(
        &mut self,
        names: &[String],
        scope: ScopeId,
        lazy: bool,
        loc: &Location,
    ) -> Result<Vec<ResourceId>> {
        let namespace = self.scopes.get(scope).namespace.clone();
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let ty = self
                .registry
                .find_hostclass(&namespace, name)?
                .ok_or_else(|| Error::parse(format!("could not find class {}", name), loc.clone()))?;
            let id = self.ensure_in_catalog(&ty, scope, loc)?;
            if !lazy {
                self.evaluate_resource(id)?;
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// `class { 'name': param => value }`. Unlike `include`, declaring the
    /// same class twice is a duplicate.
    pub(crate) fn declare_class(
        &mut self,
        title: &str,
        params: Vec<Param>,
        scope: ScopeId,
        loc: &Location,
    ) -> Result<ResourceRef> {
        let namespace = self.scopes.get(scope).namespace.clone();
        let ty = self
            .registry
            .find_hostclass(&namespace, title)?
            .ok_or_else(|| Error::parse(format!("could not find class {}", title), loc.clone()))?;
        let reference = ResourceRef::new("class", ty.name.clone());
        if let Some(existing) = self.find(&reference) {
            return Err(Error::DuplicateResource {
                reference: reference.to_string(),
                previous: self.resources[existing.0].loc.clone(),
                loc: loc.clone(),
            });
        }
        let source = self.scopes.get(scope).class_name.clone();
        let mut resource =
            Resource::new(reference.clone(), ResourceKind::Class, scope, source, loc.clone());
        for param in params {
            resource.set(param)?;
        }
        self.apply_defaults(&mut resource);
        let id = self.add_resource(resource)?;
        self.evaluate_resource(id)?;
        Ok(reference)
    }

    /// Evaluate a class, node or define body once.
    pub fn evaluate_resource(&mut self, id: ResourceId) -> Result<()> {
        if self.resources[id.0].evaluated {
            return Ok(());
        }
        self.resources[id.0].evaluated = true;
        let ty = self.resource_type(id)?;
        ty.evaluate_code(self, id)
    }

    fn resource_type(&self, id: ResourceId) -> Result<Arc<ResourceType>> {
        let r = &self.resources[id.0];
        let found = match r.kind {
            ResourceKind::Class if r.title() == MAIN_CLASS => Some(self.registry.main_class()),
            ResourceKind::Class => self.registry.find_hostclass("", r.title())?,
            ResourceKind::Node => self.registry.find_node(r.title()),
            ResourceKind::Define => self.registry.find_definition("", &r.reference.type_name)?,
            ResourceKind::Builtin | ResourceKind::Stage => None,
        };
        found.ok_or_else(|| {
            Error::internal(
                "resource",
                format!("no definition to evaluate {}", r.reference),
                r.loc.clone(),
            )
        })
    }

    // ========================================================================
    // Phases
    // ========================================================================

    fn set_node_parameters(&mut self) -> Result<()> {
        if let Some(classifier) = self.classifier.clone() {
            if let Some(classification) = classifier.classify(&self.node.name)? {
                debug!(
                    node = %self.node.name,
                    classes = classification.classes.len(),
                    "node classified"
                );
                self.node.classes.extend(classification.classes);
                self.node.parameters.extend(classification.parameters);
                self.classified_parent = classification.parent;
                self.classified = true;
            }
        }
        let top = self.scopes.top();
        for (name, value) in self.node.facts.iter().chain(self.node.parameters.iter()) {
            self.scopes.set(top, name, value.clone());
        }
        if self.scopes.lookup(top, "clientcert").is_none() {
            self.scopes.set(top, "clientcert", Value::from(self.node.name.clone()));
        }
        Ok(())
    }

    /// Evaluate the node definition matching the node's names.
    fn evaluate_ast_node(&mut self) -> Result<()> {
        if !self.registry.has_nodes() {
            return Ok(());
        }
        let mut names = self.node.names();
        if let Some(parent) = &self.classified_parent {
            names.push(parent.to_lowercase());
        }
        let Some((node_type, captures)) = self.registry.node_for(&names) else {
            if self.classified {
                return Ok(());
            }
            return Err(Error::parse(
                format!(
                    "could not find default node or by name with '{}'",
                    names.join(", ")
                ),
                Location::default(),
            ));
        };
        debug!(node = %self.node.name, definition = %node_type.name, "matched node definition");
        self.node_match = Some((node_type.name.clone(), captures));
        let top = self.scopes.top();
        let id = self.ensure_in_catalog(&node_type, top, &node_type.loc)?;
        self.evaluate_resource(id)?;
        self.node_scope = self.scopes.class_scope(&node_type.name);
        Ok(())
    }

    fn evaluate_node_classes(&mut self) -> Result<()> {
        if self.node.classes.is_empty() {
            return Ok(());
        }
        let scope = self.node_scope.unwrap_or(self.scopes.top());
        let namespace = self.scopes.get(scope).namespace.clone();
        let mut classes = Vec::with_capacity(self.node.classes.len());
        for name in self.node.classes.clone() {
            if self.registry.find_hostclass(&namespace, &name)?.is_some() {
                classes.push(name);
            } else {
                info!(node = %self.node.name, class = %name, "could not find class; tagging catalog instead");
                self.tags.insert(name.to_lowercase());
            }
        }
        self.evaluate_classes(&classes, scope, true, &Location::default())?;
        Ok(())
    }

    /// Evaluate collectors and unevaluated defines until a pass changes
    /// nothing.
    fn evaluate_generators(&mut self) -> Result<()> {
        let limit = self.options.max_generation_passes;
        let mut iterations = 0;
        loop {
            let collected = self.evaluate_collectors()?;
            let generated = self.evaluate_definitions()?;
            if !collected && !generated {
                break;
            }
            iterations += 1;
            if iterations > limit {
                return Err(Error::GenerationLimit { iterations });
            }
        }
        debug!(iterations, "generation settled");
        Ok(())
    }

    fn evaluate_collectors(&mut self) -> Result<bool> {
        let mut collectors = std::mem::take(&mut self.collectors);
        let mut any = false;
        let mut outcome = Ok(());
        for collector in collectors.iter_mut() {
            match collector.evaluate(self) {
                Ok(found) => any |= found,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        collectors.append(&mut self.collectors);
        self.collectors = collectors;
        outcome.map(|()| any)
    }

    fn evaluate_definitions(&mut self) -> Result<bool> {
        let pending: Vec<ResourceId> = self
            .resource_ids()
            .filter(|id| {
                let r = self.resource(*id);
                !r.evaluated && !r.is_virtual
            })
            .collect();
        for id in &pending {
            self.evaluate_resource(*id)?;
        }
        Ok(!pending.is_empty())
    }

    // ========================================================================
    // Finishing
    // ========================================================================

    fn finish(&mut self) -> Result<EdgeSet> {
        self.apply_pending_overrides()?;
        self.apply_late_defaults();
        let edges = self.relationship_edges()?;
        self.propagate_from_containers();
        self.check_realized()?;
        Ok(edges)
    }

    fn apply_pending_overrides(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.overrides);
        let mut missing: Vec<(ResourceRef, Location)> = Vec::new();
        for (target, overrides) in pending {
            match self.find(&target) {
                Some(id) => {
                    for ov in &overrides {
                        self.apply_override(id, ov)?;
                    }
                }
                None => {
                    let loc = overrides.first().map(|o| o.loc.clone()).unwrap_or_default();
                    missing.push((target, loc));
                }
            }
        }
        if let Some((_, loc)) = missing.first() {
            let names: Vec<String> = missing.iter().map(|(r, _)| r.to_string()).collect();
            return Err(Error::parse(
                format!("could not find resource(s) {} for overriding", names.join(", ")),
                loc.clone(),
            ));
        }
        Ok(())
    }

    fn apply_late_defaults(&mut self) {
        for i in 0..self.resources.len() {
            let (scope, type_name) = {
                let r = &self.resources[i];
                (r.scope, r.reference.type_name.clone())
            };
            let defaults = self.scopes.lookup_defaults(scope, &type_name);
            for param in defaults.values() {
                self.resources[i].set_default(param);
            }
        }
    }

    /// Virtual resources nobody realized are left out of the catalog;
    /// exported ones stay, flagged.
    fn is_kept(resource: &Resource) -> bool {
        !resource.is_virtual || resource.exported
    }

    fn kept_ref(&self, reference: &ResourceRef) -> Option<ResourceRef> {
        self.find(reference)
            .map(|id| &self.resources[id.0])
            .filter(|r| Self::is_kept(r))
            .map(|r| r.reference.clone())
    }

    fn relationship_edges(&self) -> Result<EdgeSet> {
        const METAPARAM_EDGES: [(&str, EdgeKind, bool); 4] = [
            ("before", EdgeKind::Before, true),
            ("notify", EdgeKind::Notify, true),
            ("require", EdgeKind::Before, false),
            ("subscribe", EdgeKind::Notify, false),
        ];
        let mut edges = EdgeSet::new();
        for r in self.resources.iter().filter(|r| Self::is_kept(r)) {
            for (name, kind, forward) in METAPARAM_EDGES {
                let Some(param) = r.params.get(name) else {
                    continue;
                };
                if param.value.is_undef() {
                    continue;
                }
                let targets = param.value.to_refs().ok_or_else(|| {
                    Error::parse(
                        format!("invalid {} value '{}' on {}", name, param.value, r.reference),
                        param.loc.clone(),
                    )
                })?;
                for target in targets {
                    let target = self.kept_ref(&target).ok_or_else(|| {
                        Error::parse(
                            format!(
                                "could not find resource '{}' for relationship {} on {}",
                                target, name, r.reference
                            ),
                            param.loc.clone(),
                        )
                    })?;
                    let edge = if forward {
                        (r.reference.clone(), target, kind)
                    } else {
                        (target, r.reference.clone(), kind)
                    };
                    edges.insert(edge);
                }
            }
        }
        for rel in &self.relationships {
            let sources = self.endpoint_refs(&rel.source, &rel.loc)?;
            let targets = self.endpoint_refs(&rel.target, &rel.loc)?;
            for source in &sources {
                for target in &targets {
                    edges.insert((source.clone(), target.clone(), rel.kind));
                }
            }
        }
        Ok(edges)
    }

    fn endpoint_refs(&self, endpoint: &Endpoint, loc: &Location) -> Result<Vec<ResourceRef>> {
        match endpoint {
            Endpoint::Resource(reference) => {
                let found = self.kept_ref(reference).ok_or_else(|| {
                    Error::parse(
                        format!("could not find resource '{}' for relationship", reference),
                        loc.clone(),
                    )
                })?;
                Ok(vec![found])
            }
            Endpoint::Collector(idx) => Ok(self
                .collectors
                .get(*idx)
                .map(|c| c.collected.iter().filter_map(|r| self.kept_ref(r)).collect())
                .unwrap_or_default()),
        }
    }

    /// Copy container tags and inheritable metaparameters down to contents.
    /// Stages and `Class[main]` pass nothing on.
    fn propagate_from_containers(&mut self) {
        for i in 0..self.resources.len() {
            let Some(container) = self.resources[i].container else {
                continue;
            };
            if container == self.main_class || self.resources[container.0].kind == ResourceKind::Stage {
                continue;
            }
            let parent = &self.resources[container.0];
            let tags: Vec<String> = parent.tags.iter().cloned().collect();
            let inherited: Vec<Param> = INHERITABLE_METAPARAMS
                .iter()
                .filter_map(|m| parent.params.get(*m).cloned())
                .collect();
            let r = &mut self.resources[i];
            r.tags.extend(tags);
            for param in &inherited {
                r.set_default(param);
            }
        }
    }

    fn check_realized(&self) -> Result<()> {
        for collector in &self.collectors {
            let missing = collector.unrealized();
            if !missing.is_empty() {
                let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
                return Err(Error::parse(
                    format!("failed to realize virtual resources {}", names.join(", ")),
                    collector.loc.clone(),
                ));
            }
        }
        Ok(())
    }

    fn build_catalog(&self, edges: EdgeSet) -> Catalog {
        let mut catalog = Catalog::new(self.node.name.clone(), self.registry.version());
        catalog.classes = self.classes.iter().cloned().collect();
        catalog.tags = self.tags.iter().cloned().collect();
        let kept: Vec<&Resource> = self.resources.iter().filter(|r| Self::is_kept(r)).collect();
        for r in &kept {
            catalog.add_resource(CatalogResource {
                type_name: r.reference.type_name.clone(),
                title: r.reference.title.clone(),
                parameters: r.param_values(),
                tags: r.tag_list(),
                file: r.loc.file_name(),
                line: r.loc.line,
                exported: r.exported,
            });
        }
        for r in &kept {
            if let Some(container) = r.container {
                catalog.add_edge(&self.resources[container.0].reference, &r.reference, EdgeKind::Contains);
            }
        }
        for (source, target, kind) in edges {
            catalog.add_edge(&source, &target, kind);
        }
        catalog
    }

    fn publish_exports(&self, catalog: &Catalog) -> Result<()> {
        let Some(store) = &self.exports else {
            return Ok(());
        };
        let descriptors: Vec<ResourceDescriptor> = catalog
            .exported_resources()
            .map(|r| ResourceDescriptor::from_catalog(r, &self.node.name))
            .collect();
        debug!(node = %self.node.name, resources = descriptors.len(), "publishing exports");
        store.publish(&self.node.name, descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::Edge;
    use crate::store::{Classification, MemoryExportStore};

    fn registry(src: &str) -> Arc<Registry> {
        let registry = Registry::default();
        registry.load_source("site.pp", src).unwrap();
        Arc::new(registry)
    }

    fn compile_with(src: &str, node: NodeInfo, options: CompileOptions) -> Result<Catalog> {
        Compiler::new(registry(src), node, options).compile()
    }

    fn compile(src: &str) -> Catalog {
        compile_with(src, NodeInfo::new("web01"), CompileOptions::default()).unwrap()
    }

    fn compile_err(src: &str) -> Error {
        compile_with(src, NodeInfo::new("web01"), CompileOptions::default()).unwrap_err()
    }

    fn param<'a>(catalog: &'a Catalog, reference: &str, name: &str) -> &'a Value {
        &catalog
            .resource(reference)
            .unwrap_or_else(|| panic!("{} not in catalog", reference))
            .parameters[name]
    }

    fn has_edge(catalog: &Catalog, source: &str, target: &str, kind: EdgeKind) -> bool {
        catalog.edges.contains(&Edge {
            source: source.to_string(),
            target: target.to_string(),
            kind,
        })
    }

    #[derive(Debug)]
    struct FixedClassifier(Classification);

    impl NodeClassifier for FixedClassifier {
        fn classify(&self, _node: &str) -> Result<Option<Classification>> {
            Ok(Some(self.0.clone()))
        }
    }

    #[test]
    fn test_compiler_inherited_variable_and_containment() {
        let catalog = compile(
            r#"
class base { $x = 1 }
class child inherits base { notify { "t": message => "$x" } }
node default { include child }
"#,
        );
        assert_eq!(param(&catalog, "Notify[t]", "message"), &Value::from("1"));
        assert_eq!(catalog.container_of("Notify[t]"), Some("Class[child]"));
        assert_eq!(catalog.container_of("Class[child]"), Some("Class[main]"));
        assert_eq!(catalog.container_of("Class[base]"), Some("Class[main]"));
        assert_eq!(catalog.container_of("Class[main]"), Some("Stage[main]"));
        assert_eq!(catalog.container_of("Stage[main]"), None);
        assert!(catalog.classes.iter().any(|c| c == "base"));
    }

    #[test]
    fn test_compiler_every_resource_has_one_container() {
        let catalog = compile(
            r#"
stage { 'pre': before => Stage['main'] }
class setup { file { '/etc/setup': } }
class { 'setup': stage => pre }
define site($port = 80) { notify { "site-${title}": message => "$port" } }
class web { site { 'a': } site { 'b': port => 8080 } }
node default { include web }
"#,
        );
        for reference in catalog.resources.keys() {
            let containers = catalog
                .edges
                .iter()
                .filter(|e| e.kind == EdgeKind::Contains && e.target == *reference)
                .count();
            let expected = usize::from(!reference.starts_with("Stage["));
            assert_eq!(containers, expected, "{}", reference);
        }
        assert_eq!(catalog.container_of("Class[setup]"), Some("Stage[pre]"));
        assert_eq!(catalog.container_of("Stage[pre]"), None);
        assert_eq!(catalog.container_of("Notify[site-a]"), Some("Site[a]"));
        assert_eq!(param(&catalog, "Notify[site-a]", "message"), &Value::from("80"));
        assert_eq!(param(&catalog, "Notify[site-b]", "message"), &Value::from("8080"));
        assert!(has_edge(&catalog, "Stage[pre]", "Stage[main]", EdgeKind::Before));
        let order = catalog.execution_order().unwrap();
        let at = |r: &str| order.iter().position(|o| o == r).unwrap();
        assert!(at("Stage[pre]") < at("Stage[main]"));
    }

    #[test]
    fn test_compiler_missing_stage() {
        let err = compile_err("class setup {} class { 'setup': stage => nowhere }");
        assert!(err.to_string().contains("could not find stage nowhere"), "{}", err);
        let err = compile_err("file { '/a': stage => main }");
        assert!(err.to_string().contains("only classes can set 'stage'"), "{}", err);
    }

    #[test]
    fn test_compiler_declarative_redefinition() {
        let err = compile_err("$a = 1\n$a = 2");
        assert!(matches!(err.root(), Error::Redefinition { .. }), "{}", err);

        let options = CompileOptions {
            declarative: false,
            ..CompileOptions::default()
        };
        let catalog = compile_with(
            "$a = 1\n$a = 2\nnotify { 'n': message => $a }",
            NodeInfo::new("web01"),
            options,
        )
        .unwrap();
        assert_eq!(param(&catalog, "Notify[n]", "message"), &Value::Integer(2));
    }

    #[test]
    fn test_compiler_lookup_is_one_directional() {
        let src = "class a { $inner = 'x' }\ninclude a\nnotify { 'n': message => $inner }";
        let options = CompileOptions {
            strict_variables: true,
            ..CompileOptions::default()
        };
        let err = compile_with(src, NodeInfo::new("web01"), options).unwrap_err();
        assert!(matches!(err.root(), Error::UndefinedVariable { name, .. } if name == "inner"));

        let catalog = compile("class a { $inner = 'x' }\ninclude a\nnotify { 'n': message => $a::inner }");
        assert_eq!(param(&catalog, "Notify[n]", "message"), &Value::from("x"));
    }

    #[test]
    fn test_compiler_case_default_and_selector_error() {
        let src = r#"
case $os {
  'debian', 'ubuntu': { notify { 'apt': } }
  default: { notify { 'other': } }
}
case $os { 'solaris': { notify { 'never': } } }
"#;
        let node = NodeInfo::new("web01").with_fact("os", "RedHat");
        let catalog = compile_with(src, node, CompileOptions::default()).unwrap();
        assert!(catalog.resource("Notify[other]").is_some());
        assert!(catalog.resource("Notify[apt]").is_none());
        assert!(catalog.resource("Notify[never]").is_none());

        let node = NodeInfo::new("web01").with_fact("os", "Ubuntu");
        let catalog = compile_with(src, node, CompileOptions::default()).unwrap();
        assert!(catalog.resource("Notify[apt]").is_some());

        let err = compile_err("$pkg = 'z' ? { 'a' => 1 }");
        assert!(err.to_string().contains("no matching value"), "{}", err);
        let catalog = compile("$pkg = 'z' ? { 'a' => 1, default => 2 }\nnotify { 'n': message => $pkg }");
        assert_eq!(param(&catalog, "Notify[n]", "message"), &Value::Integer(2));
    }

    #[test]
    fn test_compiler_bounded_recursive_define() {
        let catalog = compile(
            r#"
define countdown($n) {
  if $n > 0 { countdown { "c${n - 1}": n => $n - 1 } }
}
countdown { 'c3': n => 3 }
"#,
        );
        let count = catalog
            .resources
            .values()
            .filter(|r| r.type_name == "Countdown")
            .count();
        assert_eq!(count, 4);
        assert_eq!(catalog.container_of("Countdown[c0]"), Some("Countdown[c1]"));
    }

    #[test]
    fn test_compiler_unbounded_define_hits_limit() {
        let src = "define forever($n) { forever { \"f${n + 1}\": n => $n + 1 } }\nforever { 'f0': n => 0 }";
        let options = CompileOptions {
            max_generation_passes: 5,
            ..CompileOptions::default()
        };
        for _ in 0..2 {
            let err = compile_with(src, NodeInfo::new("web01"), options.clone()).unwrap_err();
            assert!(
                matches!(err.root(), Error::GenerationLimit { iterations: 6 }),
                "{}",
                err
            );
        }
    }

    #[test]
    fn test_compiler_overlapping_collectors_realize_once() {
        let catalog = compile(
            r#"
@user { 'alice': groups => 'admin' }
@user { 'bob': groups => 'dev' }
@user { 'carol': groups => 'admin' }
User <| groups == 'admin' |>
User <| title == 'alice' |> { shell => '/bin/zsh' }
realize(User['alice'])
"#,
        );
        assert!(catalog.resource("User[alice]").is_some());
        assert!(catalog.resource("User[carol]").is_some());
        assert!(catalog.resource("User[bob]").is_none());
        assert_eq!(param(&catalog, "User[alice]", "shell"), &Value::from("/bin/zsh"));
        let users = catalog
            .resources
            .values()
            .filter(|r| r.type_name == "User")
            .count();
        assert_eq!(users, 2);
    }

    #[test]
    fn test_compiler_realize_missing_fails() {
        let err = compile_err("realize(User['ghost'])");
        assert!(err.to_string().contains("failed to realize"), "{}", err);
    }

    #[test]
    fn test_compiler_override_from_subclass() {
        let catalog = compile(
            r#"
class base { file { '/a': mode => '0600' } }
class child inherits base { File['/a'] { mode => '0644' } }
include child
"#,
        );
        assert_eq!(param(&catalog, "File[/a]", "mode"), &Value::from("0644"));
    }

    #[test]
    fn test_compiler_override_in_declaring_class() {
        let catalog = compile(
            r#"
notify { 'x': message => 'first' }
Notify['x'] { message => 'second' }
class a { file { '/a': mode => '1' } File['/a'] { mode => '2' } }
include a
"#,
        );
        assert_eq!(param(&catalog, "Notify[x]", "message"), &Value::from("second"));
        assert_eq!(param(&catalog, "File[/a]", "mode"), &Value::from("2"));
    }

    #[test]
    fn test_compiler_override_of_defaulted_param() {
        let catalog = compile(
            r#"
File { mode => '0644' }
class base { file { '/a': } file { '/b': } }
class child inherits base { File['/a'] { mode => '0600' } }
include child
"#,
        );
        assert_eq!(param(&catalog, "File[/a]", "mode"), &Value::from("0600"));
        assert_eq!(param(&catalog, "File[/b]", "mode"), &Value::from("0644"));
    }

    #[test]
    fn test_compiler_override_from_unrelated_class() {
        let err = compile_err(
            r#"
class base { file { '/a': mode => '0600' } }
class other { File['/a'] { mode => '0644' } }
include base, other
"#,
        );
        assert!(matches!(err.root(), Error::OverrideAuthorization { .. }), "{}", err);
    }

    #[test]
    fn test_compiler_pending_override_and_late_defaults() {
        let catalog = compile(
            r#"
Notify['later'] { message => 'overridden' }
notify { 'later': }
notify { 'plain': }
Notify { withpath => true }
"#,
        );
        assert_eq!(param(&catalog, "Notify[later]", "message"), &Value::from("overridden"));
        assert_eq!(param(&catalog, "Notify[plain]", "withpath"), &Value::Bool(true));

        let err = compile_err("Notify['ghost'] { message => 'x' }");
        assert!(err.to_string().contains("Notify[ghost] for overriding"), "{}", err);
    }

    #[test]
    fn test_compiler_duplicate_resource() {
        let err = compile_err("file { '/a': }\nfile { '/a': }");
        let Error::DuplicateResource { reference, previous, .. } = err.root() else {
            panic!("expected duplicate, got {}", err);
        };
        assert_eq!(reference, "File[/a]");
        assert_eq!(previous.line, 1);
    }

    #[test]
    fn test_compiler_relationships() {
        let catalog = compile(
            r#"
package { 'nginx': } -> file { '/etc/nginx.conf': } ~> service { 'nginx': }
file { '/var/www': require => Package['nginx'] }
exec { 'reload': subscribe => File['/etc/nginx.conf'] }
"#,
        );
        assert!(has_edge(&catalog, "Package[nginx]", "File[/etc/nginx.conf]", EdgeKind::Before));
        assert!(has_edge(&catalog, "File[/etc/nginx.conf]", "Service[nginx]", EdgeKind::Notify));
        assert!(has_edge(&catalog, "Package[nginx]", "File[/var/www]", EdgeKind::Before));
        assert!(has_edge(&catalog, "File[/etc/nginx.conf]", "Exec[reload]", EdgeKind::Notify));
        let mut downstream = catalog.downstream("Package[nginx]");
        downstream.sort_unstable();
        assert_eq!(
            downstream,
            vec!["Exec[reload]", "File[/etc/nginx.conf]", "File[/var/www]", "Service[nginx]"]
        );
        let order = catalog.execution_order().unwrap();
        let pos = |r: &str| order.iter().position(|o| o == r).unwrap();
        assert!(pos("Package[nginx]") < pos("File[/etc/nginx.conf]"));
        assert!(pos("File[/etc/nginx.conf]") < pos("Service[nginx]"));
    }

    #[test]
    fn test_compiler_relationship_to_collector() {
        let catalog = compile(
            r#"
@package { 'p1': }
@package { 'p2': }
service { 's': }
Package <| |> -> Service['s']
"#,
        );
        assert!(has_edge(&catalog, "Package[p1]", "Service[s]", EdgeKind::Before));
        assert!(has_edge(&catalog, "Package[p2]", "Service[s]", EdgeKind::Before));
    }

    #[test]
    fn test_compiler_relationship_errors() {
        let err = compile_err("file { '/a': require => Package['missing'] }");
        assert!(err.to_string().contains("Package[missing]"), "{}", err);
        let err = compile_err("@package { 'virt': }\nfile { '/a': } -> Package['virt']");
        assert!(err.to_string().contains("Package[virt]"), "{}", err);
    }

    #[test]
    fn test_compiler_cycle_detected_in_order() {
        let catalog = compile("notify { 'a': } -> notify { 'b': } -> Notify['a']");
        let err = catalog.execution_order().unwrap_err();
        let Error::Cycle { members } = err else {
            panic!("expected cycle");
        };
        assert_eq!(members, vec!["Notify[a]", "Notify[b]"]);
    }

    #[test]
    fn test_compiler_virtual_dropped_exported_kept() {
        let catalog = compile("@user { 'bob': }\n@@sshkey { 'web01': key => 'abc' }");
        assert!(catalog.resource("User[bob]").is_none());
        assert!(catalog.resource("Sshkey[web01]").unwrap().exported);
        assert_eq!(catalog.exported_resources().count(), 1);
    }

    #[test]
    fn test_compiler_tags_and_metaparams_propagate() {
        let catalog = compile(
            r#"
class web {
  tag 'frontend'
  file { '/srv/web': }
  file { '/srv/loud': loglevel => 'info' }
}
class { 'web': loglevel => 'debug' }
file { '/top': }
"#,
        );
        let tags = &catalog.resource("File[/srv/web]").unwrap().tags;
        assert!(tags.iter().any(|t| t == "frontend"));
        assert!(tags.iter().any(|t| t == "web"));
        assert_eq!(param(&catalog, "File[/srv/web]", "loglevel"), &Value::from("debug"));
        assert_eq!(param(&catalog, "File[/srv/loud]", "loglevel"), &Value::from("info"));
        let top = catalog.resource("File[/top]").unwrap();
        assert!(!top.tags.iter().any(|t| t == "frontend"));
        assert!(!top.parameters.contains_key("loglevel"));
    }

    #[test]
    fn test_compiler_node_lookup() {
        let src = "node 'web01' { notify { 'short': } }\nnode default { notify { 'fallback': } }";
        let catalog = compile_with(src, NodeInfo::new("web01.example.com"), CompileOptions::default())
            .unwrap();
        assert!(catalog.resource("Notify[short]").is_some());
        assert!(catalog.resource("Node[web01]").is_some());
        let catalog =
            compile_with(src, NodeInfo::new("db01"), CompileOptions::default()).unwrap();
        assert!(catalog.resource("Notify[fallback]").is_some());

        let err = compile_with("node 'other' {}", NodeInfo::new("web01"), CompileOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("could not find default node"), "{}", err);
        assert!(err.to_string().contains("on node web01"), "{}", err);
    }

    #[test]
    fn test_compiler_node_inheritance() {
        let catalog = compile(
            r#"
node base { $role = 'generic' notify { 'base': } }
node 'web01' inherits base { notify { 'role': message => $role } }
"#,
        );
        assert_eq!(param(&catalog, "Notify[role]", "message"), &Value::from("generic"));
        assert_eq!(catalog.container_of("Notify[base]"), Some("Node[base]"));
    }

    #[test]
    fn test_compiler_node_facts_and_classes() {
        let node = NodeInfo::new("web01")
            .with_fact("datacenter", "ams1")
            .with_class("ntp");
        let catalog = compile_with(
            "class ntp { notify { 'ntp': message => \"$datacenter/$clientcert\" } }",
            node,
            CompileOptions::default(),
        )
        .unwrap();
        assert_eq!(param(&catalog, "Notify[ntp]", "message"), &Value::from("ams1/web01"));
        assert_eq!(catalog.container_of("Notify[ntp]"), Some("Class[ntp]"));
    }

    #[test]
    fn test_compiler_missing_node_class_tags_catalog() {
        let node = NodeInfo::new("web01").with_class("ntp").with_class("NoSuch");
        let catalog = compile_with(
            "class ntp { notify { 'ntp': } }",
            node,
            CompileOptions::default(),
        )
        .unwrap();
        assert!(catalog.resource("Notify[ntp]").is_some());
        assert_eq!(catalog.tags, vec!["nosuch".to_string()]);
        assert!(!catalog.classes.iter().any(|c| c == "nosuch"));
    }

    #[test]
    fn test_compiler_classifier() {
        let classification = Classification {
            classes: vec!["ntp".into()],
            parameters: [("role".to_string(), Value::from("web"))].into_iter().collect(),
            parent: Some("base".into()),
        };
        let src = r#"
class ntp { notify { 'ntp': message => $role } }
node base { notify { 'from-base': } }
"#;
        let catalog = Compiler::new(registry(src), NodeInfo::new("web01"), CompileOptions::default())
            .with_classifier(Arc::new(FixedClassifier(classification.clone())))
            .compile()
            .unwrap();
        assert_eq!(param(&catalog, "Notify[ntp]", "message"), &Value::from("web"));
        assert!(catalog.resource("Notify[from-base]").is_some());

        let classification = Classification {
            parent: None,
            ..classification
        };
        let catalog = Compiler::new(registry(src), NodeInfo::new("web01"), CompileOptions::default())
            .with_classifier(Arc::new(FixedClassifier(classification)))
            .compile()
            .unwrap();
        assert!(catalog.resource("Notify[ntp]").is_some());
        assert!(catalog.resource("Notify[from-base]").is_none());
    }

    #[test]
    fn test_compiler_exports_published_and_collected() {
        let store = Arc::new(MemoryExportStore::new());
        let reg = registry(
            r#"
node 'a' { @@sshkey { 'a': key => 'ka', tag => 'ssh' } }
node 'b' { @@sshkey { 'b': key => 'kb' } Sshkey <<| tag == 'ssh' |>> }
"#,
        );
        Compiler::new(Arc::clone(&reg), NodeInfo::new("a"), CompileOptions::default())
            .with_export_store(store.clone())
            .compile()
            .unwrap();
        let exported = store.exported_by("a");
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].title, "a");

        let catalog = Compiler::new(reg, NodeInfo::new("b"), CompileOptions::default())
            .with_export_store(store.clone())
            .compile()
            .unwrap();
        let imported = catalog.resource("Sshkey[a]").unwrap();
        assert!(!imported.exported);
        assert_eq!(imported.parameters["key"], Value::from("ka"));
        assert!(catalog.resource("Sshkey[b]").unwrap().exported);
        assert_eq!(store.exported_by("b").len(), 1);
    }

    #[test]
    fn test_compiler_define_parameter_errors() {
        let err = compile_err("define site($port) {}\nsite { 'a': }");
        assert!(err.to_string().contains("must pass port"), "{}", err);
        let err = compile_err("define site($port = 1) {}\nsite { 'a': colour => 'red' }");
        assert!(err.to_string().contains("invalid parameter 'colour'"), "{}", err);
    }

    #[test]
    fn test_compiler_unknown_type_and_class() {
        let err = compile_err("frobnicate { 'x': }");
        assert!(err.to_string().contains("invalid resource type Frobnicate"), "{}", err);
        let err = compile_err("include missing");
        assert!(err.to_string().contains("could not find class missing"), "{}", err);
    }

    #[test]
    fn test_compiler_catalog_version_tracks_sources() {
        let a = compile("notify { 'x': }");
        let b = compile("notify { 'y': }");
        assert!(a.version.starts_with("blake3:"));
        assert_ne!(a.version, b.version);
    }
}
