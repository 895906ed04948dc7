//! Collectors: deferred realization of virtual and exported resources.
//!
//! A collector is created by `Type <| query |>`, `Type <<| query |>>` or
//! `realize(...)` and re-evaluated on every pass of the generation loop. The
//! per-collector `collected` set guarantees that each resource is realized
//! and overridden at most once by a given collector.

use super::compiler::Compiler;
use super::error::{Error, Result};
use super::resource::{Override, Param, Resource, ResourceId, ResourceKind};
use super::scope::ScopeId;
use super::types::{Location, ResourceRef, Value};
use crate::core::ast::QueryOp;
use crate::store::ResourceDescriptor;
use indexmap::IndexSet;
use std::fmt;
use tracing::debug;

// ============================================================================
// Queries
// ============================================================================

/// Evaluated collection query.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Compare {
        param: String,
        op: QueryOp,
        value: Value,
    },
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
}

impl Query {
    /// Test a candidate whose parameters are read through `get`. `title` and
    /// `tag` are answered by `get` as well; array values match when any
    /// element matches.
    pub fn matches(&self, get: &dyn Fn(&str) -> Option<Value>) -> bool {
        match self {
            Self::Compare { param, op, value } => {
                let equal = match get(param) {
                    Some(Value::Array(items)) => items.iter().any(|i| i.loose_eq(value)),
                    Some(actual) => actual.loose_eq(value),
                    None => false,
                };
                match op {
                    QueryOp::Eq => equal,
                    QueryOp::Ne => !equal,
                }
            }
            Self::And(a, b) => a.matches(get) && b.matches(get),
            Self::Or(a, b) => a.matches(get) || b.matches(get),
        }
    }

    pub fn matches_resource(&self, resource: &Resource) -> bool {
        self.matches(&|name| match name {
            "title" => Some(Value::from(resource.title())),
            "tag" => Some(Value::Array(
                resource.tags.iter().map(|t| Value::from(t.as_str())).collect(),
            )),
            other => resource.get(other).cloned(),
        })
    }

    pub fn matches_descriptor(&self, descriptor: &ResourceDescriptor) -> bool {
        self.matches(&|name| match name {
            "title" => Some(Value::from(descriptor.title.as_str())),
            "tag" => Some(Value::Array(
                descriptor.tags.iter().map(|t| Value::from(t.as_str())).collect(),
            )),
            other => descriptor.parameters.get(other).cloned(),
        })
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare { param, op, value } => {
                let symbol = match op {
                    QueryOp::Eq => "==",
                    QueryOp::Ne => "!=",
                };
                write!(f, "{} {} '{}'", param, symbol, value)
            }
            Self::And(a, b) => write!(f, "({} and {})", a, b),
            Self::Or(a, b) => write!(f, "({} or {})", a, b),
        }
    }
}

// ============================================================================
// Collectors
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum CollectorKind {
    /// `Type <| |>`: every matching non-exported resource of the type,
    /// virtual or not, in this catalog.
    Virtual,
    /// `Type <<| |>>`: matching exported resources, local and from the store.
    Exported,
    /// `realize(...)`: exactly the listed references.
    List(Vec<ResourceRef>),
}

/// Parameter override applied to everything a collector realizes.
#[derive(Debug, Clone)]
pub struct CollectOverride {
    pub params: Vec<Param>,
    pub source: String,
    pub loc: Location,
}

#[derive(Debug, Clone)]
pub struct Collector {
    /// Canonical type; empty for list collectors.
    pub type_name: String,
    pub kind: CollectorKind,
    pub query: Option<Query>,
    pub scope: ScopeId,
    pub overrides: Option<CollectOverride>,
    pub collected: IndexSet<ResourceRef>,
    /// List collectors that found every reference stop being evaluated.
    pub done: bool,
    pub loc: Location,
}

impl Collector {
    pub fn query(
        type_name: String,
        kind: CollectorKind,
        query: Option<Query>,
        scope: ScopeId,
        loc: Location,
    ) -> Self {
        Self {
            type_name,
            kind,
            query,
            scope,
            overrides: None,
            collected: IndexSet::new(),
            done: false,
            loc,
        }
    }

    pub fn list(refs: Vec<ResourceRef>, scope: ScopeId, loc: Location) -> Self {
        Self::query(String::new(), CollectorKind::List(refs), None, scope, loc)
    }

    pub fn with_override(mut self, overrides: CollectOverride) -> Self {
        self.overrides = Some(overrides);
        self
    }

    /// Run one collection pass. True when anything new was realized.
    pub fn evaluate(&mut self, cx: &mut Compiler) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        match self.kind.clone() {
            CollectorKind::Virtual => self.collect_local(cx, false),
            CollectorKind::Exported => {
                let local = self.collect_local(cx, true)?;
                let remote = self.collect_store(cx)?;
                Ok(local || remote)
            }
            CollectorKind::List(refs) => self.collect_list(cx, &refs),
        }
    }

    fn collect_local(&mut self, cx: &mut Compiler, exported_only: bool) -> Result<bool> {
        let candidates: Vec<ResourceId> = cx
            .resource_ids()
            .filter(|id| {
                let r = cx.resource(*id);
                r.reference.type_name == self.type_name
                    && r.exported == exported_only
                    && !self.collected.contains(&r.reference)
                    && self.query.as_ref().is_none_or(|q| q.matches_resource(r))
            })
            .collect();
        let mut any = false;
        for id in candidates {
            any |= self.realize(cx, id)?;
        }
        Ok(any)
    }

    fn collect_store(&mut self, cx: &mut Compiler) -> Result<bool> {
        let Some(store) = cx.export_store() else {
            return Ok(false);
        };
        let node = cx.node_name().to_string();
        let found = store
            .search(&self.type_name, self.query.as_ref(), &node)
            .map_err(|e| e.with_location(&self.loc))?;
        let mut any = false;
        for descriptor in found {
            if descriptor.node == node {
                continue;
            }
            let reference = ResourceRef::new(&descriptor.type_name, descriptor.title.clone());
            if let Some(existing) = cx.find(&reference) {
                let r = cx.resource(existing);
                if r.provenance.as_deref() == Some(descriptor.node.as_str()) {
                    continue;
                }
                return Err(Error::DuplicateResource {
                    reference: format!("{} exported by {}", reference, descriptor.node),
                    previous: r.loc.clone(),
                    loc: self.loc.clone(),
                });
            }
            let id = self.import(cx, &descriptor, reference)?;
            any |= self.realize(cx, id)?;
        }
        Ok(any)
    }

    /// Turn a stored descriptor into a catalog resource owned by this node.
    fn import(
        &self,
        cx: &mut Compiler,
        descriptor: &ResourceDescriptor,
        reference: ResourceRef,
    ) -> Result<ResourceId> {
        let kind = match cx.find_definition("", &descriptor.type_name)? {
            Some(_) => ResourceKind::Define,
            None => ResourceKind::Builtin,
        };
        let loc = Location::new(descriptor.file.as_deref().map(Into::into), descriptor.line);
        let source = format!("node {}", descriptor.node);
        let mut resource = Resource::new(reference, kind, self.scope, source.clone(), loc.clone());
        for (name, value) in &descriptor.parameters {
            resource.set(Param::new(name.clone(), value.clone(), source.clone(), loc.clone()))?;
        }
        for tag in &descriptor.tags {
            resource.add_tag(tag, &loc)?;
        }
        resource.provenance = Some(descriptor.node.clone());
        debug!(resource = %resource.reference, from = %descriptor.node, "importing exported resource");
        cx.add_resource(resource)
    }

    fn collect_list(&mut self, cx: &mut Compiler, refs: &[ResourceRef]) -> Result<bool> {
        let mut any = false;
        for reference in refs {
            if self.collected.contains(reference) {
                continue;
            }
            if let Some(id) = cx.find(reference) {
                any |= self.realize(cx, id)?;
            }
        }
        if refs.iter().all(|r| self.collected.contains(r)) {
            self.done = true;
        }
        Ok(any)
    }

    fn realize(&mut self, cx: &mut Compiler, id: ResourceId) -> Result<bool> {
        let reference = cx.resource(id).reference.clone();
        if !self.collected.insert(reference.clone()) {
            return Ok(false);
        }
        cx.resource_mut(id).is_virtual = false;
        if let Some(ov) = &self.overrides {
            cx.add_override(Override {
                target: reference.clone(),
                params: ov.params.clone(),
                source: ov.source.clone(),
                loc: ov.loc.clone(),
                from_collection: true,
            })?;
        }
        debug!(resource = %reference, "collected");
        Ok(true)
    }

    /// References a list collector has not found yet.
    pub fn unrealized(&self) -> Vec<ResourceRef> {
        match &self.kind {
            CollectorKind::List(refs) => refs
                .iter()
                .filter(|r| !self.collected.contains(*r))
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(title: &str, params: &[(&str, &str)]) -> Resource {
        let mut r = Resource::new(
            ResourceRef::new("user", title),
            ResourceKind::Builtin,
            ScopeId::top(),
            "main",
            Location::default(),
        );
        for (k, v) in params {
            r.set(Param::new(*k, Value::from(*v), "main", Location::default()))
                .unwrap();
        }
        r
    }

    fn cmp(param: &str, op: QueryOp, value: &str) -> Query {
        Query::Compare {
            param: param.into(),
            op,
            value: Value::from(value),
        }
    }

    #[test]
    fn test_collector_query_compare() {
        let r = resource("alice", &[("group", "Admin")]);
        assert!(cmp("group", QueryOp::Eq, "admin").matches_resource(&r));
        assert!(!cmp("group", QueryOp::Ne, "admin").matches_resource(&r));
        assert!(cmp("shell", QueryOp::Ne, "/bin/sh").matches_resource(&r));
        assert!(!cmp("shell", QueryOp::Eq, "/bin/sh").matches_resource(&r));
    }

    #[test]
    fn test_collector_query_title_and_tag() {
        let mut r = resource("alice", &[]);
        r.add_tag("ops", &Location::default()).unwrap();
        assert!(cmp("title", QueryOp::Eq, "alice").matches_resource(&r));
        assert!(cmp("tag", QueryOp::Eq, "ops").matches_resource(&r));
        assert!(cmp("tag", QueryOp::Eq, "user").matches_resource(&r));
        assert!(!cmp("tag", QueryOp::Eq, "dev").matches_resource(&r));
    }

    #[test]
    fn test_collector_query_boolean() {
        let r = resource("bob", &[("group", "dev"), ("shell", "zsh")]);
        let both = Query::And(
            Box::new(cmp("group", QueryOp::Eq, "dev")),
            Box::new(cmp("shell", QueryOp::Eq, "bash")),
        );
        let either = Query::Or(
            Box::new(cmp("group", QueryOp::Eq, "dev")),
            Box::new(cmp("shell", QueryOp::Eq, "bash")),
        );
        assert!(!both.matches_resource(&r));
        assert!(either.matches_resource(&r));
        assert_eq!(either.to_string(), "(group == 'dev' or shell == 'bash')");
    }

    #[test]
    fn test_collector_query_array_param() {
        let mut r = resource("carol", &[]);
        r.set(Param::new(
            "groups",
            Value::Array(vec![Value::from("wheel"), Value::from("dev")]),
            "main",
            Location::default(),
        ))
        .unwrap();
        assert!(cmp("groups", QueryOp::Eq, "dev").matches_resource(&r));
    }

    #[test]
    fn test_collector_descriptor_match() {
        let mut d = ResourceDescriptor::new("Sshkey", "web01", "web01");
        d.parameters.insert("type".into(), Value::from("rsa"));
        d.tags.push("ssh".into());
        assert!(cmp("type", QueryOp::Eq, "rsa").matches_descriptor(&d));
        assert!(cmp("tag", QueryOp::Eq, "ssh").matches_descriptor(&d));
        assert!(cmp("title", QueryOp::Eq, "web01").matches_descriptor(&d));
    }

    #[test]
    fn test_collector_list_unrealized() {
        let refs = vec![ResourceRef::new("user", "a"), ResourceRef::new("user", "b")];
        let mut c = Collector::list(refs, ScopeId::top(), Location::default());
        c.collected.insert(ResourceRef::new("user", "a"));
        assert_eq!(c.unrealized(), vec![ResourceRef::new("user", "b")]);
    }
}
