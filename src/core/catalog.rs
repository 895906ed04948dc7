//! The compiled catalog: resources plus containment and relationship edges.
//!
//! Resources are keyed by their `Type[title]` display form and keep the order
//! in which the compiler declared them. Edges are either containment (every
//! resource but `Stage[main]` has exactly one container) or relationships
//! (`before` / `notify`) used for ordering.

use super::error::{Error, Result};
use super::types::{ResourceRef, Value};
use crate::tripwire::hasher;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogResource {
    #[serde(rename = "type")]
    pub type_name: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub parameters: IndexMap<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub exported: bool,
}

impl CatalogResource {
    pub fn reference(&self) -> ResourceRef {
        ResourceRef {
            type_name: self.type_name.clone(),
            title: self.title.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Contains,
    Before,
    Notify,
}

impl EdgeKind {
    pub fn is_relationship(self) -> bool {
        !matches!(self, Self::Contains)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub name: String,
    pub version: String,
    pub classes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub resources: IndexMap<String, CatalogResource>,
    pub edges: Vec<Edge>,
}

impl Catalog {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    pub fn add_resource(&mut self, resource: CatalogResource) {
        let key = resource.reference().to_string();
        self.resources.insert(key, resource);
    }

    pub fn add_edge(&mut self, source: &ResourceRef, target: &ResourceRef, kind: EdgeKind) {
        self.edges.push(Edge {
            source: source.to_string(),
            target: target.to_string(),
            kind,
        });
    }

    pub fn resource(&self, reference: &str) -> Option<&CatalogResource> {
        self.resources.get(reference)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn relationship_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(|e| e.kind.is_relationship())
    }

    pub fn container_of(&self, reference: &str) -> Option<&str> {
        self.edges
            .iter()
            .find(|e| e.kind == EdgeKind::Contains && e.target == reference)
            .map(|e| e.source.as_str())
    }

    pub fn contents_of(&self, reference: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.kind == EdgeKind::Contains && e.source == reference)
            .map(|e| e.target.as_str())
            .collect()
    }

    /// Every resource that must come after `reference`, nearest first.
    pub fn downstream(&self, reference: &str) -> Vec<&str> {
        self.walk(reference, |e| (e.source.as_str(), e.target.as_str()))
    }

    /// Every resource that must come before `reference`, nearest first.
    pub fn upstream(&self, reference: &str) -> Vec<&str> {
        self.walk(reference, |e| (e.target.as_str(), e.source.as_str()))
    }

    fn walk<'a>(&'a self, start: &str, dir: impl Fn(&'a Edge) -> (&'a str, &'a str)) -> Vec<&'a str> {
        let mut seen: IndexSet<&str> = IndexSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        for edge in self.relationship_edges() {
            let (from, to) = dir(edge);
            if from == start && seen.insert(to) {
                queue.push_back(to);
            }
        }
        while let Some(current) = queue.pop_front() {
            for edge in self.relationship_edges() {
                let (from, to) = dir(edge);
                if from == current && to != start && seen.insert(to) {
                    queue.push_back(to);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Topological order of all resources over relationship edges (Kahn's
    /// algorithm with sorted tie-breaking).
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let mut in_degree: IndexMap<&str, usize> =
            self.resources.keys().map(|k| (k.as_str(), 0)).collect();
        let mut adjacency: IndexMap<&str, Vec<&str>> =
            self.resources.keys().map(|k| (k.as_str(), Vec::new())).collect();

        for edge in self.relationship_edges() {
            let (Some(out), true) = (
                adjacency.get_mut(edge.source.as_str()),
                in_degree.contains_key(edge.target.as_str()),
            ) else {
                continue;
            };
            out.push(edge.target.as_str());
            if let Some(degree) = in_degree.get_mut(edge.target.as_str()) {
                *degree += 1;
            }
        }

        let mut zero: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(id, _)| *id)
            .collect();
        zero.sort_unstable();
        let mut queue: VecDeque<&str> = zero.into_iter().collect();

        let mut order = Vec::with_capacity(self.resources.len());
        while let Some(current) = queue.pop_front() {
            order.push(current.to_string());
            let mut ready = Vec::new();
            for next in adjacency.get(current).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(*next);
                    }
                }
            }
            ready.sort_unstable();
            queue.extend(ready);
        }

        if order.len() != self.resources.len() {
            let ordered: IndexSet<&str> = order.iter().map(String::as_str).collect();
            let mut members: Vec<String> = self
                .resources
                .keys()
                .filter(|k| !ordered.contains(k.as_str()))
                .cloned()
                .collect();
            members.sort();
            return Err(Error::Cycle { members });
        }
        Ok(order)
    }

    /// Resources declared with `@@`.
    pub fn exported_resources(&self) -> impl Iterator<Item = &CatalogResource> {
        self.resources.values().filter(|r| r.exported)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("cannot serialize catalog: {}", e)))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(self)
            .map_err(|e| Error::Config(format!("cannot serialize catalog: {}", e)))
    }

    /// BLAKE3 digest of the serialized catalog.
    pub fn digest(&self) -> Result<String> {
        let json = serde_json::to_string(self)
            .map_err(|e| Error::Config(format!("cannot serialize catalog: {}", e)))?;
        Ok(hasher::hash_string(&json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(type_name: &str, title: &str) -> CatalogResource {
        CatalogResource {
            type_name: type_name.into(),
            title: title.into(),
            parameters: IndexMap::new(),
            tags: Vec::new(),
            file: None,
            line: 0,
            exported: false,
        }
    }

    fn r(text: &str) -> ResourceRef {
        ResourceRef::parse(text).unwrap()
    }

    fn sample() -> Catalog {
        let mut c = Catalog::new("web01", "v1");
        for (t, title) in [("Stage", "main"), ("Class", "main"), ("Package", "nginx"), ("File", "conf"), ("Service", "nginx")] {
            c.add_resource(res(t, title));
        }
        c.add_edge(&r("Stage[main]"), &r("Class[main]"), EdgeKind::Contains);
        c.add_edge(&r("Class[main]"), &r("Package[nginx]"), EdgeKind::Contains);
        c.add_edge(&r("Class[main]"), &r("File[conf]"), EdgeKind::Contains);
        c.add_edge(&r("Class[main]"), &r("Service[nginx]"), EdgeKind::Contains);
        c.add_edge(&r("Package[nginx]"), &r("File[conf]"), EdgeKind::Before);
        c.add_edge(&r("File[conf]"), &r("Service[nginx]"), EdgeKind::Notify);
        c
    }

    #[test]
    fn test_catalog_containment_queries() {
        let c = sample();
        assert_eq!(c.container_of("File[conf]"), Some("Class[main]"));
        assert_eq!(c.container_of("Stage[main]"), None);
        assert_eq!(c.contents_of("Class[main]").len(), 3);
    }

    #[test]
    fn test_catalog_downstream_upstream() {
        let c = sample();
        assert_eq!(c.downstream("Package[nginx]"), vec!["File[conf]", "Service[nginx]"]);
        assert_eq!(c.upstream("Service[nginx]"), vec!["File[conf]", "Package[nginx]"]);
        assert!(c.downstream("Service[nginx]").is_empty());
    }

    #[test]
    fn test_catalog_execution_order() {
        let order = sample().execution_order().unwrap();
        let pos = |k: &str| order.iter().position(|o| o == k).unwrap();
        assert!(pos("Package[nginx]") < pos("File[conf]"));
        assert!(pos("File[conf]") < pos("Service[nginx]"));
        assert_eq!(order.len(), 5);
    }

    #[test]
    fn test_catalog_execution_order_deterministic() {
        let a = sample().execution_order().unwrap();
        let b = sample().execution_order().unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0], "Class[main]");
    }

    #[test]
    fn test_catalog_cycle_detected() {
        let mut c = sample();
        c.add_edge(&r("Service[nginx]"), &r("Package[nginx]"), EdgeKind::Before);
        match c.execution_order().unwrap_err() {
            Error::Cycle { members } => {
                assert_eq!(members, vec!["File[conf]", "Package[nginx]", "Service[nginx]"]);
            }
            other => panic!("expected cycle, got {}", other),
        }
    }

    #[test]
    fn test_catalog_serde_and_digest() {
        let c = sample();
        let json = c.to_json().unwrap();
        assert!(json.contains("\"type\": \"Package\""));
        assert!(json.contains("\"kind\": \"notify\""));
        let back: Catalog = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
        assert_eq!(c.digest().unwrap(), back.digest().unwrap());
        let yaml = c.to_yaml().unwrap();
        assert!(yaml.contains("name: web01"));
    }
}
