//! Exported resource store.
//!
//! Nodes publish the resources they export with `@@` after compiling; other
//! nodes' `<<| |>>` collectors search the store. Publishing replaces the
//! node's previous set.

use super::{check_node_name, write_atomic, ResourceDescriptor};
use crate::core::collector::Query;
use crate::core::error::{Error, Result};
use crate::core::types::canonical_type;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use tracing::debug;

pub trait ExportStore: Send + Sync + Debug {
    /// Descriptors of `type_name` matching `query`, excluding those exported
    /// by `requesting_node`.
    fn search(
        &self,
        type_name: &str,
        query: Option<&Query>,
        requesting_node: &str,
    ) -> Result<Vec<ResourceDescriptor>>;

    fn publish(&self, node: &str, resources: Vec<ResourceDescriptor>) -> Result<()>;
}

fn select(
    descriptors: impl IntoIterator<Item = ResourceDescriptor>,
    type_name: &str,
    query: Option<&Query>,
    requesting_node: &str,
) -> Vec<ResourceDescriptor> {
    let wanted = canonical_type(type_name);
    descriptors
        .into_iter()
        .filter(|d| {
            d.node != requesting_node
                && canonical_type(&d.type_name) == wanted
                && query.is_none_or(|q| q.matches_descriptor(d))
        })
        .collect()
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryExportStore {
    nodes: RwLock<IndexMap<String, Vec<ResourceDescriptor>>>,
}

impl MemoryExportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exported_by(&self, node: &str) -> Vec<ResourceDescriptor> {
        self.nodes.read().get(node).cloned().unwrap_or_default()
    }
}

impl ExportStore for MemoryExportStore {
    fn search(
        &self,
        type_name: &str,
        query: Option<&Query>,
        requesting_node: &str,
    ) -> Result<Vec<ResourceDescriptor>> {
        let nodes = self.nodes.read();
        Ok(select(
            nodes.values().flatten().cloned(),
            type_name,
            query,
            requesting_node,
        ))
    }

    fn publish(&self, node: &str, resources: Vec<ResourceDescriptor>) -> Result<()> {
        self.nodes.write().insert(node.to_string(), resources);
        Ok(())
    }
}

// ============================================================================
// File store
// ============================================================================

/// Keeps `<dir>/<node>/exports.yaml` per exporting node.
#[derive(Debug, Clone)]
pub struct FileExportStore {
    dir: PathBuf,
}

impl FileExportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, node: &str) -> PathBuf {
        self.dir.join(node).join("exports.yaml")
    }

    fn read_node(path: &Path) -> Result<Vec<ResourceDescriptor>> {
        let content =
            std::fs::read_to_string(path).map_err(|e| Error::io(path.display().to_string(), e))?;
        serde_yaml_ng::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid export file {}: {}", path.display(), e)))
    }
}

impl ExportStore for FileExportStore {
    fn search(
        &self,
        type_name: &str,
        query: Option<&Query>,
        requesting_node: &str,
    ) -> Result<Vec<ResourceDescriptor>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| Error::io(self.dir.display().to_string(), e))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path().join("exports.yaml"))
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        let mut all = Vec::new();
        for file in &files {
            all.extend(Self::read_node(file)?);
        }
        Ok(select(all, type_name, query, requesting_node))
    }

    fn publish(&self, node: &str, resources: Vec<ResourceDescriptor>) -> Result<()> {
        check_node_name(node)?;
        let path = self.path_for(node);
        let yaml = serde_yaml_ng::to_string(&resources)
            .map_err(|e| Error::Config(format!("cannot serialize exports: {}", e)))?;
        write_atomic(&path, &yaml)?;
        debug!(node, resources = resources.len(), file = %path.display(), "published exports");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ast::QueryOp;
    use crate::core::types::Value;

    fn key(node: &str, title: &str, tag: &str) -> ResourceDescriptor {
        let mut d = ResourceDescriptor::new("Sshkey", title, node);
        d.parameters.insert("type".into(), Value::from("rsa"));
        d.tags = vec!["sshkey".into(), tag.into()];
        d
    }

    fn tagged(tag: &str) -> Query {
        Query::Compare {
            param: "tag".into(),
            op: QueryOp::Eq,
            value: Value::from(tag),
        }
    }

    #[test]
    fn test_exports_memory_search_excludes_requester() {
        let store = MemoryExportStore::new();
        store.publish("web01", vec![key("web01", "web01", "web")]).unwrap();
        store.publish("db01", vec![key("db01", "db01", "db")]).unwrap();
        let found = store.search("sshkey", None, "web01").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].node, "db01");
        let found = store.search("Sshkey", Some(&tagged("web")), "db01").unwrap();
        assert_eq!(found.len(), 1);
        assert!(store.search("User", None, "x").unwrap().is_empty());
    }

    #[test]
    fn test_exports_memory_publish_replaces() {
        let store = MemoryExportStore::new();
        store.publish("web01", vec![key("web01", "a", "web"), key("web01", "b", "web")]).unwrap();
        store.publish("web01", vec![key("web01", "c", "web")]).unwrap();
        let titles: Vec<String> = store.exported_by("web01").into_iter().map(|d| d.title).collect();
        assert_eq!(titles, vec!["c"]);
    }

    #[test]
    fn test_exports_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileExportStore::new(dir.path());
        store.publish("web01", vec![key("web01", "web01", "web")]).unwrap();
        store.publish("web02", vec![key("web02", "web02", "web")]).unwrap();
        assert!(dir.path().join("web01/exports.yaml").is_file());
        let found = store.search("Sshkey", Some(&tagged("web")), "db01").unwrap();
        let nodes: Vec<&str> = found.iter().map(|d| d.node.as_str()).collect();
        assert_eq!(nodes, vec!["web01", "web02"]);
        assert_eq!(found[0].parameters["type"], Value::from("rsa"));
    }

    #[test]
    fn test_exports_file_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileExportStore::new(dir.path().join("none"));
        assert!(store.search("Sshkey", None, "web01").unwrap().is_empty());
    }
}
