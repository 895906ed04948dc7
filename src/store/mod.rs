//! Collaborators outside the compiler: node classification, the exported
//! resource store and catalog persistence.
//!
//! Each concern is a `Send + Sync` trait so one implementation can serve many
//! concurrent compilations. The file-backed implementations write atomically
//! (temp file, then rename).

pub mod catalogs;
pub mod classifier;
pub mod exports;

pub use catalogs::{CatalogSink, FileCatalogSink};
pub use classifier::{Classification, NodeClassifier, YamlClassifier};
pub use exports::{ExportStore, FileExportStore, MemoryExportStore};

use crate::core::catalog::CatalogResource;
use crate::core::error::{Error, Result};
use crate::core::types::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// An exported resource as stored for other nodes to collect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    #[serde(rename = "type")]
    pub type_name: String,
    pub title: String,
    #[serde(default)]
    pub parameters: IndexMap<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Node that exported the resource.
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub line: u32,
}

impl ResourceDescriptor {
    pub fn new(type_name: &str, title: &str, node: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            title: title.to_string(),
            parameters: IndexMap::new(),
            tags: Vec::new(),
            node: node.to_string(),
            file: None,
            line: 0,
        }
    }

    /// Describe a compiled catalog resource exported by `node`.
    pub fn from_catalog(resource: &CatalogResource, node: &str) -> Self {
        Self {
            type_name: resource.type_name.clone(),
            title: resource.title.clone(),
            parameters: resource.parameters.clone(),
            tags: resource.tags.clone(),
            node: node.to_string(),
            file: resource.file.clone(),
            line: resource.line,
        }
    }
}

/// Write `contents` to `path` via a sibling temp file and a rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent.display().to_string(), e))?;
    }
    let tmp = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or_default()
    ));
    std::fs::write(&tmp, contents).map_err(|e| Error::io(tmp.display().to_string(), e))?;
    std::fs::rename(&tmp, path).map_err(|e| Error::io(path.display().to_string(), e))?;
    Ok(())
}

/// Node names become directory names; refuse anything that could escape.
pub(crate) fn check_node_name(node: &str) -> Result<()> {
    if node.is_empty() || node.contains(['/', '\\']) || node.starts_with('.') {
        return Err(Error::Config(format!("invalid node name '{}'", node)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_descriptor_from_catalog() {
        let mut parameters = IndexMap::new();
        parameters.insert("key".to_string(), Value::from("AAAA"));
        let resource = CatalogResource {
            type_name: "Sshkey".into(),
            title: "web01".into(),
            parameters,
            tags: vec!["sshkey".into()],
            file: Some("site.pp".into()),
            line: 4,
            exported: true,
        };
        let d = ResourceDescriptor::from_catalog(&resource, "web01");
        assert_eq!(d.type_name, "Sshkey");
        assert_eq!(d.node, "web01");
        assert_eq!(d.line, 4);
        let yaml = serde_yaml_ng::to_string(&d).unwrap();
        assert!(yaml.contains("type: Sshkey"));
    }

    #[test]
    fn test_store_write_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/out.yaml");
        write_atomic(&path, "x: 1\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x: 1\n");
        assert!(!dir.path().join("a/b/out.yaml.tmp").exists());
    }

    #[test]
    fn test_store_check_node_name() {
        assert!(check_node_name("web01.example.com").is_ok());
        assert!(check_node_name("../etc").is_err());
        assert!(check_node_name("a/b").is_err());
        assert!(check_node_name("").is_err());
    }
}
