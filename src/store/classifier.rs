//! External node classification.
//!
//! A classifier assigns classes and top-scope parameters to a node from
//! outside the manifests. `YamlClassifier` reads one file per node:
//!
//! ```yaml
//! classes: [base, web]
//! parameters:
//!   datacenter: ams1
//! parent: webservers
//! ```

use super::check_node_name;
use crate::core::error::{Error, Result};
use crate::core::types::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Classification {
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub parameters: IndexMap<String, Value>,
    /// Node definition to use when none matches the node's own name.
    #[serde(default)]
    pub parent: Option<String>,
}

pub trait NodeClassifier: Send + Sync + Debug {
    /// Classification for `node`, or `None` when the classifier knows nothing
    /// about it.
    fn classify(&self, node: &str) -> Result<Option<Classification>>;
}

/// Reads `<dir>/<node>.yaml`.
#[derive(Debug, Clone)]
pub struct YamlClassifier {
    dir: PathBuf,
}

impl YamlClassifier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, node: &str) -> PathBuf {
        self.dir.join(format!("{}.yaml", node))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl NodeClassifier for YamlClassifier {
    fn classify(&self, node: &str) -> Result<Option<Classification>> {
        check_node_name(node)?;
        let path = self.path_for(node);
        if !path.exists() {
            return Ok(None);
        }
        let content =
            std::fs::read_to_string(&path).map_err(|e| Error::io(path.display().to_string(), e))?;
        let classification = serde_yaml_ng::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid classification {}: {}", path.display(), e)))?;
        Ok(Some(classification))
    }
}
