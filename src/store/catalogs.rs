//! Catalog persistence.

use super::{check_node_name, write_atomic};
use crate::core::catalog::Catalog;
use crate::core::error::{Error, Result};
use crate::tripwire::eventlog::{self, CompileEvent};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use tracing::info;

pub trait CatalogSink: Send + Sync + Debug {
    fn persist(&self, catalog: &Catalog) -> Result<()>;
}

/// Writes `<dir>/<node>/catalog.json` and records each write in the node's
/// event log next to it.
#[derive(Debug, Clone)]
pub struct FileCatalogSink {
    dir: PathBuf,
}

impl FileCatalogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, node: &str) -> PathBuf {
        self.dir.join(node).join("catalog.json")
    }

    /// The last catalog persisted for `node`, if any.
    pub fn load(&self, node: &str) -> Result<Option<Catalog>> {
        check_node_name(node)?;
        let path = self.path_for(node);
        if !path.exists() {
            return Ok(None);
        }
        let content =
            std::fs::read_to_string(&path).map_err(|e| Error::io(path.display().to_string(), e))?;
        let catalog = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid catalog {}: {}", path.display(), e)))?;
        Ok(Some(catalog))
    }
}

impl CatalogSink for FileCatalogSink {
    fn persist(&self, catalog: &Catalog) -> Result<()> {
        check_node_name(&catalog.name)?;
        let path = self.path_for(&catalog.name);
        write_atomic(&path, &catalog.to_json()?)?;
        let digest = catalog.digest()?;
        eventlog::append_event(
            &self.dir,
            &catalog.name,
            CompileEvent::CatalogPersisted {
                node: catalog.name.clone(),
                catalog_version: catalog.version.clone(),
                digest: digest.clone(),
            },
        )?;
        info!(node = %catalog.name, file = %path.display(), %digest, "catalog persisted");
        Ok(())
    }
}
