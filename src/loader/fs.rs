//! Filesystem loader over a module path.

use super::{
    normalize_path, split_module_pattern, with_manifest_extension, SourceFile, SourceLoader,
};
use crate::core::error::{Error, Result};
use crate::core::types::Location;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Loads manifests from disk. Modules are directories named after the module
/// inside any of the `modulepath` entries; earlier entries win.
#[derive(Debug, Clone, Default)]
pub struct FsLoader {
    modulepath: Vec<PathBuf>,
}

impl FsLoader {
    pub fn new(modulepath: Vec<PathBuf>) -> Self {
        Self { modulepath }
    }

    pub fn modulepath(&self) -> &[PathBuf] {
        &self.modulepath
    }

    fn glob_files(&self, pattern: &Path) -> Result<Vec<PathBuf>> {
        let text = pattern.to_string_lossy();
        let paths = glob::glob(&text).map_err(|e| {
            Error::parse(
                format!("invalid import pattern '{}': {}", text, e),
                Location::default(),
            )
        })?;
        let mut files: Vec<PathBuf> = paths
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .map(|p| normalize_path(&p))
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    fn matching_files(&self, pattern: &str, cwd: Option<&Path>) -> Result<Vec<PathBuf>> {
        let base = match cwd {
            Some(dir) if !Path::new(pattern).is_absolute() => dir.join(pattern),
            _ => PathBuf::from(pattern),
        };
        let files = self.glob_files(&base)?;
        if !files.is_empty() {
            return Ok(files);
        }
        let extended = with_manifest_extension(&base.to_string_lossy());
        let files = self.glob_files(Path::new(&extended))?;
        if !files.is_empty() {
            return Ok(files);
        }
        if let Some((module, rest)) = split_module_pattern(pattern) {
            if let Some(root) = self.resolve_module(module) {
                let inside = root.join("manifests").join(with_manifest_extension(rest));
                return self.glob_files(&inside);
            }
        }
        Ok(Vec::new())
    }
}

impl SourceLoader for FsLoader {
    fn resolve_manifest(&self, pattern: &str, cwd: Option<&Path>) -> Result<Vec<SourceFile>> {
        let mut sources = Vec::new();
        for path in self.matching_files(pattern, cwd)? {
            if let Some(source) = self.read(&path)? {
                sources.push(source);
            }
        }
        debug!(pattern, found = sources.len(), "resolved import");
        Ok(sources)
    }

    fn resolve_module(&self, name: &str) -> Option<PathBuf> {
        self.modulepath
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_dir())
    }

    fn read(&self, path: &Path) -> Result<Option<SourceFile>> {
        if !path.is_file() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::io(path.display().to_string(), e))?;
        Ok(Some(SourceFile {
            path: normalize_path(path),
            contents,
        }))
    }
}
