//! In-memory loader for tests and embedding.

use super::{
    normalize_path, split_module_pattern, with_manifest_extension, SourceFile, SourceLoader,
};
use crate::core::error::{Error, Result};
use crate::core::types::Location;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    files: IndexMap<PathBuf, String>,
    modules: IndexMap<String, PathBuf>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl AsRef<Path>, contents: &str) -> Self {
        self.files
            .insert(normalize_path(path.as_ref()), contents.to_string());
        self
    }

    /// Register `root` as the directory of module `name`.
    pub fn with_module_root(mut self, name: &str, root: impl AsRef<Path>) -> Self {
        self.modules
            .insert(name.to_string(), normalize_path(root.as_ref()));
        self
    }

    /// Replace a file's contents, as an editor would.
    pub fn set_file(&mut self, path: impl AsRef<Path>, contents: &str) {
        self.files
            .insert(normalize_path(path.as_ref()), contents.to_string());
    }

    fn matching(&self, pattern: &Path) -> Result<Vec<PathBuf>> {
        let text = pattern.to_string_lossy();
        let compiled = glob::Pattern::new(&text).map_err(|e| {
            Error::parse(
                format!("invalid import pattern '{}': {}", text, e),
                Location::default(),
            )
        })?;
        let options = glob::MatchOptions {
            require_literal_separator: true,
            ..glob::MatchOptions::new()
        };
        let mut found: Vec<PathBuf> = self
            .files
            .keys()
            .filter(|p| compiled.matches_path_with(p, options))
            .cloned()
            .collect();
        found.sort();
        Ok(found)
    }
}

impl SourceLoader for MemoryLoader {
    fn resolve_manifest(&self, pattern: &str, cwd: Option<&Path>) -> Result<Vec<SourceFile>> {
        let base = match cwd {
            Some(dir) if !Path::new(pattern).is_absolute() => normalize_path(&dir.join(pattern)),
            _ => normalize_path(Path::new(pattern)),
        };
        let mut paths = self.matching(&base)?;
        if paths.is_empty() {
            paths = self.matching(Path::new(&with_manifest_extension(&base.to_string_lossy())))?;
        }
        if paths.is_empty() {
            if let Some((module, rest)) = split_module_pattern(pattern) {
                if let Some(root) = self.resolve_module(module) {
                    paths = self.matching(&root.join("manifests").join(with_manifest_extension(rest)))?;
                }
            }
        }
        let mut sources = Vec::new();
        for path in paths {
            if let Some(source) = self.read(&path)? {
                sources.push(source);
            }
        }
        Ok(sources)
    }

    fn resolve_module(&self, name: &str) -> Option<PathBuf> {
        self.modules.get(name).cloned()
    }

    fn read(&self, path: &Path) -> Result<Option<SourceFile>> {
        let path = normalize_path(path);
        Ok(self.files.get(&path).map(|contents| SourceFile {
            path: path.clone(),
            contents: contents.clone(),
        }))
    }
}
