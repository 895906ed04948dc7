//! Source discovery: resolving imports and autoloading module manifests.
//!
//! The registry never touches the filesystem directly; it asks a
//! [`SourceLoader`] for files matching an import pattern and for the root
//! directory of a module. `FsLoader` serves a real module path, `MemoryLoader`
//! serves sources held in memory for tests and embedding.

pub mod fs;
pub mod memory;

pub use fs::FsLoader;
pub use memory::MemoryLoader;

use crate::core::error::Result;
use std::path::{Component, Path, PathBuf};

/// Extension appended to import patterns that do not name one.
pub const MANIFEST_EXTENSION: &str = "pp";

/// One manifest file and its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Where manifests come from.
pub trait SourceLoader: Send + Sync + std::fmt::Debug {
    /// Files matching an import pattern, sorted by path. Relative patterns are
    /// resolved against `cwd`, then against the module path (`mod/file`
    /// names `<module>/manifests/file.pp`). An empty result means no match.
    fn resolve_manifest(&self, pattern: &str, cwd: Option<&Path>) -> Result<Vec<SourceFile>>;

    /// Root directory of a module, if one with that name exists.
    fn resolve_module(&self, name: &str) -> Option<PathBuf>;

    /// Read one file. `Ok(None)` when it does not exist.
    fn read(&self, path: &Path) -> Result<Option<SourceFile>>;
}

/// `foo` → `foo.pp`; patterns that already carry an extension are unchanged.
pub fn with_manifest_extension(pattern: &str) -> String {
    let file = pattern.rsplit('/').next().unwrap_or(pattern);
    if file.contains('.') || file.ends_with('*') {
        pattern.to_string()
    } else {
        format!("{}.{}", pattern, MANIFEST_EXTENSION)
    }
}

/// Manifest that autoloading expects to define `class`, relative to its
/// module root: `a` → `manifests/init.pp`, `a::b::c` → `manifests/b/c.pp`.
pub fn module_manifest_path(module_root: &Path, class: &str) -> PathBuf {
    let segments: Vec<&str> = class.trim_start_matches("::").split("::").collect();
    let mut path = module_root.join("manifests");
    if segments.len() <= 1 {
        return path.join(format!("init.{}", MANIFEST_EXTENSION));
    }
    for segment in &segments[1..segments.len() - 1] {
        path.push(segment);
    }
    path.join(format!("{}.{}", segments[segments.len() - 1], MANIFEST_EXTENSION))
}

/// Split `mod/rest/of/file` into the module name and the path inside its
/// `manifests` directory.
pub fn split_module_pattern(pattern: &str) -> Option<(&str, &str)> {
    if pattern.starts_with('/') || pattern.starts_with('.') {
        return None;
    }
    let (module, rest) = pattern.split_once('/')?;
    if module.is_empty() || rest.is_empty() {
        return None;
    }
    Some((module, rest))
}

/// Remove `.` and `..` components without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loader_manifest_extension() {
        assert_eq!(with_manifest_extension("nodes"), "nodes.pp");
        assert_eq!(with_manifest_extension("nodes.pp"), "nodes.pp");
        assert_eq!(with_manifest_extension("dir/*"), "dir/*");
        assert_eq!(with_manifest_extension("v1.2/site"), "v1.2/site.pp");
    }

    #[test]
    fn test_loader_module_manifest_path() {
        let root = Path::new("/mods/apache");
        assert_eq!(
            module_manifest_path(root, "apache"),
            PathBuf::from("/mods/apache/manifests/init.pp")
        );
        assert_eq!(
            module_manifest_path(root, "apache::mod::ssl"),
            PathBuf::from("/mods/apache/manifests/mod/ssl.pp")
        );
        assert_eq!(
            module_manifest_path(root, "::apache::vhost"),
            PathBuf::from("/mods/apache/manifests/vhost.pp")
        );
    }

    #[test]
    fn test_loader_split_module_pattern() {
        assert_eq!(split_module_pattern("apache/vhosts"), Some(("apache", "vhosts")));
        assert_eq!(split_module_pattern("/abs/file"), None);
        assert_eq!(split_module_pattern("./rel"), None);
        assert_eq!(split_module_pattern("plain"), None);
    }

    #[test]
    fn test_loader_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d.pp")),
            PathBuf::from("/a/c/d.pp")
        );
        assert_eq!(normalize_path(Path::new("a/../../b")), PathBuf::from("../b"));
    }
}
