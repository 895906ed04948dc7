//! Source change detection: compare loaded manifests to recorded hashes.
//!
//! The registry records the hash of every file it parses. A catalog's version
//! is the composite of those hashes, so any edit to any loaded manifest yields
//! a new version. The recorded set can be saved and compared later to report
//! which manifests changed since.

use super::hasher;
use crate::core::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Marker used as the actual hash of a file that no longer exists.
pub const MISSING: &str = "MISSING";

/// One manifest whose contents differ from the recorded hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleFinding {
    pub path: PathBuf,
    pub expected_hash: String,
    pub actual_hash: String,
    pub detail: String,
}

/// Hashes of every loaded manifest, in load order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceWatch {
    pub files: IndexMap<PathBuf, String>,
}

impl SourceWatch {
    pub fn record(&mut self, path: &Path, contents: &str) {
        self.files
            .insert(path.to_path_buf(), hasher::hash_string(contents));
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Digest of the whole loaded set; independent of load order.
    pub fn version(&self) -> String {
        let mut entries: Vec<String> = self
            .files
            .iter()
            .map(|(p, h)| format!("{}={}", p.display(), h))
            .collect();
        entries.sort();
        let refs: Vec<&str> = entries.iter().map(String::as_str).collect();
        hasher::composite_hash(&refs)
    }

    /// Re-read every recorded file through `read` (contents, or `None` when
    /// gone) and report the ones that changed.
    pub fn check<F>(&self, read: F) -> Result<Vec<StaleFinding>>
    where
        F: Fn(&Path) -> Result<Option<String>>,
    {
        let mut findings = Vec::new();
        for (path, expected) in &self.files {
            let finding = match read(path)? {
                None => Some(StaleFinding {
                    path: path.clone(),
                    expected_hash: expected.clone(),
                    actual_hash: MISSING.to_string(),
                    detail: format!("{} does not exist", path.display()),
                }),
                Some(contents) => {
                    let actual = hasher::hash_string(&contents);
                    (actual != *expected).then(|| StaleFinding {
                        path: path.clone(),
                        expected_hash: expected.clone(),
                        actual_hash: actual,
                        detail: format!("{} content changed", path.display()),
                    })
                }
            };
            findings.extend(finding);
        }
        Ok(findings)
    }

    /// Differences between this recorded set and a freshly loaded one,
    /// including files that were added or are no longer loaded.
    pub fn diff(&self, current: &SourceWatch) -> Vec<StaleFinding> {
        let mut findings = Vec::new();
        for (path, expected) in &self.files {
            match current.files.get(path) {
                Some(actual) if actual == expected => {}
                Some(actual) => findings.push(StaleFinding {
                    path: path.clone(),
                    expected_hash: expected.clone(),
                    actual_hash: actual.clone(),
                    detail: format!("{} content changed", path.display()),
                }),
                None => findings.push(StaleFinding {
                    path: path.clone(),
                    expected_hash: expected.clone(),
                    actual_hash: MISSING.to_string(),
                    detail: format!("{} is no longer loaded", path.display()),
                }),
            }
        }
        for (path, actual) in &current.files {
            if !self.files.contains_key(path) {
                findings.push(StaleFinding {
                    path: path.clone(),
                    expected_hash: MISSING.to_string(),
                    actual_hash: actual.clone(),
                    detail: format!("{} was added", path.display()),
                });
            }
        }
        findings
    }
}

/// Check a single file on disk against a recorded hash.
pub fn check_file_stale(path: &Path, expected_hash: &str) -> Option<StaleFinding> {
    if !path.exists() {
        return Some(StaleFinding {
            path: path.to_path_buf(),
            expected_hash: expected_hash.to_string(),
            actual_hash: MISSING.to_string(),
            detail: format!("{} does not exist", path.display()),
        });
    }
    let actual = hasher::hash_file(path).unwrap_or_else(|e| format!("ERROR:{}", e));
    (actual != expected_hash).then(|| StaleFinding {
        path: path.to_path_buf(),
        expected_hash: expected_hash.to_string(),
        actual_hash: actual,
        detail: format!("{} content changed", path.display()),
    })
}

/// Save a recorded set as YAML (atomic write via temp file + rename).
pub fn save_watch(path: &Path, watch: &SourceWatch) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent.display().to_string(), e))?;
    }
    let yaml = serde_yaml_ng::to_string(watch)
        .map_err(|e| Error::Config(format!("cannot serialize source hashes: {}", e)))?;
    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, yaml).map_err(|e| Error::io(tmp_path.display().to_string(), e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| Error::io(path.display().to_string(), e))?;
    Ok(())
}

/// Load a recorded set. `Ok(None)` when nothing was recorded yet.
pub fn load_watch(path: &Path) -> Result<Option<SourceWatch>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        std::fs::read_to_string(path).map_err(|e| Error::io(path.display().to_string(), e))?;
    let watch = serde_yaml_ng::from_str(&content)
        .map_err(|e| Error::Config(format!("invalid source hash file {}: {}", path.display(), e)))?;
    Ok(Some(watch))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watch(files: &[(&str, &str)]) -> SourceWatch {
        let mut w = SourceWatch::default();
        for (path, contents) in files {
            w.record(Path::new(path), contents);
        }
        w
    }

    #[test]
    fn test_watch_version_ignores_order() {
        let a = watch(&[("/a.pp", "a"), ("/b.pp", "b")]);
        let b = watch(&[("/b.pp", "b"), ("/a.pp", "a")]);
        assert_eq!(a.version(), b.version());
        let c = watch(&[("/a.pp", "a"), ("/b.pp", "b2")]);
        assert_ne!(a.version(), c.version());
    }

    #[test]
    fn test_watch_check_reports_changed_and_missing() {
        let w = watch(&[("/a.pp", "a"), ("/b.pp", "b"), ("/c.pp", "c")]);
        let findings = w
            .check(|p| {
                Ok(match p.to_str() {
                    Some("/a.pp") => Some("a".to_string()),
                    Some("/b.pp") => Some("changed".to_string()),
                    _ => None,
                })
            })
            .unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].path, PathBuf::from("/b.pp"));
        assert_eq!(findings[1].actual_hash, MISSING);
    }

    #[test]
    fn test_watch_diff_added_removed_changed() {
        let old = watch(&[("/a.pp", "a"), ("/b.pp", "b")]);
        let new = watch(&[("/a.pp", "a2"), ("/c.pp", "c")]);
        let findings = old.diff(&new);
        let details: Vec<_> = findings.iter().map(|f| f.detail.clone()).collect();
        assert_eq!(
            details,
            vec![
                "/a.pp content changed",
                "/b.pp is no longer loaded",
                "/c.pp was added"
            ]
        );
        assert!(old.diff(&old).is_empty());
    }

    #[test]
    fn test_watch_check_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.pp");
        std::fs::write(&path, "node default {}").unwrap();
        let expected = hasher::hash_string("node default {}");
        assert!(check_file_stale(&path, &expected).is_none());
        std::fs::write(&path, "node web {}").unwrap();
        let finding = check_file_stale(&path, &expected).unwrap();
        assert!(finding.detail.contains("content changed"));
        std::fs::remove_file(&path).unwrap();
        assert_eq!(check_file_stale(&path, &expected).unwrap().actual_hash, MISSING);
    }

    #[test]
    fn test_watch_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/sources.yaml");
        assert!(load_watch(&path).unwrap().is_none());
        let w = watch(&[("/a.pp", "a")]);
        save_watch(&path, &w).unwrap();
        assert_eq!(load_watch(&path).unwrap(), Some(w));
        assert!(!dir.path().join("state/sources.yaml.tmp").exists());
    }
}
