//! Project settings: `mantle.yaml`.
//!
//! Parsed with serde and validated separately so every problem is reported
//! at once:
//! - `manifest` must not be empty
//! - `max_generation_passes` must be at least 1
//! - module path entries must be distinct
//! - fact names must be valid variable names

use super::compiler::CompileOptions;
use super::error::{Error, Result};
use super::lexer::ParserOptions;
use super::types::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "mantle.yaml";

fn default_manifest() -> PathBuf {
    PathBuf::from("manifests/site.pp")
}

fn default_true() -> bool {
    true
}

fn default_passes() -> usize {
    super::compiler::DEFAULT_GENERATION_PASSES
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Entry manifest, relative to the settings file.
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,

    /// Directories holding autoloadable modules.
    #[serde(default)]
    pub modulepath: Vec<PathBuf>,

    #[serde(default)]
    pub strict_variables: bool,

    #[serde(default = "default_true")]
    pub declarative: bool,

    #[serde(default = "default_passes")]
    pub max_generation_passes: usize,

    /// Keep `#` comments preceding definitions as documentation.
    #[serde(default)]
    pub doc_comments: bool,

    /// Extra builtin resource types beyond the standard set.
    #[serde(default)]
    pub extra_types: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_dir: Option<PathBuf>,

    /// Facts applied to every node; node-specific facts override them.
    #[serde(default)]
    pub facts: IndexMap<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            manifest: default_manifest(),
            modulepath: Vec::new(),
            strict_variables: false,
            declarative: true,
            max_generation_passes: default_passes(),
            doc_comments: false,
            extra_types: Vec::new(),
            classifier_dir: None,
            export_dir: None,
            catalog_dir: None,
            facts: IndexMap::new(),
        }
    }
}

impl Settings {
    pub fn compile_options(&self) -> CompileOptions {
        let mut options = CompileOptions {
            strict_variables: self.strict_variables,
            declarative: self.declarative,
            max_generation_passes: self.max_generation_passes,
            ..CompileOptions::default()
        };
        options
            .builtin_types
            .extend(self.extra_types.iter().map(|t| t.to_lowercase()));
        options
    }

    pub fn parser_options(&self) -> ParserOptions {
        ParserOptions {
            doc_comments: self.doc_comments,
        }
    }

    /// Resolve relative paths against `base` (the settings file's directory).
    pub fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.manifest);
        self.modulepath.iter_mut().for_each(&join);
        for dir in [&mut self.classifier_dir, &mut self.export_dir, &mut self.catalog_dir]
            .into_iter()
            .flatten()
        {
            join(dir);
        }
    }
}

/// Validation error.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a settings file from disk. Relative paths in it are resolved
/// against the file's directory.
pub fn parse_settings_file(path: &Path) -> Result<Settings> {
    let content =
        std::fs::read_to_string(path).map_err(|e| Error::io(path.display().to_string(), e))?;
    let mut settings = parse_settings(&content)?;
    if let Some(base) = path.parent() {
        settings.resolve_paths(base);
    }
    Ok(settings)
}

pub fn parse_settings(yaml: &str) -> Result<Settings> {
    if yaml.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_yaml_ng::from_str(yaml).map_err(|e| Error::Config(format!("YAML parse error: {}", e)))
}

/// Validate parsed settings. Returns a list of errors (empty = valid).
pub fn validate_settings(settings: &Settings) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if settings.manifest.as_os_str().is_empty() {
        errors.push(ValidationError {
            message: "manifest must not be empty".to_string(),
        });
    }

    if settings.max_generation_passes == 0 {
        errors.push(ValidationError {
            message: "max_generation_passes must be at least 1".to_string(),
        });
    }

    for (i, dir) in settings.modulepath.iter().enumerate() {
        if settings.modulepath[..i].contains(dir) {
            errors.push(ValidationError {
                message: format!("modulepath lists '{}' more than once", dir.display()),
            });
        }
    }

    for name in settings.facts.keys() {
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            errors.push(ValidationError {
                message: format!("fact name '{}' is not a valid variable name", name),
            });
        }
    }

    for t in &settings.extra_types {
        if t.is_empty() || t.contains("::") || !t.chars().all(|c| c.is_alphanumeric() || c == '_') {
            errors.push(ValidationError {
                message: format!("extra type '{}' is not a valid type name", t),
            });
        }
    }

    errors
}
