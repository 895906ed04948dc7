//! Resource type registry: classes, defines and nodes of one environment.
//!
//! The registry is shared read-mostly across compilations as an
//! `Arc<Registry>`. Files are parsed once; imports are resolved eagerly at
//! load time and class/define lookups that miss trigger autoloading from the
//! module path. Both caches only ever grow.

use super::ast::{Block, Definition, DefinitionKind, Expr, Manifest};
use super::compiler::Compiler;
use super::error::{Error, Result};
use super::parser::{parse, ParserOptions};
use super::resource::{is_metaparam, Param, ResourceId};
use super::scope::{ScopeId, ScopeKind};
use super::types::{Location, Value};
use crate::loader::{module_manifest_path, SourceFile, SourceLoader};
use crate::tripwire::watch::{SourceWatch, StaleFinding};
use indexmap::{IndexMap, IndexSet};
use parking_lot::{ReentrantMutex, RwLock};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the class holding every file's top-level code.
pub const MAIN_CLASS: &str = "main";

// ============================================================================
// Resource types
// ============================================================================

/// A class, define or node definition.
#[derive(Debug, Clone)]
pub struct ResourceType {
    pub kind: DefinitionKind,
    pub name: String,
    pub regex: Option<Regex>,
    pub parent: Option<String>,
    pub arguments: IndexMap<String, Option<Expr>>,
    pub code: Arc<Block>,
    /// Namespace for relative lookups from inside the body. A class's
    /// namespace is its own name; a define's is the enclosing namespace.
    pub namespace: String,
    pub loc: Location,
    pub doc: Option<String>,
}

impl ResourceType {
    pub fn from_definition(def: Definition) -> Result<Self> {
        let regex = match &def.regex {
            Some(source) => Some(Regex::new(&format!("(?i){}", source)).map_err(|e| {
                Error::parse(format!("invalid node regex /{}/: {}", source, e), def.loc.clone())
            })?),
            None => None,
        };
        let namespace = match def.kind {
            DefinitionKind::Class => def.name.clone(),
            _ => def
                .name
                .rsplit_once("::")
                .map(|(ns, _)| ns.to_string())
                .unwrap_or_default(),
        };
        Ok(Self {
            kind: def.kind,
            name: def.name,
            regex,
            parent: def.parent,
            arguments: def.arguments,
            code: def.body,
            namespace,
            loc: def.loc,
            doc: def.doc,
        })
    }

    fn main() -> Self {
        Self {
            kind: DefinitionKind::Class,
            name: MAIN_CLASS.to_string(),
            regex: None,
            parent: None,
            arguments: IndexMap::new(),
            code: Arc::new(Vec::new()),
            namespace: String::new(),
            loc: Location::default(),
            doc: None,
        }
    }

    /// Combine a reopened class with this one: bodies are concatenated and
    /// the parent must agree.
    pub fn merge(&self, other: &ResourceType) -> Result<ResourceType> {
        if let (Some(a), Some(b)) = (&self.parent, &other.parent) {
            if a != b {
                return Err(Error::parse(
                    format!(
                        "cannot merge classes with different parent classes ({} => {} vs. {} => {})",
                        self.name, a, other.name, b
                    ),
                    other.loc.clone(),
                ));
            }
        }
        let mut merged = self.clone();
        if merged.parent.is_none() {
            merged.parent = other.parent.clone();
        }
        if let Some(doc) = &other.doc {
            merged.doc = Some(format!("{}{}", merged.doc.unwrap_or_default(), doc));
        }
        for (arg, default) in &other.arguments {
            merged.arguments.entry(arg.clone()).or_insert_with(|| default.clone());
        }
        let mut code = (*self.code).clone();
        code.extend(other.code.iter().cloned());
        merged.code = Arc::new(code);
        Ok(merged)
    }

    /// Regex captures when this is a regex node matching `name`.
    pub fn match_node(&self, name: &str) -> Option<Vec<String>> {
        let captures = self.regex.as_ref()?.captures(name)?;
        Some(
            captures
                .iter()
                .map(|c| c.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect(),
        )
    }

    fn scope_kind(&self) -> ScopeKind {
        match self.kind {
            DefinitionKind::Class => ScopeKind::Class,
            DefinitionKind::Define => ScopeKind::Define,
            DefinitionKind::Node => ScopeKind::Node,
        }
    }

    /// Evaluate the body for `resource`: parent class first, then a new
    /// scope holding `$title`, `$name` and the arguments, then the code.
    pub fn evaluate_code(&self, cx: &mut Compiler, resource: ResourceId) -> Result<()> {
        let (declared_in, loc) = {
            let r = cx.resource(resource);
            (r.scope, r.loc.clone())
        };

        if self.kind == DefinitionKind::Class && self.name == MAIN_CLASS {
            let top = cx.scopes.top();
            cx.scopes.get_mut(top).resource = Some(resource);
            cx.scopes.set_class_scope(MAIN_CLASS, top, false)?;
            cx.record_class(MAIN_CLASS);
            return cx.evaluate_block(&self.code, top);
        }

        let base = match self.evaluate_parent(cx, declared_in, &loc)? {
            Some(scope) => scope,
            None if self.kind == DefinitionKind::Node => cx.scopes.top(),
            None => declared_in,
        };
        let scope = cx.scopes.new_child(base, self.scope_kind());
        {
            let s = cx.scopes.get_mut(scope);
            s.resource = Some(resource);
            s.namespace = self.namespace.clone();
            s.class_name = self.name.clone();
        }
        if self.kind != DefinitionKind::Define {
            cx.scopes
                .set_class_scope(&self.name, scope, self.kind == DefinitionKind::Node)
                .map_err(|e| e.with_location(&loc))?;
            cx.record_class(&self.name);
        }
        if self.kind == DefinitionKind::Node {
            if let Some(captures) = cx.node_captures(&self.name) {
                for (i, capture) in captures.into_iter().enumerate() {
                    cx.scopes.set(scope, &i.to_string(), Value::from(capture));
                }
            }
        }
        self.bind_parameters(cx, resource, scope)?;
        debug!(kind = self.kind.as_str(), name = %self.name, "evaluating body");
        cx.evaluate_block(&self.code, scope)
    }

    /// Make sure the parent class (or node) is evaluated and return its scope.
    fn evaluate_parent(
        &self,
        cx: &mut Compiler,
        declared_in: ScopeId,
        loc: &Location,
    ) -> Result<Option<ScopeId>> {
        let Some(parent) = &self.parent else {
            return Ok(None);
        };
        let parent_type = match self.kind {
            DefinitionKind::Node => cx.registry().find_node(parent),
            _ => cx.registry().find_hostclass(&self.namespace, parent)?,
        };
        let parent_type = parent_type.ok_or_else(|| {
            Error::parse(
                format!(
                    "could not find parent resource type '{}' of {} {}",
                    parent,
                    self.kind.as_str(),
                    self.name
                ),
                loc.clone(),
            )
        })?;
        if parent_type.name == self.name {
            return Err(Error::parse(
                format!("{} '{}' cannot inherit from itself", self.kind.as_str(), self.name),
                loc.clone(),
            ));
        }
        let id = cx.ensure_in_catalog(&parent_type, declared_in, loc)?;
        cx.evaluate_resource(id)?;
        cx.scopes
            .class_scope(&parent_type.name)
            .map(Some)
            .ok_or_else(|| {
                Error::internal(
                    "class",
                    format!("could not find scope for {}", parent_type.name),
                    loc.clone(),
                )
            })
    }

    fn bind_parameters(&self, cx: &mut Compiler, resource: ResourceId, scope: ScopeId) -> Result<()> {
        let (reference, params, loc) = {
            let r = cx.resource(resource);
            (r.reference.clone(), r.params.clone(), r.loc.clone())
        };
        let title = match self.kind {
            DefinitionKind::Define => reference.title.clone(),
            _ => reference.title.to_lowercase(),
        };
        let name = params
            .get("name")
            .map(|p| p.value.clone())
            .unwrap_or_else(|| Value::from(title.clone()));
        cx.scopes.set(scope, "title", Value::from(title));
        cx.scopes.set(scope, "name", name);

        for (pname, param) in &params {
            if pname == "name" || is_metaparam(pname) || self.arguments.contains_key(pname) {
                continue;
            }
            return Err(Error::parse(
                format!("invalid parameter '{}' on {}", pname, reference),
                param.loc.clone(),
            ));
        }

        for (arg, default) in &self.arguments {
            let value = match (params.get(arg), default) {
                (Some(p), _) if !p.value.is_undef() => p.value.clone(),
                (_, Some(expr)) => {
                    let value = expr.evaluate(cx, scope)?;
                    cx.resource_mut(resource)
                        .params
                        .insert(arg.clone(), Param::new(arg.clone(), value.clone(), self.name.clone(), expr.loc.clone()));
                    value
                }
                (Some(p), None) => p.value.clone(),
                (None, None) => {
                    return Err(Error::parse(format!("must pass {} to {}", arg, reference), loc));
                }
            };
            cx.scopes.define(scope, arg, value, loc.clone())?;
        }
        Ok(())
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug)]
struct Inner {
    classes: IndexMap<String, Arc<ResourceType>>,
    definitions: IndexMap<String, Arc<ResourceType>>,
    nodes: IndexMap<String, Arc<ResourceType>>,
    loaded: IndexSet<PathBuf>,
    autoload_attempts: IndexSet<PathBuf>,
    watch: SourceWatch,
}

#[derive(Debug)]
pub struct Registry {
    inner: RwLock<Inner>,
    /// Serializes loading so a file is parsed and registered exactly once.
    load_guard: ReentrantMutex<()>,
    loader: Option<Arc<dyn SourceLoader>>,
    options: ParserOptions,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(ParserOptions::default())
    }
}

impl Registry {
    pub fn new(options: ParserOptions) -> Self {
        let mut classes = IndexMap::new();
        classes.insert(MAIN_CLASS.to_string(), Arc::new(ResourceType::main()));
        Self {
            inner: RwLock::new(Inner {
                classes,
                definitions: IndexMap::new(),
                nodes: IndexMap::new(),
                loaded: IndexSet::new(),
                autoload_attempts: IndexSet::new(),
                watch: SourceWatch::default(),
            }),
            load_guard: ReentrantMutex::new(()),
            loader: None,
            options,
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn SourceLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn loader(&self) -> Option<&Arc<dyn SourceLoader>> {
        self.loader.as_ref()
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Load a manifest file and everything it imports.
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let loader = self.require_loader()?;
        let file = loader.read(path)?.ok_or_else(|| Error::Import {
            pattern: path.display().to_string(),
            loc: Location::default(),
        })?;
        let _guard = self.load_guard.lock();
        self.load_chain(file, &mut Vec::new())
    }

    /// Load manifest text under `name`. Imports resolve relative to `name`'s
    /// directory.
    pub fn load_source(&self, name: &str, source: &str) -> Result<()> {
        let _guard = self.load_guard.lock();
        let file = SourceFile {
            path: PathBuf::from(name),
            contents: source.to_string(),
        };
        self.load_chain(file, &mut Vec::new())
    }

    fn require_loader(&self) -> Result<&Arc<dyn SourceLoader>> {
        self.loader
            .as_ref()
            .ok_or_else(|| Error::Config("no source loader configured".to_string()))
    }

    fn load_chain(&self, file: SourceFile, chain: &mut Vec<PathBuf>) -> Result<()> {
        if self.inner.read().loaded.contains(&file.path) {
            return Ok(());
        }
        let name: Arc<str> = Arc::from(file.path.display().to_string());
        let manifest = parse(&file.contents, Some(name), self.options)?;
        {
            let mut inner = self.inner.write();
            inner.loaded.insert(file.path.clone());
            inner.watch.record(&file.path, &file.contents);
        }
        debug!(file = %file.path.display(), definitions = manifest.definitions.len(), "parsed manifest");

        chain.push(file.path.clone());
        let result = self.load_imports(&file.path, &manifest, chain);
        chain.pop();
        result?;
        self.register(manifest)
    }

    fn load_imports(&self, path: &Path, manifest: &Manifest, chain: &mut Vec<PathBuf>) -> Result<()> {
        if manifest.imports.is_empty() {
            return Ok(());
        }
        let loader = self.require_loader()?;
        let cwd = path.parent();
        for (pattern, loc) in &manifest.imports {
            let files = loader
                .resolve_manifest(pattern, cwd)
                .map_err(|e| e.with_location(loc))?;
            if files.is_empty() {
                return Err(Error::Import {
                    pattern: pattern.clone(),
                    loc: loc.clone(),
                });
            }
            for file in files {
                if chain.contains(&file.path) {
                    return Err(Error::ImportLoop {
                        file: file.path.display().to_string(),
                        loc: loc.clone(),
                    });
                }
                self.load_chain(file, chain)?;
            }
        }
        Ok(())
    }

    /// Register a parsed manifest's definitions and append its top-level
    /// code to `main`.
    pub fn register(&self, manifest: Manifest) -> Result<()> {
        for def in manifest.definitions {
            self.register_definition(def)?;
        }
        if !manifest.statements.is_empty() {
            let mut inner = self.inner.write();
            let main = inner
                .classes
                .get(MAIN_CLASS)
                .cloned()
                .unwrap_or_else(|| Arc::new(ResourceType::main()));
            let mut code = (*main.code).clone();
            code.extend(manifest.statements);
            let mut merged = (*main).clone();
            merged.code = Arc::new(code);
            inner.classes.insert(MAIN_CLASS.to_string(), Arc::new(merged));
        }
        Ok(())
    }

    fn register_definition(&self, def: Definition) -> Result<()> {
        let ty = ResourceType::from_definition(def)?;
        let mut inner = self.inner.write();
        let clash = |what: &str, existing: &ResourceType| {
            Error::parse(
                format!(
                    "{} '{}' is already defined at {}; cannot redefine as {}",
                    existing.kind.as_str(),
                    ty.name,
                    existing.loc,
                    what
                ),
                ty.loc.clone(),
            )
        };
        match ty.kind {
            DefinitionKind::Class => {
                if let Some(existing) = inner.definitions.get(&ty.name) {
                    return Err(clash("a class", existing));
                }
                let merged = match inner.classes.get(&ty.name) {
                    Some(existing) => existing.merge(&ty)?,
                    None => ty,
                };
                inner.classes.insert(merged.name.clone(), Arc::new(merged));
            }
            DefinitionKind::Define => {
                if let Some(existing) = inner.classes.get(&ty.name) {
                    return Err(clash("a define", existing));
                }
                if let Some(existing) = inner.definitions.get(&ty.name) {
                    return Err(clash("a define", existing));
                }
                inner.definitions.insert(ty.name.clone(), Arc::new(ty));
            }
            DefinitionKind::Node => {
                if let Some(existing) = inner.nodes.get(&ty.name) {
                    return Err(clash("a node", existing));
                }
                inner.nodes.insert(ty.name.clone(), Arc::new(ty));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Fully qualified names to try for `name` seen from `namespace`:
    /// innermost namespace outwards, then the bare name. A leading `::`
    /// anchors the name at top level.
    pub fn candidates(namespace: &str, name: &str) -> Vec<String> {
        let name = name.to_lowercase();
        if let Some(absolute) = name.strip_prefix("::") {
            return vec![absolute.to_string()];
        }
        let mut out = Vec::new();
        let mut ns = namespace.to_lowercase();
        while !ns.is_empty() {
            out.push(format!("{}::{}", ns, name));
            ns = ns.rsplit_once("::").map(|(head, _)| head.to_string()).unwrap_or_default();
        }
        out.push(name);
        out
    }

    pub fn find_hostclass(&self, namespace: &str, name: &str) -> Result<Option<Arc<ResourceType>>> {
        self.find(namespace, name, |inner| &inner.classes)
    }

    pub fn find_definition(&self, namespace: &str, name: &str) -> Result<Option<Arc<ResourceType>>> {
        self.find(namespace, name, |inner| &inner.definitions)
    }

    pub fn find_node(&self, name: &str) -> Option<Arc<ResourceType>> {
        self.inner.read().nodes.get(&name.to_lowercase()).cloned()
    }

    fn find(
        &self,
        namespace: &str,
        name: &str,
        table: impl Fn(&Inner) -> &IndexMap<String, Arc<ResourceType>>,
    ) -> Result<Option<Arc<ResourceType>>> {
        for fqname in Self::candidates(namespace, name) {
            if let Some(found) = table(&*self.inner.read()).get(&fqname) {
                return Ok(Some(Arc::clone(found)));
            }
            self.autoload(&fqname)?;
            if let Some(found) = table(&*self.inner.read()).get(&fqname) {
                return Ok(Some(Arc::clone(found)));
            }
        }
        Ok(None)
    }

    /// Try each manifest that could define `fqname`: `a::b::c` looks in
    /// module `a` for `b/c.pp`, then `b.pp`, then `init.pp`.
    fn autoload(&self, fqname: &str) -> Result<()> {
        let Some(loader) = &self.loader else {
            return Ok(());
        };
        let segments: Vec<&str> = fqname.split("::").collect();
        let Some(module_root) = segments.first().and_then(|m| loader.resolve_module(m)) else {
            return Ok(());
        };
        let _guard = self.load_guard.lock();
        for len in (1..=segments.len()).rev() {
            let path = module_manifest_path(&module_root, &segments[..len].join("::"));
            if !self.inner.write().autoload_attempts.insert(path.clone()) {
                continue;
            }
            if let Some(file) = loader.read(&path)? {
                debug!(name = fqname, file = %path.display(), "autoloading");
                self.load_chain(file, &mut Vec::new())?;
            }
        }
        Ok(())
    }

    /// Node definition for the first matching name: exact names first, then
    /// regex nodes, then `default`. Returns the regex captures, if any.
    pub fn node_for(&self, names: &[String]) -> Option<(Arc<ResourceType>, Vec<String>)> {
        let inner = self.inner.read();
        for name in names {
            if let Some(node) = inner.nodes.get(&name.to_lowercase()) {
                return Some((Arc::clone(node), Vec::new()));
            }
        }
        for name in names {
            for node in inner.nodes.values() {
                if let Some(captures) = node.match_node(name) {
                    return Some((Arc::clone(node), captures));
                }
            }
        }
        inner
            .nodes
            .get("default")
            .map(|node| (Arc::clone(node), Vec::new()))
    }

    pub fn has_nodes(&self) -> bool {
        !self.inner.read().nodes.is_empty()
    }

    pub fn main_class(&self) -> Arc<ResourceType> {
        self.inner
            .read()
            .classes
            .get(MAIN_CLASS)
            .cloned()
            .unwrap_or_else(|| Arc::new(ResourceType::main()))
    }

    /// True when `child` descends from `ancestor` through one or more
    /// `inherits` links. A class is not its own descendant.
    pub fn is_child_of(&self, child: &str, ancestor: &str) -> bool {
        let inner = self.inner.read();
        let lookup = |namespace: &str, name: &str| {
            Self::candidates(namespace, name)
                .into_iter()
                .find_map(|fq| inner.classes.get(&fq).or_else(|| inner.nodes.get(&fq)).cloned())
        };
        let mut current = lookup("", child);
        let mut steps = 0;
        while let Some(ty) = current {
            let Some(parent) = &ty.parent else {
                return false;
            };
            let parent_type = match ty.kind {
                DefinitionKind::Node => inner.nodes.get(parent).cloned(),
                _ => lookup(&ty.namespace, parent),
            };
            match parent_type {
                Some(p) if p.name == ancestor => return true,
                other => current = other,
            }
            steps += 1;
            if steps > inner.classes.len() + inner.nodes.len() {
                return false;
            }
        }
        false
    }

    // ------------------------------------------------------------------------
    // Introspection and change detection
    // ------------------------------------------------------------------------

    pub fn class_names(&self) -> Vec<String> {
        self.inner.read().classes.keys().cloned().collect()
    }

    pub fn definition_names(&self) -> Vec<String> {
        self.inner.read().definitions.keys().cloned().collect()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.inner.read().nodes.keys().cloned().collect()
    }

    pub fn loaded_files(&self) -> Vec<PathBuf> {
        self.inner.read().loaded.iter().cloned().collect()
    }

    pub fn watch(&self) -> SourceWatch {
        self.inner.read().watch.clone()
    }

    /// Digest of every loaded source, used as the catalog version.
    pub fn version(&self) -> String {
        self.inner.read().watch.version()
    }

    /// Loaded files whose contents changed since they were parsed.
    pub fn stale_files(&self) -> Result<Vec<StaleFinding>> {
        let Some(loader) = &self.loader else {
            return Ok(Vec::new());
        };
        let watch = self.watch();
        let findings = watch.check(|path| Ok(loader.read(path)?.map(|f| f.contents)))?;
        if !findings.is_empty() {
            info!(stale = findings.len(), "manifests changed since load");
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryLoader;

    fn registry(src: &str) -> Registry {
        let r = Registry::default();
        r.load_source("site.pp", src).unwrap();
        r
    }

    #[test]
    fn test_registry_candidates() {
        assert_eq!(
            Registry::candidates("apache::mod", "ssl"),
            vec!["apache::mod::ssl", "apache::ssl", "ssl"]
        );
        assert_eq!(Registry::candidates("apache", "::ssl"), vec!["ssl"]);
        assert_eq!(Registry::candidates("", "Foo"), vec!["foo"]);
    }

    #[test]
    fn test_registry_relative_lookup() {
        let r = registry("class apache { class ssl {} } define apache::vhost {} class ssl {}");
        let found = r.find_hostclass("apache", "ssl").unwrap().unwrap();
        assert_eq!(found.name, "apache::ssl");
        let found = r.find_hostclass("apache", "::ssl").unwrap().unwrap();
        assert_eq!(found.name, "ssl");
        let def = r.find_definition("apache", "vhost").unwrap().unwrap();
        assert_eq!(def.name, "apache::vhost");
        assert_eq!(def.namespace, "apache");
        assert!(r.find_hostclass("", "missing").unwrap().is_none());
    }

    #[test]
    fn test_registry_class_reopen_merges() {
        let r = registry("class a { notice('one') } class a { notice('two') }");
        let a = r.find_hostclass("", "a").unwrap().unwrap();
        assert_eq!(a.code.len(), 2);
    }

    #[test]
    fn test_registry_merge_parent_conflict() {
        let r = Registry::default();
        let err = r
            .load_source("site.pp", "class b {} class c {} class a inherits b {} class a inherits c {}")
            .unwrap_err();
        assert!(err.to_string().contains("different parent classes"));
    }

    #[test]
    fn test_registry_redefinitions_rejected() {
        let r = Registry::default();
        assert!(r.load_source("a.pp", "define d {} define d {}").is_err());
        let r = Registry::default();
        assert!(r.load_source("a.pp", "class x {} define x {}").is_err());
        let r = Registry::default();
        assert!(r.load_source("a.pp", "node web {} node web {}").is_err());
    }

    #[test]
    fn test_registry_main_accumulates_top_level_code() {
        let r = Registry::default();
        r.load_source("a.pp", "notice('a')").unwrap();
        r.load_source("b.pp", "notice('b') class x {}").unwrap();
        assert_eq!(r.main_class().code.len(), 2);
    }

    #[test]
    fn test_registry_node_lookup_order() {
        let r = registry(
            "node default {} node /^web\\d+/ {} node 'web01.example.com' {} node web02 {}",
        );
        let names = |n: &str| crate::core::types::NodeInfo::new(n).names();
        let (node, _) = r.node_for(&names("web01.example.com")).unwrap();
        assert_eq!(node.name, "web01.example.com");
        let (node, _) = r.node_for(&names("web02.example.com")).unwrap();
        assert_eq!(node.name, "web02");
        let (node, captures) = r.node_for(&names("web07.example.com")).unwrap();
        assert!(node.regex.is_some());
        assert_eq!(captures[0], "web07");
        let (node, _) = r.node_for(&names("db01")).unwrap();
        assert_eq!(node.name, "default");
    }

    #[test]
    fn test_registry_is_child_of_strict() {
        let r = registry("class base {} class mid inherits base {} class leaf inherits mid {} class other {}");
        assert!(r.is_child_of("mid", "base"));
        assert!(r.is_child_of("leaf", "base"));
        assert!(!r.is_child_of("base", "base"));
        assert!(!r.is_child_of("other", "base"));
        assert!(!r.is_child_of("base", "leaf"));
    }

    #[test]
    fn test_registry_imports_and_loops() {
        let loader = MemoryLoader::new()
            .with_file("/site/site.pp", "import 'nodes/*.pp'\nimport 'classes'")
            .with_file("/site/nodes/web.pp", "node web {}")
            .with_file("/site/classes.pp", "class base {}");
        let r = Registry::default().with_loader(Arc::new(loader));
        r.load_file(Path::new("/site/site.pp")).unwrap();
        assert_eq!(r.node_names(), vec!["web"]);
        assert_eq!(r.loaded_files().len(), 3);

        let looped = MemoryLoader::new()
            .with_file("/l/a.pp", "import 'b'")
            .with_file("/l/b.pp", "import 'a'");
        let r = Registry::default().with_loader(Arc::new(looped));
        let err = r.load_file(Path::new("/l/a.pp")).unwrap_err();
        assert!(matches!(err, Error::ImportLoop { .. }), "{}", err);
    }

    #[test]
    fn test_registry_import_already_loaded_is_skipped() {
        let loader = MemoryLoader::new()
            .with_file("/s/a.pp", "import 'common'\nimport 'b'")
            .with_file("/s/b.pp", "import 'common'")
            .with_file("/s/common.pp", "class common {}");
        let r = Registry::default().with_loader(Arc::new(loader));
        r.load_file(Path::new("/s/a.pp")).unwrap();
        assert_eq!(r.class_names(), vec!["main", "common"]);
    }

    #[test]
    fn test_registry_import_not_found() {
        let loader = MemoryLoader::new().with_file("/s/a.pp", "import 'missing'");
        let r = Registry::default().with_loader(Arc::new(loader));
        let err = r.load_file(Path::new("/s/a.pp")).unwrap_err();
        assert!(matches!(err, Error::Import { ref pattern, .. } if pattern == "missing"));
        assert_eq!(err.location().unwrap().line, 1);
    }

    #[test]
    fn test_registry_autoload_from_module() {
        let loader = MemoryLoader::new()
            .with_file("/m/apache/manifests/init.pp", "class apache {}")
            .with_file("/m/apache/manifests/mod/ssl.pp", "class apache::mod::ssl {}")
            .with_file("/m/apache/manifests/vhost.pp", "define apache::vhost {}")
            .with_module_root("apache", "/m/apache");
        let r = Registry::default().with_loader(Arc::new(loader));
        assert!(r.find_hostclass("", "apache::mod::ssl").unwrap().is_some());
        assert!(r.find_definition("apache", "vhost").unwrap().is_some());
        assert!(r.find_hostclass("", "apache").unwrap().is_some());
        assert!(r.find_hostclass("", "apache::missing").unwrap().is_none());
        assert_eq!(r.loaded_files().len(), 3);
    }

    #[test]
    fn test_registry_version_and_stale_files() {
        let loader = Arc::new(MemoryLoader::new().with_file("/s/site.pp", "class a {}"));
        let r = Registry::default().with_loader(loader.clone());
        r.load_file(Path::new("/s/site.pp")).unwrap();
        let v1 = r.version();
        assert!(r.stale_files().unwrap().is_empty());

        let mut edited = (*loader).clone();
        edited.set_file("/s/site.pp", "class b {}");
        let r2 = Registry::default().with_loader(Arc::new(edited.clone()));
        r2.load_file(Path::new("/s/site.pp")).unwrap();
        assert_ne!(v1, r2.version());

        let r3 = Registry::default().with_loader(Arc::new(edited));
        r3.load_source("/s/site.pp", "class a {}").unwrap();
        let stale = r3.stale_files().unwrap();
        assert_eq!(stale.len(), 1);
    }
}
