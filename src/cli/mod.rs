//! CLI subcommands: init, parse, compile, graph, stale.

use crate::core::catalog::Catalog;
use crate::core::collector::Query;
use crate::core::compiler::Compiler;
use crate::core::registry::{Registry, MAIN_CLASS};
use crate::core::settings::{self, Settings, SETTINGS_FILE};
use crate::core::types::{NodeInfo, Value};
use crate::loader::FsLoader;
use crate::store::{
    CatalogSink, ExportStore, FileCatalogSink, FileExportStore, NodeClassifier, ResourceDescriptor,
    YamlClassifier,
};
use crate::tripwire::eventlog::{self, CompileEvent};
use crate::tripwire::watch;
use clap::{Args, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new mantle project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Check a manifest tree and list its classes, defines and nodes
    Parse {
        /// Path to mantle.yaml
        #[arg(short, long, default_value = SETTINGS_FILE)]
        file: PathBuf,

        /// Parse this manifest instead of the configured one
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },

    /// Compile a node's catalog
    Compile {
        #[command(flatten)]
        target: Target,

        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Json)]
        format: Format,

        /// Persist the catalog and publish exported resources
        #[arg(long)]
        persist: bool,
    },

    /// Show resource ordering from a node's catalog
    Graph {
        #[command(flatten)]
        target: Target,

        /// Only list resources that must follow this one (e.g. 'File[/etc/motd]')
        #[arg(long)]
        from: Option<String>,
    },

    /// Report manifests changed since the last recorded run
    Stale {
        /// Path to mantle.yaml
        #[arg(short, long, default_value = SETTINGS_FILE)]
        file: PathBuf,

        /// Recorded source hashes
        #[arg(long, default_value = "state/sources.yaml")]
        record_file: PathBuf,

        /// Record the current hashes instead of comparing
        #[arg(long)]
        record: bool,

        /// Exit non-zero when anything changed (for CI/cron)
        #[arg(long)]
        tripwire: bool,
    },
}

/// Node selection and settings overrides shared by `compile` and `graph`.
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Node name (certname)
    pub node: String,

    /// Path to mantle.yaml
    #[arg(short, long, default_value = SETTINGS_FILE)]
    pub file: PathBuf,

    /// Fact for the node, as name=value (repeatable)
    #[arg(long = "fact", value_name = "NAME=VALUE")]
    pub facts: Vec<String>,

    /// Extra class for the node (repeatable)
    #[arg(long = "class", value_name = "CLASS")]
    pub classes: Vec<String>,

    /// Treat undefined variables as errors
    #[arg(long)]
    pub strict_variables: bool,

    /// Allow variable reassignment within a scope
    #[arg(long)]
    pub imperative: bool,

    /// Override the generation pass bound
    #[arg(long)]
    pub max_generation_passes: Option<usize>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Parse { file, manifest } => cmd_parse(&file, manifest.as_deref()),
        Commands::Compile {
            target,
            format,
            persist,
        } => cmd_compile(&target, format, persist),
        Commands::Graph { target, from } => cmd_graph(&target, from.as_deref()),
        Commands::Stale {
            file,
            record_file,
            record,
            tripwire,
        } => cmd_stale(&file, &record_file, record, tripwire),
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let settings_path = path.join(SETTINGS_FILE);
    if settings_path.exists() {
        return Err(format!("{} already exists", settings_path.display()));
    }

    let manifests = path.join("manifests");
    let modules = path.join("modules");
    for dir in [&manifests, &modules] {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;
    }

    let template = r#"manifest: manifests/site.pp
modulepath:
  - modules
strict_variables: false
declarative: true
max_generation_passes: 1000
catalog_dir: catalogs
facts: {}
"#;
    std::fs::write(&settings_path, template)
        .map_err(|e| format!("cannot write {}: {}", settings_path.display(), e))?;

    let site = manifests.join("site.pp");
    if !site.exists() {
        let manifest = "node default {\n  notify { 'hello': message => \"compiled for ${clientcert}\" }\n}\n";
        std::fs::write(&site, manifest)
            .map_err(|e| format!("cannot write {}: {}", site.display(), e))?;
    }

    println!("Initialized mantle project at {}", path.display());
    println!("  Created: {}", settings_path.display());
    println!("  Created: {}", site.display());
    println!("  Created: {}/", modules.display());
    Ok(())
}

fn cmd_parse(file: &Path, manifest: Option<&Path>) -> Result<(), String> {
    let mut settings = load_settings(file)?;
    if let Some(path) = manifest {
        settings.manifest = path.to_path_buf();
    }
    let registry = load_registry(&settings)?;

    let classes: Vec<String> = registry
        .class_names()
        .into_iter()
        .filter(|c| c != MAIN_CLASS)
        .collect();
    let definitions = registry.definition_names();
    let nodes = registry.node_names();
    println!(
        "OK: {} ({} files, {} classes, {} defines, {} nodes)",
        settings.manifest.display(),
        registry.loaded_files().len(),
        classes.len(),
        definitions.len(),
        nodes.len()
    );
    for (label, names) in [("class", &classes), ("define", &definitions), ("node", &nodes)] {
        for name in names.iter() {
            println!("  {} {}", label, name);
        }
    }
    Ok(())
}

fn cmd_compile(target: &Target, format: Format, persist: bool) -> Result<(), String> {
    let settings = target_settings(target)?;
    let registry = load_registry(&settings)?;
    let catalog = if persist {
        compile_and_persist(&settings, registry, target)?
    } else {
        compile_node(&settings, registry, target, false)?
    };

    let text = match format {
        Format::Json => catalog.to_json(),
        Format::Yaml => catalog.to_yaml(),
    }
    .map_err(|e| e.to_string())?;
    println!("{}", text);
    Ok(())
}

fn cmd_graph(target: &Target, from: Option<&str>) -> Result<(), String> {
    let settings = target_settings(target)?;
    let registry = load_registry(&settings)?;
    let catalog = compile_node(&settings, registry, target, false)?;

    match from {
        Some(reference) => {
            if catalog.resource(reference).is_none() {
                return Err(format!("{} is not in the catalog for {}", reference, catalog.name));
            }
            let downstream = catalog.downstream(reference);
            println!("{} ({} downstream)", reference, downstream.len());
            for r in downstream {
                println!("  -> {}", r);
            }
        }
        None => {
            let order = catalog.execution_order().map_err(|e| e.to_string())?;
            println!("Order: {} ({} resources)", catalog.name, order.len());
            for (i, r) in order.iter().enumerate() {
                println!("  {:>4}. {}", i + 1, r);
            }
        }
    }
    Ok(())
}

fn cmd_stale(file: &Path, record_file: &Path, record: bool, tripwire: bool) -> Result<(), String> {
    let settings = load_settings(file)?;
    let registry = load_registry(&settings)?;
    let current = registry.watch();

    if record {
        watch::save_watch(record_file, &current).map_err(|e| e.to_string())?;
        println!(
            "Recorded {} manifest(s) at {} ({})",
            current.len(),
            record_file.display(),
            current.version()
        );
        return Ok(());
    }

    let Some(recorded) = watch::load_watch(record_file).map_err(|e| e.to_string())? else {
        return Err(format!(
            "no recorded hashes at {} (run with --record first)",
            record_file.display()
        ));
    };

    let findings = recorded.diff(&current);
    if findings.is_empty() {
        println!("No changes since {}.", recorded.version());
        return Ok(());
    }
    for f in &findings {
        println!("  CHANGED: {}", f.detail);
        println!("    Expected: {}", f.expected_hash);
        println!("    Actual:   {}", f.actual_hash);
    }
    println!();
    println!("Changed: {} manifest(s)", findings.len());
    if tripwire {
        return Err(format!("{} changed manifest(s)", findings.len()));
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Load and validate settings. A missing file yields the defaults relative
/// to the current directory.
fn load_settings(file: &Path) -> Result<Settings, String> {
    let settings = if file.exists() {
        settings::parse_settings_file(file).map_err(|e| e.to_string())?
    } else {
        Settings::default()
    };
    let errors = settings::validate_settings(&settings);
    if errors.is_empty() {
        return Ok(settings);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err(format!("{} validation error(s)", errors.len()))
}

/// Settings with the target's command-line overrides applied.
fn target_settings(target: &Target) -> Result<Settings, String> {
    let mut settings = load_settings(&target.file)?;
    if target.strict_variables {
        settings.strict_variables = true;
    }
    if target.imperative {
        settings.declarative = false;
    }
    if let Some(passes) = target.max_generation_passes {
        if passes == 0 {
            return Err("--max-generation-passes must be at least 1".to_string());
        }
        settings.max_generation_passes = passes;
    }
    Ok(settings)
}

fn load_registry(settings: &Settings) -> Result<Arc<Registry>, String> {
    let loader = FsLoader::new(settings.modulepath.clone());
    let registry = Registry::new(settings.parser_options()).with_loader(Arc::new(loader));
    registry
        .load_file(&settings.manifest)
        .map_err(|e| e.to_string())?;
    Ok(Arc::new(registry))
}

/// Parse a `name=value` fact. Values are read as YAML scalars so numbers and
/// booleans keep their type.
fn parse_fact(text: &str) -> Result<(String, Value), String> {
    let (name, raw) = text
        .split_once('=')
        .ok_or_else(|| format!("invalid fact '{}': expected NAME=VALUE", text))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("invalid fact '{}': empty name", text));
    }
    let value = match serde_yaml_ng::from_str::<serde_yaml_ng::Value>(raw) {
        Ok(yaml) if !yaml.is_mapping() && !yaml.is_sequence() => Value::from_yaml(&yaml),
        _ => Value::from(raw),
    };
    Ok((name.to_string(), value))
}

fn node_info(settings: &Settings, target: &Target) -> Result<NodeInfo, String> {
    let mut node = NodeInfo::new(target.node.clone());
    node.facts.extend(settings.facts.clone());
    for text in &target.facts {
        let (name, value) = parse_fact(text)?;
        node.facts.insert(name, value);
    }
    node.classes.extend(target.classes.iter().cloned());
    Ok(node)
}

fn compile_node(
    settings: &Settings,
    registry: Arc<Registry>,
    target: &Target,
    publish: bool,
) -> Result<Catalog, String> {
    let node = node_info(settings, target)?;
    let mut compiler = Compiler::new(registry, node, settings.compile_options());
    if let Some(dir) = &settings.classifier_dir {
        let classifier: Arc<dyn NodeClassifier> = Arc::new(YamlClassifier::new(dir));
        compiler = compiler.with_classifier(classifier);
    }
    if publish {
        if let Some(dir) = &settings.export_dir {
            let store: Arc<dyn ExportStore> = Arc::new(FileExportStore::new(dir));
            compiler = compiler.with_export_store(store);
        }
    } else if let Some(dir) = settings.export_dir.as_ref().filter(|d| d.exists()) {
        compiler = compiler.with_export_store(Arc::new(ReadOnlyExports(FileExportStore::new(dir))));
    }
    compiler.compile().map_err(|e| e.to_string())
}

/// Compile, persist the catalog and record the run in the node's event log.
fn compile_and_persist(
    settings: &Settings,
    registry: Arc<Registry>,
    target: &Target,
) -> Result<Catalog, String> {
    let Some(dir) = &settings.catalog_dir else {
        return Err("--persist needs catalog_dir in settings".to_string());
    };
    let node = &target.node;
    let compile_id = eventlog::generate_compile_id();
    let log = |event: CompileEvent| {
        eventlog::append_event(dir, node, event).map_err(|e| e.to_string())
    };

    log(CompileEvent::CompileStarted {
        node: node.clone(),
        compile_id: compile_id.clone(),
        mantle_version: env!("CARGO_PKG_VERSION").to_string(),
    })?;
    let start = Instant::now();
    let catalog = match compile_node(settings, registry, target, true) {
        Ok(catalog) => catalog,
        Err(e) => {
            log(CompileEvent::CompileFailed {
                node: node.clone(),
                compile_id,
                error: e.clone(),
            })?;
            return Err(e);
        }
    };
    log(CompileEvent::CompileFinished {
        node: node.clone(),
        compile_id,
        catalog_version: catalog.version.clone(),
        resources: catalog.len(),
        edges: catalog.edges.len(),
        total_seconds: start.elapsed().as_secs_f64(),
    })?;

    FileCatalogSink::new(dir)
        .persist(&catalog)
        .map_err(|e| e.to_string())?;
    if settings.export_dir.is_some() {
        log(CompileEvent::ExportsPublished {
            node: node.clone(),
            resources: catalog.exported_resources().count(),
        })?;
    }
    Ok(catalog)
}

/// Collects from a file export store without publishing; a compile that is
/// not persisted leaves the store untouched.
#[derive(Debug)]
struct ReadOnlyExports(FileExportStore);

impl ExportStore for ReadOnlyExports {
    fn search(
        &self,
        type_name: &str,
        query: Option<&Query>,
        requesting_node: &str,
    ) -> crate::core::error::Result<Vec<ResourceDescriptor>> {
        self.0.search(type_name, query, requesting_node)
    }

    fn publish(
        &self,
        _node: &str,
        _resources: Vec<ResourceDescriptor>,
    ) -> crate::core::error::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(site: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        std::fs::write(dir.path().join("manifests/site.pp"), site).unwrap();
        dir
    }

    fn target(dir: &Path, node: &str) -> Target {
        Target {
            node: node.to_string(),
            file: dir.join(SETTINGS_FILE),
            facts: Vec::new(),
            classes: Vec::new(),
            strict_variables: false,
            imperative: false,
            max_generation_passes: None,
        }
    }

    #[test]
    fn test_cli_init() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("site");
        std::fs::create_dir_all(&sub).unwrap();
        cmd_init(&sub).unwrap();
        assert!(sub.join(SETTINGS_FILE).is_file());
        assert!(sub.join("manifests/site.pp").is_file());
        assert!(sub.join("modules").is_dir());
        let settings = load_settings(&sub.join(SETTINGS_FILE)).unwrap();
        assert_eq!(settings.manifest, sub.join("manifests/site.pp"));
    }

    #[test]
    fn test_cli_init_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "exists").unwrap();
        assert!(cmd_init(dir.path()).is_err());
    }

    #[test]
    fn test_cli_init_template_compiles() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        let t = target(dir.path(), "web01");
        let settings = target_settings(&t).unwrap();
        let catalog = compile_node(&settings, load_registry(&settings).unwrap(), &t, false).unwrap();
        let notify = catalog.resource("Notify[hello]").unwrap();
        assert_eq!(notify.parameters["message"], Value::from("compiled for web01"));
    }

    #[test]
    fn test_cli_parse() {
        let dir = project("class base {} define app::site() {} node 'web01' {}");
        cmd_parse(&dir.path().join(SETTINGS_FILE), None).unwrap();
    }

    #[test]
    fn test_cli_parse_syntax_error() {
        let dir = project("class base {");
        let err = cmd_parse(&dir.path().join(SETTINGS_FILE), None).unwrap_err();
        assert!(err.contains("site.pp"), "{}", err);
    }

    #[test]
    fn test_cli_invalid_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "max_generation_passes: 0\n").unwrap();
        let err = load_settings(&path).unwrap_err();
        assert!(err.contains("1 validation error"));
    }

    #[test]
    fn test_cli_parse_fact() {
        assert_eq!(parse_fact("cores=8").unwrap(), ("cores".into(), Value::Integer(8)));
        assert_eq!(parse_fact("virtual=true").unwrap().1, Value::Bool(true));
        assert_eq!(parse_fact("os=Debian").unwrap().1, Value::from("Debian"));
        assert_eq!(parse_fact("path=a=b").unwrap().1, Value::from("a=b"));
        assert!(parse_fact("noequals").is_err());
        assert!(parse_fact("=x").is_err());
    }

    #[test]
    fn test_cli_target_overrides() {
        let dir = project("");
        let mut t = target(dir.path(), "web01");
        t.strict_variables = true;
        t.imperative = true;
        t.max_generation_passes = Some(7);
        let settings = target_settings(&t).unwrap();
        assert!(settings.strict_variables);
        assert!(!settings.declarative);
        assert_eq!(settings.max_generation_passes, 7);
        t.max_generation_passes = Some(0);
        assert!(target_settings(&t).is_err());
    }

    #[test]
    fn test_cli_compile_with_facts_and_classes() {
        let dir = project(
            r#"
class role::web { notify { "role": message => "$os" } }
"#,
        );
        let mut t = target(dir.path(), "web01");
        t.facts.push("os=debian".into());
        t.classes.push("role::web".into());
        let settings = target_settings(&t).unwrap();
        let catalog = compile_node(&settings, load_registry(&settings).unwrap(), &t, false).unwrap();
        assert_eq!(
            catalog.resource("Notify[role]").unwrap().parameters["message"],
            Value::from("debian")
        );
        assert!(catalog.classes.iter().any(|c| c == "role::web"));
    }

    #[test]
    fn test_cli_compile_persist() {
        let dir = project("node default { @@sshkey { $clientcert: key => 'abc' } }");
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            "catalog_dir: catalogs\nexport_dir: exports\n",
        )
        .unwrap();
        let t = target(dir.path(), "web01");
        let settings = target_settings(&t).unwrap();
        let catalog =
            compile_and_persist(&settings, load_registry(&settings).unwrap(), &t).unwrap();
        assert!(catalog.resource("Sshkey[web01]").unwrap().exported);

        let catalogs = dir.path().join("catalogs");
        let stored = FileCatalogSink::new(&catalogs).load("web01").unwrap().unwrap();
        assert_eq!(stored, catalog);
        assert!(dir.path().join("exports/web01/exports.yaml").is_file());

        let events: Vec<CompileEvent> = eventlog::read_events(&catalogs, "web01")
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], CompileEvent::CompileStarted { .. }));
        assert!(matches!(events[1], CompileEvent::CompileFinished { resources: 4, .. }));
        assert!(matches!(events[2], CompileEvent::CatalogPersisted { .. }));
        assert!(matches!(events[3], CompileEvent::ExportsPublished { resources: 1, .. }));
    }

    #[test]
    fn test_cli_compile_failure_logged() {
        let dir = project("fail('broken')");
        std::fs::write(dir.path().join(SETTINGS_FILE), "catalog_dir: catalogs\n").unwrap();
        let t = target(dir.path(), "web01");
        let settings = target_settings(&t).unwrap();
        let err = compile_and_persist(&settings, load_registry(&settings).unwrap(), &t).unwrap_err();
        assert!(err.contains("broken"));
        let events = eventlog::read_events(&dir.path().join("catalogs"), "web01").unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1].event, CompileEvent::CompileFailed { .. }));
    }

    #[test]
    fn test_cli_persist_needs_catalog_dir() {
        let dir = project("");
        std::fs::write(dir.path().join(SETTINGS_FILE), "{}\n").unwrap();
        let t = target(dir.path(), "web01");
        let settings = target_settings(&t).unwrap();
        assert!(compile_and_persist(&settings, load_registry(&settings).unwrap(), &t).is_err());
    }

    #[test]
    fn test_cli_graph() {
        let dir = project(
            "package { 'nginx': } -> file { '/etc/nginx.conf': } ~> service { 'nginx': }",
        );
        let t = target(dir.path(), "web01");
        cmd_graph(&t, None).unwrap();
        cmd_graph(&t, Some("Package[nginx]")).unwrap();
        assert!(cmd_graph(&t, Some("Package[missing]")).is_err());
    }

    #[test]
    fn test_cli_stale() {
        let dir = project("class base {}");
        let settings_file = dir.path().join(SETTINGS_FILE);
        let record_file = dir.path().join("state/sources.yaml");
        assert!(cmd_stale(&settings_file, &record_file, false, false).is_err());

        cmd_stale(&settings_file, &record_file, true, false).unwrap();
        cmd_stale(&settings_file, &record_file, false, true).unwrap();

        std::fs::write(dir.path().join("manifests/site.pp"), "class base { }").unwrap();
        cmd_stale(&settings_file, &record_file, false, false).unwrap();
        let err = cmd_stale(&settings_file, &record_file, false, true).unwrap_err();
        assert!(err.contains("1 changed"));
    }
}
