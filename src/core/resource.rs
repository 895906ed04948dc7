//! Resources in the in-progress catalog.

use super::error::{Error, Result};
use super::scope::ScopeId;
use super::types::{Location, ResourceRef, Value};
use indexmap::{IndexMap, IndexSet};

/// Handle into the compiler's resource arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) usize);

impl ResourceId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Builtin,
    Class,
    Define,
    Node,
    Stage,
}

/// Parameters every resource accepts regardless of type.
pub const METAPARAMS: &[&str] = &[
    "alias", "audit", "before", "loglevel", "noop", "notify", "require", "schedule", "stage",
    "subscribe", "tag",
];

/// Metaparameters copied from a container to its contents.
pub const INHERITABLE_METAPARAMS: &[&str] = &["noop", "schedule", "loglevel", "audit"];

pub fn is_metaparam(name: &str) -> bool {
    METAPARAMS.contains(&name)
}

/// Tags are lowercase words that may contain `::`, `.` and `-`.
pub fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

/// One parameter value together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub value: Value,
    /// Name of the class or define whose code set the value.
    pub source: String,
    pub loc: Location,
    /// Set with `+>`: extend the existing value instead of replacing it.
    pub append: bool,
    /// Filled in from a resource default rather than written on the resource.
    pub defaulted: bool,
}

impl Param {
    pub fn new(name: impl Into<String>, value: Value, source: impl Into<String>, loc: Location) -> Self {
        Self {
            name: name.into(),
            value,
            source: source.into(),
            loc,
            append: false,
            defaulted: false,
        }
    }
}

/// Parameter changes to apply to an existing resource.
#[derive(Debug, Clone)]
pub struct Override {
    pub target: ResourceRef,
    pub params: Vec<Param>,
    pub source: String,
    pub loc: Location,
    /// Collection overrides skip the provenance check.
    pub from_collection: bool,
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub reference: ResourceRef,
    pub kind: ResourceKind,
    pub params: IndexMap<String, Param>,
    pub is_virtual: bool,
    pub exported: bool,
    pub evaluated: bool,
    /// Scope the resource was declared in.
    pub scope: ScopeId,
    /// Class or define name that declared the resource.
    pub source: String,
    pub loc: Location,
    pub tags: IndexSet<String>,
    pub container: Option<ResourceId>,
    /// Node that exported the resource, for resources collected from the store.
    pub provenance: Option<String>,
}

impl Resource {
    pub fn new(
        reference: ResourceRef,
        kind: ResourceKind,
        scope: ScopeId,
        source: impl Into<String>,
        loc: Location,
    ) -> Self {
        let mut tags = IndexSet::new();
        let type_tag = reference.type_name.to_lowercase();
        for segment in type_tag.split("::") {
            tags.insert(segment.to_string());
        }
        tags.insert(type_tag);
        let title = reference.title.to_lowercase();
        if valid_tag(&title) {
            if kind == ResourceKind::Class {
                for segment in title.split("::") {
                    tags.insert(segment.to_string());
                }
            }
            tags.insert(title);
        }
        if kind == ResourceKind::Class {
            tags.shift_remove("class");
        }
        Self {
            reference,
            kind,
            params: IndexMap::new(),
            is_virtual: false,
            exported: false,
            evaluated: matches!(kind, ResourceKind::Builtin | ResourceKind::Stage),
            scope,
            source: source.into(),
            loc,
            tags,
            container: None,
            provenance: None,
        }
    }

    pub fn title(&self) -> &str {
        &self.reference.title
    }

    pub fn is_builtin(&self) -> bool {
        self.kind == ResourceKind::Builtin
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.params.get(name).map(|p| &p.value)
    }

    /// Set a parameter at declaration time. Each name may appear once.
    pub fn set(&mut self, param: Param) -> Result<()> {
        if self.params.contains_key(&param.name) {
            return Err(Error::parse(
                format!("duplicate parameter '{}' on {}", param.name, self.reference),
                param.loc,
            ));
        }
        if param.name == "tag" {
            self.tag_value(&param.value, &param.loc)?;
        }
        self.params.insert(param.name.clone(), param);
        Ok(())
    }

    /// Set a parameter only if it is not already present.
    pub fn set_default(&mut self, param: &Param) -> bool {
        if self.params.contains_key(&param.name) {
            return false;
        }
        if param.name == "tag" && self.tag_value(&param.value, &param.loc).is_err() {
            return false;
        }
        let param = Param {
            defaulted: true,
            ..param.clone()
        };
        self.params.insert(param.name.clone(), param);
        true
    }

    pub fn add_tag(&mut self, tag: &str, loc: &Location) -> Result<()> {
        let tag = tag.to_lowercase();
        if !valid_tag(&tag) {
            return Err(Error::parse(format!("invalid tag '{}'", tag), loc.clone()));
        }
        self.tags.insert(tag);
        Ok(())
    }

    fn tag_value(&mut self, value: &Value, loc: &Location) -> Result<()> {
        for item in value.clone().flatten() {
            self.add_tag(&item.to_string(), loc)?;
        }
        Ok(())
    }

    /// Apply an override. A parameter that is already set may only be changed
    /// by the class that set it or declared the resource, or by one descending
    /// from the class that set it. Defaulted parameters and collection
    /// overrides are exempt.
    pub fn merge(&mut self, ov: &Override, is_child_of: impl Fn(&str, &str) -> bool) -> Result<()> {
        for param in &ov.params {
            let merged = match self.params.get(&param.name) {
                Some(existing) => {
                    let allowed = ov.from_collection
                        || existing.defaulted
                        || ov.source == existing.source
                        || ov.source == self.source
                        || is_child_of(&ov.source, &existing.source);
                    if !allowed {
                        return Err(Error::OverrideAuthorization {
                            param: param.name.clone(),
                            resource: self.reference.to_string(),
                            set_by: existing.source.clone(),
                            attempted_by: ov.source.clone(),
                            loc: param.loc.clone(),
                        });
                    }
                    if param.append {
                        let mut items = existing.value.clone().flatten();
                        items.extend(param.value.clone().flatten());
                        Param {
                            value: Value::Array(items),
                            append: false,
                            defaulted: false,
                            ..param.clone()
                        }
                    } else {
                        param.clone()
                    }
                }
                None => Param {
                    append: false,
                    defaulted: false,
                    ..param.clone()
                },
            };
            if merged.name == "tag" {
                self.tag_value(&merged.value, &merged.loc)?;
            }
            self.params.insert(merged.name.clone(), merged);
        }
        Ok(())
    }

    pub fn tag_list(&self) -> Vec<String> {
        self.tags.iter().cloned().collect()
    }

    /// Parameter values without provenance, in declaration order.
    pub fn param_values(&self) -> IndexMap<String, Value> {
        self.params
            .iter()
            .map(|(k, p)| (k.clone(), p.value.clone()))
            .collect()
    }
}
