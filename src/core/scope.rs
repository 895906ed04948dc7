//! Variable scopes.
//!
//! Scopes live in an arena owned by the compiler and point at their single
//! parent by [`ScopeId`]. Lookup walks from a scope towards the root; nothing
//! a child defines is visible to its parent. Each evaluated class or node
//! registers its scope as a singleton so `$class::var` can find it later.

use super::error::{Error, Result};
use super::resource::{Param, ResourceId};
use super::types::{canonical_type, Location, Value};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use tracing::warn;

/// Handle into a [`ScopeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

impl ScopeId {
    /// The root scope of every arena.
    pub const fn top() -> Self {
        ScopeId(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Top,
    Node,
    Class,
    Define,
    /// Case branches, selector values and regex match scopes.
    Local,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub kind: ScopeKind,
    /// Resource whose evaluation created this scope.
    pub resource: Option<ResourceId>,
    /// Namespace used for relative class and define lookup.
    pub namespace: String,
    /// Class or define name recorded as the source of parameters set here.
    pub class_name: String,
    vars: FxHashMap<String, (Value, Location)>,
    defaults: IndexMap<String, IndexMap<String, Param>>,
}

#[derive(Debug)]
pub struct ScopeArena {
    scopes: Vec<Scope>,
    class_scopes: FxHashMap<String, (ScopeId, bool)>,
    declarative: bool,
}

impl ScopeArena {
    /// Create an arena holding only the top scope.
    pub fn new(declarative: bool) -> Self {
        let top = Scope {
            parent: None,
            kind: ScopeKind::Top,
            resource: None,
            namespace: String::new(),
            class_name: "main".to_string(),
            vars: FxHashMap::default(),
            defaults: IndexMap::new(),
        };
        Self {
            scopes: vec![top],
            class_scopes: FxHashMap::default(),
            declarative,
        }
    }

    pub fn top(&self) -> ScopeId {
        ScopeId::top()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0]
    }

    /// Create a child scope inheriting the parent's namespace, source
    /// resource and class name.
    pub fn new_child(&mut self, parent: ScopeId, kind: ScopeKind) -> ScopeId {
        let p = &self.scopes[parent.0];
        let child = Scope {
            parent: Some(parent),
            kind,
            resource: p.resource,
            namespace: p.namespace.clone(),
            class_name: p.class_name.clone(),
            vars: FxHashMap::default(),
            defaults: IndexMap::new(),
        };
        self.scopes.push(child);
        ScopeId(self.scopes.len() - 1)
    }

    /// Walk from `id` to the root, yielding each scope id.
    fn chain(&self, id: ScopeId) -> impl Iterator<Item = ScopeId> + '_ {
        std::iter::successors(Some(id), move |sid| self.scopes[sid.0].parent)
    }

    /// Look a variable up. `None` means undefined, which is distinct from a
    /// variable holding `undef`.
    pub fn lookup(&self, id: ScopeId, name: &str) -> Option<&Value> {
        if let Some(rest) = name.strip_prefix("::") {
            if !rest.contains("::") {
                return self.lookup_local(self.top(), rest);
            }
            return self.lookup_qualified(rest);
        }
        if name.contains("::") {
            return self.lookup_qualified(name);
        }
        self.chain(id).find_map(|sid| self.lookup_local(sid, name))
    }

    fn lookup_local(&self, id: ScopeId, name: &str) -> Option<&Value> {
        self.scopes[id.0].vars.get(name).map(|(v, _)| v)
    }

    fn lookup_qualified(&self, name: &str) -> Option<&Value> {
        let (class, var) = name.rsplit_once("::")?;
        let sid = self.class_scope(class)?;
        self.chain(sid).find_map(|s| self.lookup_local(s, var))
    }

    /// Define a variable in `id`. In declarative mode a second definition in
    /// the same scope is an error; otherwise it replaces the first.
    pub fn define(&mut self, id: ScopeId, name: &str, value: Value, loc: Location) -> Result<()> {
        if name.contains("::") {
            return Err(Error::parse(
                format!("cannot assign to variables in other namespaces: '${}'", name),
                loc,
            ));
        }
        let declarative = self.declarative;
        let scope = &mut self.scopes[id.0];
        if let Some((_, previous)) = scope.vars.get(name) {
            if declarative {
                return Err(Error::Redefinition {
                    name: name.to_string(),
                    loc,
                });
            }
            warn!(variable = name, previous = %previous, at = %loc, "reassigning variable");
        }
        scope.vars.insert(name.to_string(), (value, loc));
        Ok(())
    }

    /// Set a variable without redefinition checks (facts, match variables,
    /// `$title` and `$name`).
    pub fn set(&mut self, id: ScopeId, name: &str, value: Value) {
        self.scopes[id.0]
            .vars
            .insert(name.to_string(), (value, Location::default()));
    }

    /// `$name += value`: extend a value inherited from an enclosing scope into
    /// a new local variable.
    pub fn append(&mut self, id: ScopeId, name: &str, value: Value, loc: Location) -> Result<()> {
        if self.scopes[id.0].vars.contains_key(name) {
            return Err(Error::parse(
                format!("cannot append, variable '${}' is defined in this scope", name),
                loc,
            ));
        }
        let inherited = self.scopes[id.0]
            .parent
            .and_then(|p| self.lookup(p, name))
            .cloned();
        let combined = match inherited {
            None | Some(Value::Undef) => value,
            Some(Value::Array(mut items)) => {
                items.extend(value.flatten());
                Value::Array(items)
            }
            Some(Value::Hash(mut map)) => match value {
                Value::Hash(extra) => {
                    map.extend(extra);
                    Value::Hash(map)
                }
                other => {
                    return Err(Error::parse(
                        format!("cannot append a {} to a hash", other.kind()),
                        loc,
                    ))
                }
            },
            Some(Value::String(s)) => Value::String(format!("{}{}", s, value)),
            Some(other) => {
                return Err(Error::parse(
                    format!("cannot append to a {} variable '${}'", other.kind(), name),
                    loc,
                ))
            }
        };
        self.define(id, name, combined, loc)
    }

    /// Record defaults for `type_name` in `id`. A parameter may be defaulted
    /// once per scope.
    pub fn define_defaults(&mut self, id: ScopeId, type_name: &str, params: Vec<Param>) -> Result<()> {
        let key = canonical_type(type_name);
        let table = self.scopes[id.0].defaults.entry(key.clone()).or_default();
        for param in params {
            if table.contains_key(&param.name) {
                return Err(Error::parse(
                    format!("default already defined for {} {{ {} }}; cannot redefine", key, param.name),
                    param.loc,
                ));
            }
            table.insert(param.name.clone(), param);
        }
        Ok(())
    }

    /// Defaults visible from `id`, accumulated root first so closer scopes win.
    pub fn lookup_defaults(&self, id: ScopeId, type_name: &str) -> IndexMap<String, Param> {
        let key = canonical_type(type_name);
        let chain: Vec<ScopeId> = self.chain(id).collect();
        let mut out = IndexMap::new();
        for sid in chain.into_iter().rev() {
            if let Some(table) = self.scopes[sid.0].defaults.get(&key) {
                for (name, param) in table {
                    out.insert(name.clone(), param.clone());
                }
            }
        }
        out
    }

    pub fn class_scope(&self, name: &str) -> Option<ScopeId> {
        self.class_scopes
            .get(name.trim_start_matches("::"))
            .map(|(id, _)| *id)
    }

    /// Register the singleton scope of a class or node.
    pub fn set_class_scope(&mut self, name: &str, id: ScopeId, is_node: bool) -> Result<()> {
        match self.class_scopes.get(name) {
            Some((_, existing_node)) if *existing_node != is_node => Err(Error::parse(
                format!("cannot have classes, nodes, or definitions with the same name '{}'", name),
                Location::default(),
            )),
            Some(_) => Err(Error::internal(
                "class",
                format!("'{}' was evaluated twice", name),
                Location::default(),
            )),
            None => {
                self.class_scopes.insert(name.to_string(), (id, is_node));
                Ok(())
            }
        }
    }
}
