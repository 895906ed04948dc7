//! Runtime types shared by the lexer, evaluator and catalog.
//!
//! `Value` is what every expression evaluates to; `ResourceRef` identifies a
//! resource by canonical type and title; `Location` is the file/line pair that
//! every token, node, resource and error carries.

use indexmap::IndexMap;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Source locations
// ============================================================================

/// File and line of a token, node, resource or error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Location {
    pub file: Option<Arc<str>>,
    pub line: u32,
}

impl Location {
    pub fn new(file: Option<Arc<str>>, line: u32) -> Self {
        Self { file, line }
    }

    /// True when either a file or a line number is recorded.
    pub fn is_known(&self) -> bool {
        self.file.is_some() || self.line > 0
    }

    pub fn file_name(&self) -> Option<String> {
        self.file.as_deref().map(str::to_string)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), line) if line > 0 => write!(f, "{}:{}", file, line),
            (Some(file), _) => write!(f, "{}", file),
            (None, line) if line > 0 => write!(f, "line {}", line),
            (None, _) => write!(f, "unknown location"),
        }
    }
}

// ============================================================================
// Resource references
// ============================================================================

/// Canonical form of a resource type name: `apache::vhost` → `Apache::Vhost`.
pub fn canonical_type(name: &str) -> String {
    name.trim_start_matches("::")
        .split("::")
        .map(|segment| {
            let lower = segment.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("::")
}

/// A `(type, title)` pair identifying one resource within a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub type_name: String,
    pub title: String,
}

impl ResourceRef {
    /// Build a reference, canonicalising the type. Class titles are
    /// case-insensitive and stored lowercased without a leading `::`.
    pub fn new(type_name: &str, title: impl Into<String>) -> Self {
        let type_name = canonical_type(type_name);
        let mut title = title.into();
        if type_name == "Class" {
            title = title.trim_start_matches("::").to_lowercase();
        }
        Self { type_name, title }
    }

    /// Parse the display form `Type[title]`.
    pub fn parse(text: &str) -> Option<Self> {
        let open = text.find('[')?;
        if !text.ends_with(']') || open == 0 {
            return None;
        }
        let type_name = &text[..open];
        let title = &text[open + 1..text.len() - 1];
        let title = title.trim_matches(|c| c == '\'' || c == '"');
        Some(Self::new(type_name, title))
    }

    pub fn is_class(&self) -> bool {
        self.type_name == "Class"
    }

    pub fn is_stage(&self) -> bool {
        self.type_name == "Stage"
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.type_name, self.title)
    }
}

// ============================================================================
// Values
// ============================================================================

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undef,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Hash(IndexMap<String, Value>),
    Ref(ResourceRef),
    Regex(String),
}

impl Value {
    /// Truthiness: `undef`, `false` and the empty string are false.
    pub fn is_true(&self) -> bool {
        match self {
            Self::Undef => false,
            Self::Bool(b) => *b,
            Self::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn is_undef(&self) -> bool {
        matches!(self, Self::Undef)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of the value. Strings that look numeric count.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Integer(n) => Some(*n as f64),
            Self::Float(f) => Some(*f),
            Self::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Human-readable kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Undef => "undef",
            Self::Bool(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Hash(_) => "hash",
            Self::Ref(_) => "resource reference",
            Self::Regex(_) => "regex",
        }
    }

    /// Equality as the language defines it: strings compare
    /// case-insensitively, numbers numerically, `undef` equals `""`.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Undef, Self::Undef) => true,
            (Self::Undef, Self::String(s)) | (Self::String(s), Self::Undef) => s.is_empty(),
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::String(a), Self::String(b)) => {
                if let (Ok(x), Ok(y)) = (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
                    return x == y;
                }
                a.eq_ignore_ascii_case(b)
            }
            (Self::Integer(_) | Self::Float(_), _) | (_, Self::Integer(_) | Self::Float(_)) => {
                match (self.as_number(), other.as_number()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            (Self::Array(a), Self::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Self::Hash(a), Self::Hash(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other| v.loose_eq(other)))
            }
            (Self::Ref(a), Self::Ref(b)) => a == b,
            (Self::Ref(r), Self::String(s)) | (Self::String(s), Self::Ref(r)) => {
                ResourceRef::parse(s).as_ref() == Some(r)
            }
            (Self::Regex(a), Self::Regex(b)) => a == b,
            _ => false,
        }
    }

    /// Flatten nested arrays into a single list of scalars.
    pub fn flatten(self) -> Vec<Value> {
        match self {
            Self::Array(items) => items.into_iter().flat_map(Value::flatten).collect(),
            other => vec![other],
        }
    }

    /// Interpret the value as one or more resource references.
    pub fn to_refs(&self) -> Option<Vec<ResourceRef>> {
        match self {
            Self::Ref(r) => Some(vec![r.clone()]),
            Self::String(s) => ResourceRef::parse(s).map(|r| vec![r]),
            Self::Array(items) => {
                let mut refs = Vec::new();
                for item in items {
                    refs.extend(item.to_refs()?);
                }
                Some(refs)
            }
            _ => None,
        }
    }

    /// Convert a YAML value (facts, classifier parameters) into a `Value`.
    pub fn from_yaml(value: &serde_yaml_ng::Value) -> Value {
        match value {
            serde_yaml_ng::Value::Null => Self::Undef,
            serde_yaml_ng::Value::Bool(b) => Self::Bool(*b),
            serde_yaml_ng::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            serde_yaml_ng::Value::String(s) => Self::String(s.clone()),
            serde_yaml_ng::Value::Sequence(items) => {
                Self::Array(items.iter().map(Value::from_yaml).collect())
            }
            serde_yaml_ng::Value::Mapping(map) => Self::Hash(
                map.iter()
                    .map(|(k, v)| (yaml_key(k), Value::from_yaml(v)))
                    .collect(),
            ),
            serde_yaml_ng::Value::Tagged(tagged) => Value::from_yaml(&tagged.value),
        }
    }
}

fn yaml_key(key: &serde_yaml_ng::Value) -> String {
    match key {
        serde_yaml_ng::Value::String(s) => s.clone(),
        other => Value::from_yaml(other).to_string(),
    }
}

impl fmt::Display for Value {
    /// The interpolated string form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undef => Ok(()),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Integer(n) => write!(f, "{}", n),
            Self::Float(x) => write!(f, "{}", x),
            Self::String(s) => write!(f, "{}", s),
            Self::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
            Self::Hash(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} => {}", k, v)?;
                }
                write!(f, "}}")
            }
            Self::Ref(r) => write!(f, "{}", r),
            Self::Regex(src) => write!(f, "/{}/", src),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Undef => serializer.serialize_none(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Integer(n) => serializer.serialize_i64(*n),
            Self::Float(x) => serializer.serialize_f64(*x),
            Self::String(s) => serializer.serialize_str(s),
            Self::Array(items) => items.serialize(serializer),
            Self::Hash(map) => map.serialize(serializer),
            Self::Ref(r) => serializer.serialize_str(&r.to_string()),
            Self::Regex(src) => serializer.serialize_str(&format!("/{}/", src)),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a manifest value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Undef)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Undef)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Value, D::Error> {
        Value::deserialize(d)
    }

    fn visit_bool<E: de::Error>(self, b: bool) -> Result<Value, E> {
        Ok(Value::Bool(b))
    }

    fn visit_i64<E: de::Error>(self, n: i64) -> Result<Value, E> {
        Ok(Value::Integer(n))
    }

    fn visit_u64<E: de::Error>(self, n: u64) -> Result<Value, E> {
        Ok(i64::try_from(n).map_or(Value::Float(n as f64), Value::Integer))
    }

    fn visit_f64<E: de::Error>(self, x: f64) -> Result<Value, E> {
        Ok(Value::Float(x))
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<Value, E> {
        Ok(Value::String(s.to_string()))
    }

    fn visit_string<E: de::Error>(self, s: String) -> Result<Value, E> {
        Ok(Value::String(s))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut out = IndexMap::new();
        while let Some((k, v)) = map.next_entry::<String, Value>()? {
            out.insert(k, v);
        }
        Ok(Value::Hash(out))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

// ============================================================================
// Node being compiled
// ============================================================================

/// The target node: its name, facts and externally assigned classes.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub name: String,
    pub facts: IndexMap<String, Value>,
    pub classes: Vec<String>,
    pub parameters: IndexMap<String, Value>,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_fact(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.facts.insert(name.to_string(), value.into());
        self
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.classes.push(class.to_string());
        self
    }

    /// Candidate names for node-definition lookup: the full name followed by
    /// each shorter domain prefix (`web01.example.com`, `web01.example`, `web01`).
    pub fn names(&self) -> Vec<String> {
        let full = self.name.to_lowercase();
        let mut names = vec![full.clone()];
        let mut current = full.as_str();
        while let Some(idx) = current.rfind('.') {
            current = &current[..idx];
            names.push(current.to_string());
        }
        names
    }
}

// ============================================================================
// Tests
// ============================================================================
