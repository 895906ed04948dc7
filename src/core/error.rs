//! Compiler error type.
//!
//! Every failure the lexer, parser, evaluator or compiler can produce is a
//! variant of [`Error`]. Manifest errors carry the location of the offending
//! construct; `Internal` marks a compiler defect and accumulates a trace of the
//! AST nodes it unwound through.

use super::types::Location;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("lexical error: {message} at {loc}")]
    Lex { message: String, loc: Location },

    #[error("syntax error: {message}{} at {loc}", expected_hint(.expected))]
    Syntax {
        message: String,
        expected: Option<String>,
        loc: Location,
    },

    #[error("{message} at {loc}")]
    Parse { message: String, loc: Location },

    #[error("undefined variable '${name}' at {loc}")]
    UndefinedVariable { name: String, loc: Location },

    #[error("cannot reassign variable '${name}' at {loc}")]
    Redefinition { name: String, loc: Location },

    #[error("duplicate declaration: {reference} is already declared at {previous}; cannot redeclare at {loc}")]
    DuplicateResource {
        reference: String,
        previous: Location,
        loc: Location,
    },

    #[error("parameter '{param}' is already set on {resource} by {set_by}; cannot override from {attempted_by} at {loc}")]
    OverrideAuthorization {
        param: String,
        resource: String,
        set_by: String,
        attempted_by: String,
        loc: Location,
    },

    #[error("import loop detected: '{file}' is already being loaded at {loc}")]
    ImportLoop { file: String, loc: Location },

    #[error("no file(s) found for import of '{pattern}' at {loc}")]
    Import { pattern: String, loc: Location },

    #[error("internal error evaluating {node}: {message} at {loc}{}", trace_suffix(.trace))]
    Internal {
        node: String,
        message: String,
        trace: Vec<String>,
        loc: Location,
    },

    #[error("exceeded generation bound after {iterations} passes; a define is probably declaring itself")]
    GenerationLimit { iterations: usize },

    #[error("dependency cycle detected involving: {}", .members.join(", "))]
    Cycle { members: Vec<String> },

    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{source} on node {node}")]
    Compile {
        node: String,
        #[source]
        source: Box<Error>,
    },
}

fn expected_hint(expected: &Option<String>) -> String {
    match expected {
        Some(tok) => format!(" (expected {})", tok),
        None => String::new(),
    }
}

fn trace_suffix(trace: &[String]) -> String {
    trace.iter().map(|frame| format!("\n  in {}", frame)).collect()
}

impl Error {
    pub fn parse(message: impl Into<String>, loc: Location) -> Self {
        Self::Parse {
            message: message.into(),
            loc,
        }
    }

    pub fn internal(node: &str, message: impl Into<String>, loc: Location) -> Self {
        Self::Internal {
            node: node.to_string(),
            message: message.into(),
            trace: Vec::new(),
            loc,
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Location carried by the error, if it has a slot for one.
    pub fn location(&self) -> Option<&Location> {
        match self {
            Self::Lex { loc, .. }
            | Self::Syntax { loc, .. }
            | Self::Parse { loc, .. }
            | Self::UndefinedVariable { loc, .. }
            | Self::Redefinition { loc, .. }
            | Self::DuplicateResource { loc, .. }
            | Self::OverrideAuthorization { loc, .. }
            | Self::ImportLoop { loc, .. }
            | Self::Import { loc, .. }
            | Self::Internal { loc, .. } => Some(loc),
            Self::Compile { source, .. } => source.location(),
            _ => None,
        }
    }

    /// Errors raised by a manifest, as opposed to the host or the compiler.
    pub fn is_domain(&self) -> bool {
        !matches!(self, Self::Internal { .. } | Self::Io { .. } | Self::Config(_))
    }

    /// Fill in the location when the error does not know one yet.
    pub fn with_location(mut self, at: &Location) -> Self {
        match &mut self {
            Self::Lex { loc, .. }
            | Self::Syntax { loc, .. }
            | Self::Parse { loc, .. }
            | Self::UndefinedVariable { loc, .. }
            | Self::Redefinition { loc, .. }
            | Self::DuplicateResource { loc, .. }
            | Self::OverrideAuthorization { loc, .. }
            | Self::ImportLoop { loc, .. }
            | Self::Import { loc, .. }
            | Self::Internal { loc, .. } => {
                if !loc.is_known() {
                    *loc = at.clone();
                }
            }
            _ => {}
        }
        self
    }

    /// Append a frame to an internal error's trace. Other errors are untouched.
    pub fn push_frame(mut self, frame: String) -> Self {
        if let Self::Internal { trace, .. } = &mut self {
            trace.push(frame);
        }
        self
    }

    /// Wrap the error with the name of the node being compiled.
    pub fn in_node(self, node: &str) -> Self {
        match self {
            Self::Compile { .. } => self,
            other => Self::Compile {
                node: node.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error beneath any `Compile` wrapper.
    pub fn root(&self) -> &Error {
        match self {
            Self::Compile { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn at(line: u32) -> Location {
        Location::new(Some(Arc::from("site.pp")), line)
    }

    #[test]
    fn test_error_with_location_fills_unknown() {
        let err = Error::parse("boom", Location::default()).with_location(&at(4));
        assert_eq!(err.location(), Some(&at(4)));
        assert_eq!(err.to_string(), "boom at site.pp:4");
    }

    #[test]
    fn test_error_with_location_keeps_known() {
        let err = Error::parse("boom", at(2)).with_location(&at(9));
        assert_eq!(err.location(), Some(&at(2)));
    }

    #[test]
    fn test_error_internal_trace() {
        let err = Error::internal("resource", "bad state", at(1))
            .push_frame("if statement at site.pp:1".into())
            .push_frame("class body at site.pp:1".into());
        let text = err.to_string();
        assert!(text.contains("internal error evaluating resource"));
        assert!(text.contains("in if statement at site.pp:1"));
        assert!(text.contains("in class body at site.pp:1"));
        assert!(!err.is_domain());
    }

    #[test]
    fn test_error_syntax_expected() {
        let err = Error::Syntax {
            message: "unexpected '}'".into(),
            expected: Some("':'".into()),
            loc: at(7),
        };
        assert_eq!(err.to_string(), "syntax error: unexpected '}' (expected ':') at site.pp:7");
    }

    #[test]
    fn test_error_compile_wrapper() {
        let err = Error::GenerationLimit { iterations: 1000 }.in_node("web01");
        assert!(err.to_string().ends_with("on node web01"));
        assert!(matches!(err.root(), Error::GenerationLimit { iterations: 1000 }));
        let twice = err.in_node("other");
        assert!(twice.to_string().ends_with("on node web01"));
    }
}
