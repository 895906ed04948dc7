//! Built-in functions.
//!
//! Statement functions (`include`, `realize`, `notice`, ...) act on the
//! compiler; rvalue functions (`defined`, `tagged`) return a value. Using one
//! kind where the other is expected is an error.

use super::ast::Expr;
use super::catalog::EdgeKind;
use super::collector::Collector;
use super::compiler::{Compiler, Endpoint, Relationship};
use super::error::{Error, Result};
use super::scope::ScopeId;
use super::types::{Location, Value};
use tracing::{debug, error, info, warn};

pub const STATEMENT_FUNCTIONS: &[&str] = &[
    "alert", "crit", "debug", "emerg", "err", "fail", "include", "info", "notice", "realize",
    "require", "tag", "warning",
];

pub const RVALUE_FUNCTIONS: &[&str] = &["defined", "tagged"];

fn evaluate_args(cx: &mut Compiler, scope: ScopeId, args: &[Expr]) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.extend(arg.evaluate(cx, scope)?.flatten());
    }
    Ok(values)
}

fn message(values: &[Value]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Class names from `include`/`require` arguments. `Class[x]` references
/// name the class `x`.
fn class_names(values: Vec<Value>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| match v {
            Value::Ref(r) if r.is_class() => r.title,
            other => other.to_string(),
        })
        .collect()
}

pub fn call_statement(
    cx: &mut Compiler,
    scope: ScopeId,
    name: &str,
    args: &[Expr],
    loc: &Location,
) -> Result<()> {
    match name {
        "include" => {
            let names = class_names(evaluate_args(cx, scope, args)?);
            cx.evaluate_classes(&names, scope, false, loc)?;
            Ok(())
        }
        "require" => {
            let names = class_names(evaluate_args(cx, scope, args)?);
            let ids = cx.evaluate_classes(&names, scope, false, loc)?;
            let Some(requirer) = cx.scopes.get(scope).resource else {
                return Ok(());
            };
            let target = cx.resource(requirer).reference.clone();
            for id in ids {
                let source = cx.resource(id).reference.clone();
                cx.add_relationship(Relationship {
                    source: Endpoint::Resource(source),
                    target: Endpoint::Resource(target.clone()),
                    kind: EdgeKind::Before,
                    loc: loc.clone(),
                });
            }
            Ok(())
        }
        "realize" => {
            let mut refs = Vec::new();
            for arg in args {
                let value = arg.evaluate(cx, scope)?;
                refs.extend(value.to_refs().ok_or_else(|| {
                    Error::parse(
                        format!("realize expects resource references, got {} '{}'", value.kind(), value),
                        arg.loc.clone(),
                    )
                })?);
            }
            cx.add_collector(Collector::list(refs, scope, loc.clone()));
            Ok(())
        }
        "tag" => {
            let values = evaluate_args(cx, scope, args)?;
            let Some(id) = cx.scopes.get(scope).resource else {
                return Ok(());
            };
            for value in values {
                cx.resource_mut(id).add_tag(&value.to_string(), loc)?;
            }
            Ok(())
        }
        "fail" => {
            let values = evaluate_args(cx, scope, args)?;
            Err(Error::parse(message(&values), loc.clone()))
        }
        "debug" | "info" | "notice" | "warning" | "err" | "alert" | "crit" | "emerg" => {
            let text = message(&evaluate_args(cx, scope, args)?);
            let source = cx.scopes.get(scope).class_name.clone();
            match name {
                "debug" => debug!(scope = %source, "{}", text),
                "info" | "notice" => info!(scope = %source, level = name, "{}", text),
                "warning" => warn!(scope = %source, "{}", text),
                _ => error!(scope = %source, level = name, "{}", text),
            }
            Ok(())
        }
        _ if RVALUE_FUNCTIONS.contains(&name) => Err(Error::parse(
            format!("function '{}' must be the value of a statement", name),
            loc.clone(),
        )),
        _ => Err(Error::parse(format!("unknown function '{}'", name), loc.clone())),
    }
}

pub fn call_rvalue(
    cx: &mut Compiler,
    scope: ScopeId,
    name: &str,
    args: &[Expr],
    loc: &Location,
) -> Result<Value> {
    match name {
        "defined" => {
            for arg in args {
                let value = arg.evaluate(cx, scope)?;
                if is_defined(cx, scope, &value)? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "tagged" => {
            let values = evaluate_args(cx, scope, args)?;
            let resource_tags = cx
                .scopes
                .get(scope)
                .resource
                .map(|id| cx.resource(id).tags.clone())
                .unwrap_or_default();
            let all = values.iter().all(|v| {
                let tag = v.to_string().to_lowercase();
                resource_tags.contains(&tag) || cx.classes().any(|c| c == tag)
            });
            Ok(Value::Bool(all))
        }
        _ if STATEMENT_FUNCTIONS.contains(&name) => Err(Error::parse(
            format!("function '{}' does not return a value", name),
            loc.clone(),
        )),
        _ => Err(Error::parse(format!("unknown function '{}'", name), loc.clone())),
    }
}

/// `defined` for one argument: a declared resource, a known class, define
/// or builtin type, or (with a leading `$`) a set variable.
fn is_defined(cx: &Compiler, scope: ScopeId, value: &Value) -> Result<bool> {
    match value {
        Value::Ref(reference) => Ok(cx.find(reference).is_some()),
        Value::String(name) => {
            if let Some(var) = name.strip_prefix('$') {
                return Ok(cx.scopes.lookup(scope, var).is_some());
            }
            let namespace = cx.scopes.get(scope).namespace.clone();
            if cx.find_hostclass(&namespace, name)?.is_some()
                || cx.find_definition(&namespace, name)?.is_some()
            {
                return Ok(true);
            }
            let lower = name.to_lowercase();
            Ok(cx.options().builtin_types.iter().any(|t| *t == lower))
        }
        Value::Array(items) => {
            for item in items {
                if is_defined(cx, scope, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Ok(false),
    }
}
