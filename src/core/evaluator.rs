//! Evaluation of statements and expressions.
//!
//! Every AST node evaluates against `(compiler, scope)`. Evaluation goes
//! through [`safe_evaluate`], which fills a missing location on manifest
//! errors with the node's own location and adds a trace frame to internal
//! errors, so a defect in the compiler never reads like a defect in the
//! manifest.

use super::ast::{
    Arrow, Block, BinOp, CaseOption, CollectExpr, CollectForm, Expr, ExprKind, ParamExpr,
    QueryExpr, RelOperand, ResourceDecl, Statement, StatementKind, Virtuality,
};
use super::catalog::EdgeKind;
use super::collector::{CollectOverride, Collector, CollectorKind, Query};
use super::compiler::{Compiler, Endpoint, Relationship};
use super::error::{Error, Result};
use super::functions;
use super::resource::{Override, Param, Resource, ResourceKind};
use super::scope::{ScopeId, ScopeKind};
use super::types::{Location, ResourceRef, Value};
use indexmap::IndexMap;
use std::cmp::Ordering;

fn safe_evaluate<T>(node: &'static str, loc: &Location, eval: impl FnOnce() -> Result<T>) -> Result<T> {
    eval().map_err(|e| match e {
        Error::Internal { .. } => e.push_frame(format!("{} at {}", node, loc)),
        e if e.is_domain() => e.with_location(loc),
        e => e,
    })
}

impl Compiler {
    pub fn evaluate_block(&mut self, block: &Block, scope: ScopeId) -> Result<()> {
        for statement in block {
            statement.evaluate(self, scope)?;
        }
        Ok(())
    }
}

// ============================================================================
// Statements
// ============================================================================

impl Statement {
    pub fn evaluate(&self, cx: &mut Compiler, scope: ScopeId) -> Result<()> {
        safe_evaluate(self.node_name(), &self.loc, || self.eval(cx, scope))
    }

    fn eval(&self, cx: &mut Compiler, scope: ScopeId) -> Result<()> {
        match &self.kind {
            StatementKind::Assign {
                name,
                value,
                append,
            } => {
                let value = value.evaluate(cx, scope)?;
                if *append {
                    cx.scopes.append(scope, name, value, self.loc.clone())
                } else {
                    cx.scopes.define(scope, name, value, self.loc.clone())
                }
            }
            StatementKind::Resource(decl) => declare_resources(cx, scope, decl, &self.loc).map(|_| ()),
            StatementKind::Defaults { type_name, params } => {
                let (type_name, _) = cx.resolve_type(scope, type_name, &self.loc)?;
                let params = evaluate_params(cx, scope, params)?;
                cx.scopes.define_defaults(scope, &type_name, params)
            }
            StatementKind::Override { target, params } => {
                let value = target.evaluate(cx, scope)?;
                let refs = value.to_refs().ok_or_else(|| {
                    Error::parse(
                        format!("cannot override {} '{}'; expected a resource reference", value.kind(), value),
                        target.loc.clone(),
                    )
                })?;
                let params = evaluate_params(cx, scope, params)?;
                let source = cx.scopes.get(scope).class_name.clone();
                for reference in refs {
                    cx.add_override(Override {
                        target: reference,
                        params: params.clone(),
                        source: source.clone(),
                        loc: self.loc.clone(),
                        from_collection: false,
                    })?;
                }
                Ok(())
            }
            StatementKind::Collect(collect) => add_collector(cx, scope, collect).map(|_| ()),
            StatementKind::Chain { first, rest } => {
                let mut left = endpoints(cx, scope, first)?;
                for (arrow, operand) in rest {
                    let right = endpoints(cx, scope, operand)?;
                    let (sources, targets, kind) = match arrow {
                        Arrow::Before => (&left, &right, EdgeKind::Before),
                        Arrow::Notify => (&left, &right, EdgeKind::Notify),
                        Arrow::After => (&right, &left, EdgeKind::Before),
                        Arrow::NotifiedBy => (&right, &left, EdgeKind::Notify),
                    };
                    for source in sources {
                        for target in targets {
                            cx.add_relationship(Relationship {
                                source: source.clone(),
                                target: target.clone(),
                                kind,
                                loc: self.loc.clone(),
                            });
                        }
                    }
                    left = right;
                }
                Ok(())
            }
            StatementKind::If {
                test,
                then_block,
                else_block,
            } => {
                cx.last_match = None;
                let condition = test.evaluate(cx, scope)?.is_true();
                let captures = cx.last_match.take();
                if condition {
                    let body = match captures {
                        Some(captures) => branch_scope(cx, scope, captures),
                        None => scope,
                    };
                    cx.evaluate_block(then_block, body)
                } else if let Some(block) = else_block {
                    cx.evaluate_block(block, scope)
                } else {
                    Ok(())
                }
            }
            StatementKind::Case { test, options } => evaluate_case(cx, scope, test, options),
            StatementKind::Call { name, args } => {
                functions::call_statement(cx, scope, name, args, &self.loc)
            }
        }
    }
}

fn evaluate_case(cx: &mut Compiler, scope: ScopeId, test: &Expr, options: &[CaseOption]) -> Result<()> {
    let value = test.evaluate(cx, scope)?;
    let mut default = None;
    for option in options {
        for candidate in &option.values {
            if candidate.kind == ExprKind::Default {
                default.get_or_insert(option);
                continue;
            }
            let expected = candidate.evaluate(cx, scope)?;
            if let Some(captures) = match_value(cx, &value, &expected, &candidate.loc)? {
                let body = branch_scope(cx, scope, captures);
                return cx.evaluate_block(&option.body, body);
            }
        }
    }
    match default {
        Some(option) => {
            let body = branch_scope(cx, scope, Vec::new());
            cx.evaluate_block(&option.body, body)
        }
        None => Ok(()),
    }
}

/// Child scope for a case branch or selector value, holding `$0..$n`.
fn branch_scope(cx: &mut Compiler, parent: ScopeId, captures: Vec<String>) -> ScopeId {
    let scope = cx.scopes.new_child(parent, ScopeKind::Local);
    for (i, capture) in captures.into_iter().enumerate() {
        cx.scopes.set(scope, &i.to_string(), Value::from(capture));
    }
    scope
}

/// Compare a case/selector test value with one option. Regex options
/// return their captures; anything else compares with `loose_eq`.
fn match_value(
    cx: &mut Compiler,
    value: &Value,
    option: &Value,
    loc: &Location,
) -> Result<Option<Vec<String>>> {
    match option {
        Value::Regex(source) => {
            let re = cx.regex(source, loc)?;
            Ok(captures(&re, &value.to_string()))
        }
        other => Ok(value.loose_eq(other).then(Vec::new)),
    }
}

fn captures(re: &regex::Regex, text: &str) -> Option<Vec<String>> {
    re.captures(text).map(|caps| {
        caps.iter()
            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect()
    })
}

fn evaluate_params(cx: &mut Compiler, scope: ScopeId, params: &[ParamExpr]) -> Result<Vec<Param>> {
    let source = cx.scopes.get(scope).class_name.clone();
    params
        .iter()
        .map(|p| {
            let value = p.value.evaluate(cx, scope)?;
            let mut param = Param::new(p.name.clone(), value, source.clone(), p.loc.clone());
            param.append = p.append;
            Ok(param)
        })
        .collect()
}

/// Declare every title of every body. Returns the declared references.
fn declare_resources(
    cx: &mut Compiler,
    scope: ScopeId,
    decl: &ResourceDecl,
    loc: &Location,
) -> Result<Vec<ResourceRef>> {
    let (type_name, kind) = cx.resolve_type(scope, &decl.type_name, loc)?;
    let mut declared = Vec::new();
    for body in &decl.bodies {
        let titles = body.title.evaluate(cx, scope)?.flatten();
        let params = evaluate_params(cx, scope, &body.params)?;
        if let Some(param) = params.iter().find(|p| p.append) {
            return Err(Error::parse(
                format!("'+>' is only allowed in overrides and collections, not on '{}'", param.name),
                param.loc.clone(),
            ));
        }
        for title in titles {
            if title.is_undef() || title.to_string().is_empty() {
                return Err(Error::parse(format!("missing title for {} resource", type_name), body.loc.clone()));
            }
            let title = title.to_string();
            match kind {
                ResourceKind::Class => {
                    if decl.virtuality != Virtuality::Real {
                        return Err(Error::parse("classes cannot be virtual or exported", body.loc.clone()));
                    }
                    declared.push(cx.declare_class(&title, params.clone(), scope, &body.loc)?);
                }
                ResourceKind::Node => {
                    return Err(Error::parse("nodes cannot be declared as resources", body.loc.clone()));
                }
                _ => {
                    let source = cx.scopes.get(scope).class_name.clone();
                    let mut resource = Resource::new(
                        ResourceRef::new(&type_name, title),
                        kind,
                        scope,
                        source,
                        body.loc.clone(),
                    );
                    resource.is_virtual = decl.virtuality != Virtuality::Real;
                    resource.exported = decl.virtuality == Virtuality::Exported;
                    for param in &params {
                        resource.set(param.clone())?;
                    }
                    cx.apply_defaults(&mut resource);
                    declared.push(resource.reference.clone());
                    cx.add_resource(resource)?;
                }
            }
        }
    }
    Ok(declared)
}

fn add_collector(cx: &mut Compiler, scope: ScopeId, collect: &CollectExpr) -> Result<usize> {
    let (type_name, kind) = cx.resolve_type(scope, &collect.type_name, &collect.loc)?;
    if matches!(kind, ResourceKind::Class | ResourceKind::Node | ResourceKind::Stage) {
        return Err(Error::parse(format!("cannot collect {} resources", type_name), collect.loc.clone()));
    }
    let query = match &collect.query {
        Some(q) => Some(evaluate_query(cx, scope, q)?),
        None => None,
    };
    let mode = match collect.form {
        CollectForm::Virtual => CollectorKind::Virtual,
        CollectForm::Exported => CollectorKind::Exported,
    };
    let mut collector = Collector::query(type_name, mode, query, scope, collect.loc.clone());
    if !collect.overrides.is_empty() {
        let params = evaluate_params(cx, scope, &collect.overrides)?;
        collector = collector.with_override(CollectOverride {
            params,
            source: cx.scopes.get(scope).class_name.clone(),
            loc: collect.loc.clone(),
        });
    }
    Ok(cx.add_collector(collector))
}

fn evaluate_query(cx: &mut Compiler, scope: ScopeId, query: &QueryExpr) -> Result<Query> {
    Ok(match query {
        QueryExpr::Compare { param, op, value } => Query::Compare {
            param: param.clone(),
            op: *op,
            value: value.evaluate(cx, scope)?,
        },
        QueryExpr::And(a, b) => Query::And(
            Box::new(evaluate_query(cx, scope, a)?),
            Box::new(evaluate_query(cx, scope, b)?),
        ),
        QueryExpr::Or(a, b) => Query::Or(
            Box::new(evaluate_query(cx, scope, a)?),
            Box::new(evaluate_query(cx, scope, b)?),
        ),
    })
}

fn endpoints(cx: &mut Compiler, scope: ScopeId, operand: &RelOperand) -> Result<Vec<Endpoint>> {
    match operand {
        RelOperand::Resource(decl, loc) => Ok(declare_resources(cx, scope, decl, loc)?
            .into_iter()
            .map(Endpoint::Resource)
            .collect()),
        RelOperand::Reference(expr) => {
            let value = expr.evaluate(cx, scope)?;
            let refs = value.to_refs().ok_or_else(|| {
                Error::parse(
                    format!("relationships need resource references, got {} '{}'", value.kind(), value),
                    expr.loc.clone(),
                )
            })?;
            Ok(refs.into_iter().map(Endpoint::Resource).collect())
        }
        RelOperand::Collect(collect) => Ok(vec![Endpoint::Collector(add_collector(cx, scope, collect)?)]),
    }
}

// ============================================================================
// Expressions
// ============================================================================

impl Expr {
    pub fn evaluate(&self, cx: &mut Compiler, scope: ScopeId) -> Result<Value> {
        safe_evaluate(self.node_name(), &self.loc, || self.eval(cx, scope))
    }

    fn eval(&self, cx: &mut Compiler, scope: ScopeId) -> Result<Value> {
        Ok(match &self.kind {
            ExprKind::Undef => Value::Undef,
            ExprKind::Bool(b) => Value::Bool(*b),
            ExprKind::Integer(n) => Value::Integer(*n),
            ExprKind::Float(x) => Value::Float(*x),
            ExprKind::Str(s) | ExprKind::Name(s) => Value::String(s.clone()),
            ExprKind::Default => Value::from("default"),
            ExprKind::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    out.push_str(&part.evaluate(cx, scope)?.to_string());
                }
                Value::String(out)
            }
            ExprKind::Variable(name) => cx.lookup_var(scope, name, &self.loc)?,
            ExprKind::Regex(source) => Value::Regex(source.clone()),
            ExprKind::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.evaluate(cx, scope))
                    .collect::<Result<_>>()?,
            ),
            ExprKind::Hash(pairs) => {
                let mut map = IndexMap::new();
                for (key, value) in pairs {
                    let key = key.evaluate(cx, scope)?.to_string();
                    map.insert(key, value.evaluate(cx, scope)?);
                }
                Value::Hash(map)
            }
            ExprKind::ResourceRef { type_name, titles } => {
                reference(cx, scope, type_name, titles, &self.loc)?
            }
            ExprKind::Binary { op, left, right } => binary(cx, scope, *op, left, right, &self.loc)?,
            ExprKind::Not(operand) => Value::Bool(!operand.evaluate(cx, scope)?.is_true()),
            ExprKind::Negate(operand) => negate(operand.evaluate(cx, scope)?, &self.loc)?,
            ExprKind::Selector { test, options } => select(cx, scope, test, options, &self.loc)?,
            ExprKind::Call { name, args } => functions::call_rvalue(cx, scope, name, args, &self.loc)?,
        })
    }
}

fn reference(
    cx: &mut Compiler,
    scope: ScopeId,
    type_name: &str,
    titles: &[Expr],
    loc: &Location,
) -> Result<Value> {
    let (type_name, _) = cx.resolve_type(scope, type_name, loc)?;
    let mut refs = Vec::new();
    for title in titles {
        for t in title.evaluate(cx, scope)?.flatten() {
            refs.push(Value::Ref(ResourceRef::new(&type_name, t.to_string())));
        }
    }
    Ok(if refs.len() == 1 {
        refs.swap_remove(0)
    } else {
        Value::Array(refs)
    })
}

fn select(
    cx: &mut Compiler,
    scope: ScopeId,
    test: &Expr,
    options: &[(Expr, Expr)],
    loc: &Location,
) -> Result<Value> {
    let value = test.evaluate(cx, scope)?;
    let mut default = None;
    for (key, result) in options {
        if key.kind == ExprKind::Default {
            default.get_or_insert(result);
            continue;
        }
        let expected = key.evaluate(cx, scope)?;
        if let Some(captures) = match_value(cx, &value, &expected, &key.loc)? {
            let branch = branch_scope(cx, scope, captures);
            return result.evaluate(cx, branch);
        }
    }
    match default {
        Some(result) => {
            let branch = branch_scope(cx, scope, Vec::new());
            result.evaluate(cx, branch)
        }
        None => Err(Error::parse(
            format!("no matching value for selector param '{}'", value),
            loc.clone(),
        )),
    }
}

fn binary(
    cx: &mut Compiler,
    scope: ScopeId,
    op: BinOp,
    left: &Expr,
    right: &Expr,
    loc: &Location,
) -> Result<Value> {
    match op {
        BinOp::Or => {
            let truth = left.evaluate(cx, scope)?.is_true() || right.evaluate(cx, scope)?.is_true();
            return Ok(Value::Bool(truth));
        }
        BinOp::And => {
            let truth = left.evaluate(cx, scope)?.is_true() && right.evaluate(cx, scope)?.is_true();
            return Ok(Value::Bool(truth));
        }
        _ => {}
    }
    let l = left.evaluate(cx, scope)?;
    let r = right.evaluate(cx, scope)?;
    match op {
        BinOp::Eq => Ok(Value::Bool(l.loose_eq(&r))),
        BinOp::Ne => Ok(Value::Bool(!l.loose_eq(&r))),
        BinOp::Match | BinOp::NoMatch => {
            let source = match &r {
                Value::Regex(s) | Value::String(s) => s.clone(),
                other => {
                    return Err(Error::parse(
                        format!("cannot match against a {}", other.kind()),
                        loc.clone(),
                    ))
                }
            };
            let re = cx.regex(&source, loc)?;
            let found = captures(&re, &l.to_string());
            let matched = found.is_some();
            if op == BinOp::Match {
                if found.is_some() {
                    cx.last_match = found;
                }
                Ok(Value::Bool(matched))
            } else {
                Ok(Value::Bool(!matched))
            }
        }
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => compare(op, &l, &r, loc),
        BinOp::In => contains(cx, &l, &r, loc).map(Value::Bool),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => arithmetic(op, &l, &r, loc),
        BinOp::Or | BinOp::And => Err(Error::internal("operator", "boolean operator fell through", loc.clone())),
    }
}

fn compare(op: BinOp, l: &Value, r: &Value, loc: &Location) -> Result<Value> {
    let ordering = match (l.as_number(), r.as_number()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (l, r) {
            (Value::String(a), Value::String(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
            _ => None,
        },
    };
    let Some(ordering) = ordering else {
        return Err(Error::parse(
            format!("cannot compare {} with {} using '{}'", l.kind(), r.kind(), op.symbol()),
            loc.clone(),
        ));
    };
    Ok(Value::Bool(match op {
        BinOp::Lt => ordering == Ordering::Less,
        BinOp::Gt => ordering == Ordering::Greater,
        BinOp::Le => ordering != Ordering::Greater,
        _ => ordering != Ordering::Less,
    }))
}

fn contains(cx: &mut Compiler, needle: &Value, haystack: &Value, loc: &Location) -> Result<bool> {
    if let Value::Regex(source) = needle {
        let re = cx.regex(source, loc)?;
        return Ok(match haystack {
            Value::Array(items) => items.iter().any(|i| re.is_match(&i.to_string())),
            Value::Hash(map) => map.keys().any(|k| re.is_match(k)),
            other => re.is_match(&other.to_string()),
        });
    }
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|i| needle.loose_eq(i))),
        Value::Hash(map) => Ok(map.contains_key(&needle.to_string())),
        Value::String(s) => Ok(s.contains(&needle.to_string())),
        other => Err(Error::parse(
            format!("'in' expects an array, hash or string on the right, got {}", other.kind()),
            loc.clone(),
        )),
    }
}

fn as_integer(v: &Value) -> Option<i64> {
    match v {
        Value::Integer(n) => Some(*n),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn arithmetic(op: BinOp, l: &Value, r: &Value, loc: &Location) -> Result<Value> {
    let not_number = |side: &str, v: &Value| {
        Error::parse(
            format!("{} operand of '{}' is not a number: '{}'", side, op.symbol(), v),
            loc.clone(),
        )
    };
    if let (Some(a), Some(b)) = (as_integer(l), as_integer(r)) {
        let result = match op {
            BinOp::Add => a.checked_add(b),
            BinOp::Sub => a.checked_sub(b),
            BinOp::Mul => a.checked_mul(b),
            _ if b == 0 => return Err(Error::parse("division by zero", loc.clone())),
            _ => a.checked_div(b),
        };
        return result
            .map(Value::Integer)
            .ok_or_else(|| Error::parse(format!("integer overflow in '{}'", op.symbol()), loc.clone()));
    }
    let a = l.as_number().ok_or_else(|| not_number("left", l))?;
    let b = r.as_number().ok_or_else(|| not_number("right", r))?;
    Ok(Value::Float(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        _ if b == 0.0 => return Err(Error::parse("division by zero", loc.clone())),
        _ => a / b,
    }))
}

fn negate(value: Value, loc: &Location) -> Result<Value> {
    if let Some(n) = as_integer(&value) {
        return n
            .checked_neg()
            .map(Value::Integer)
            .ok_or_else(|| Error::parse("integer overflow in negation", loc.clone()));
    }
    value
        .as_number()
        .map(|x| Value::Float(-x))
        .ok_or_else(|| Error::parse(format!("cannot negate {} '{}'", value.kind(), value), loc.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compiler::CompileOptions;
    use crate::core::registry::Registry;
    use crate::core::types::NodeInfo;
    use std::sync::Arc;

    fn compiler(src: &str) -> Compiler {
        let registry = Registry::default();
        registry.load_source("site.pp", src).unwrap();
        Compiler::new(Arc::new(registry), NodeInfo::new("web01"), CompileOptions::default())
    }

    fn eval(src: &str) -> Result<Value> {
        let mut cx = compiler("");
        let expr = crate::core::parser::parse_expression(src)?;
        let top = cx.scopes.top();
        expr.evaluate(&mut cx, top)
    }

    #[test]
    fn test_evaluator_arithmetic() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), Value::Integer(7));
        assert_eq!(eval("7 / 2").unwrap(), Value::Integer(3));
        assert_eq!(eval("'4' - 1").unwrap(), Value::Integer(3));
        assert_eq!(eval("1.5 * 2").unwrap(), Value::Float(3.0));
        assert_eq!(eval("-(2)").unwrap(), Value::Integer(-2));
        assert!(matches!(eval("1 / 0").unwrap_err(), Error::Parse { .. }));
        assert!(eval("'a' + 1").is_err());
    }

    #[test]
    fn test_evaluator_comparison() {
        assert_eq!(eval("'ABC' == 'abc'").unwrap(), Value::Bool(true));
        assert_eq!(eval("2 < 10").unwrap(), Value::Bool(true));
        assert_eq!(eval("'10' > '9'").unwrap(), Value::Bool(true));
        assert_eq!(eval("'b' >= 'A'").unwrap(), Value::Bool(true));
        assert_eq!(eval("1 != 1.0").unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_evaluator_boolean_short_circuit() {
        assert_eq!(eval("true or $nope").unwrap(), Value::Bool(true));
        assert_eq!(eval("false and $nope").unwrap(), Value::Bool(false));
        assert_eq!(eval("!undef").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_evaluator_in_operator() {
        assert_eq!(eval("'b' in ['a', 'B']").unwrap(), Value::Bool(true));
        assert_eq!(eval("'ell' in 'hello'").unwrap(), Value::Bool(true));
        assert_eq!(eval("'k' in { 'k' => 1 }").unwrap(), Value::Bool(true));
        assert_eq!(eval("(/^x/ in ['a', 'xy'])").unwrap(), Value::Bool(true));
        assert!(eval("'a' in 5").is_err());
    }

    #[test]
    fn test_evaluator_selector() {
        assert_eq!(
            eval("'Debian' ? { 'debian' => 'apt', default => 'yum' }").unwrap(),
            Value::from("apt")
        );
        assert_eq!(eval("'x' ? { 'y' => 1, default => 2 }").unwrap(), Value::Integer(2));
        assert_eq!(
            eval("'web01' ? { /^web(\\d+)$/ => \"n$1\", default => 'none' }").unwrap(),
            Value::from("n01")
        );
        let err = eval("'x' ? { 'y' => 1 }").unwrap_err();
        assert!(err.to_string().contains("no matching value for selector"));
    }

    #[test]
    fn test_evaluator_match_variables_scoped_to_branch() {
        let src = r#"
if 'web01' =~ /^web(\d+)$/ { notify { 'if': message => "n$1" } }
case 'db-3' {
  /^(\w+)-(\d)$/: { notify { 'case': message => "$1/$2" } }
  default: { notify { 'case': message => 'none' } }
}
notify { 'after': message => "[$1]" }
"#;
        let catalog = compiler(src).compile().unwrap();
        let message = |r: &str| catalog.resource(r).unwrap().parameters["message"].clone();
        assert_eq!(message("Notify[if]"), Value::from("n01"));
        assert_eq!(message("Notify[case]"), Value::from("db/3"));
        assert_eq!(message("Notify[after]"), Value::from("[]"));
    }

    #[test]
    fn test_evaluator_undefined_variable() {
        assert_eq!(eval("$missing").unwrap(), Value::Undef);
        let registry = Registry::default();
        let options = CompileOptions {
            strict_variables: true,
            ..CompileOptions::default()
        };
        let mut cx = Compiler::new(Arc::new(registry), NodeInfo::new("web01"), options);
        let expr = crate::core::parser::parse_expression("$missing").unwrap();
        let top = cx.scopes.top();
        let err = expr.evaluate(&mut cx, top).unwrap_err();
        assert!(matches!(err, Error::UndefinedVariable { ref name, .. } if name == "missing"));
    }

    #[test]
    fn test_evaluator_unknown_reference_type() {
        let err = eval("Frobnicate['x']").unwrap_err();
        assert!(err.to_string().contains("invalid resource type Frobnicate"));
        assert_eq!(eval("File['/tmp']").unwrap(), Value::Ref(ResourceRef::new("file", "/tmp")));
    }

    #[test]
    fn test_evaluator_error_gets_location() {
        let mut cx = compiler("");
        let manifest = crate::core::parser::parse(
            "\n\n$x = 1 / 0\n",
            Some(Arc::from("site.pp")),
            Default::default(),
        )
        .unwrap();
        let top = cx.scopes.top();
        let err = cx.evaluate_block(&manifest.statements, top).unwrap_err();
        assert_eq!(err.location().map(|l| l.line), Some(3));
    }

    #[test]
    fn test_evaluator_internal_error_trace() {
        let err = safe_evaluate("if statement", &Location::new(None, 4), || -> Result<()> {
            Err(Error::internal("resource", "broken", Location::new(None, 4)))
        })
        .unwrap_err();
        assert!(err.to_string().contains("in if statement at line 4"));
        assert!(!err.is_domain());
    }
}
