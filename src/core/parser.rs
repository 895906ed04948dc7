//! Recursive-descent parser producing a [`Manifest`].
//!
//! Statements are parsed by leading token; expressions use precedence
//! climbing. Class, define and node definitions are collected separately from
//! the main statement list, and nested definitions are namespaced by their
//! enclosing class.

use super::ast::*;
use super::error::{Error, Result};
use super::functions::STATEMENT_FUNCTIONS;
pub use super::lexer::ParserOptions;
use super::lexer::{tokenize, Token, TokenKind};
use super::types::Location;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;

/// Parse one source file.
pub fn parse(src: &str, file: Option<Arc<str>>, options: ParserOptions) -> Result<Manifest> {
    let tokens = tokenize(src, file.clone(), options)?;
    let mut parser = Parser::new(&tokens, file.clone());
    let statements = parser.parse_statements(None)?;
    Ok(Manifest {
        file,
        statements,
        definitions: parser.definitions,
        imports: parser.imports,
    })
}

/// Parse a single expression, e.g. a value passed on the command line.
pub fn parse_expression(src: &str) -> Result<Expr> {
    let tokens = tokenize(src, None, ParserOptions::default())?;
    let mut parser = Parser::new(&tokens, None);
    let expr = parser.parse_expr()?;
    if !parser.ts.at_end() {
        return Err(parser.unexpected(None));
    }
    Ok(expr)
}

// ============================================================================
// Token stream
// ============================================================================

struct TokenStream<'t> {
    tokens: &'t [Token],
    pos: usize,
    file: Option<Arc<str>>,
}

impl<'t> TokenStream<'t> {
    fn peek(&self) -> Option<&'t TokenKind> {
        self.peek_nth(0)
    }

    fn peek_nth(&self, n: usize) -> Option<&'t TokenKind> {
        self.tokens.get(self.pos + n).map(|t| &t.kind)
    }

    fn advance(&mut self) -> Option<&'t Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        matches!(self.peek(), Some(k) if std::mem::discriminant(k) == std::mem::discriminant(kind))
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// Location of the current token, or of the last token at end of input.
    fn loc(&self) -> Location {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(Token::location)
            .unwrap_or_else(|| Location::new(self.file.clone(), 0))
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser<'t> {
    ts: TokenStream<'t>,
    namespaces: Vec<String>,
    /// Depth of blocks in which definitions are not allowed (conditionals,
    /// define and node bodies).
    restricted: usize,
    definitions: Vec<Definition>,
    imports: Vec<(String, Location)>,
}

fn binary_op(kind: &TokenKind) -> Option<(BinOp, u8)> {
    Some(match kind {
        TokenKind::Or => (BinOp::Or, 1),
        TokenKind::And => (BinOp::And, 2),
        TokenKind::IsEqual => (BinOp::Eq, 3),
        TokenKind::NotEqual => (BinOp::Ne, 3),
        TokenKind::Match => (BinOp::Match, 3),
        TokenKind::NoMatch => (BinOp::NoMatch, 3),
        TokenKind::LessThan => (BinOp::Lt, 3),
        TokenKind::GreaterThan => (BinOp::Gt, 3),
        TokenKind::LessEqual => (BinOp::Le, 3),
        TokenKind::GreaterEqual => (BinOp::Ge, 3),
        TokenKind::In => (BinOp::In, 4),
        TokenKind::Plus => (BinOp::Add, 5),
        TokenKind::Minus => (BinOp::Sub, 5),
        TokenKind::Times => (BinOp::Mul, 6),
        TokenKind::Div => (BinOp::Div, 6),
        _ => return None,
    })
}

fn arrow_of(kind: &TokenKind) -> Option<Arrow> {
    Some(match kind {
        TokenKind::InEdge => Arrow::Before,
        TokenKind::InEdgeSub => Arrow::Notify,
        TokenKind::OutEdge => Arrow::After,
        TokenKind::OutEdgeSub => Arrow::NotifiedBy,
        _ => return None,
    })
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Token], file: Option<Arc<str>>) -> Self {
        Self {
            ts: TokenStream {
                tokens,
                pos: 0,
                file,
            },
            namespaces: Vec::new(),
            restricted: 0,
            definitions: Vec::new(),
            imports: Vec::new(),
        }
    }

    fn unexpected(&self, expected: Option<&str>) -> Error {
        let message = match self.ts.peek() {
            Some(kind) => format!("unexpected {}", kind),
            None => "unexpected end of input".to_string(),
        };
        Error::Syntax {
            message,
            expected: expected.map(str::to_string),
            loc: self.ts.loc(),
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<&'t Token> {
        if self.ts.check(&kind) {
            if let Some(tok) = self.ts.advance() {
                return Ok(tok);
            }
        }
        Err(self.unexpected(Some(&kind.to_string())))
    }

    /// A bare word, or a keyword where a name is allowed (parameter names).
    fn expect_word(&mut self, what: &str) -> Result<String> {
        match self.ts.peek() {
            Some(TokenKind::Name(n)) => {
                self.ts.advance();
                Ok(n.clone())
            }
            Some(kind) => match kind.keyword_text() {
                Some(text) => {
                    self.ts.advance();
                    Ok(text.to_string())
                }
                None => Err(self.unexpected(Some(what))),
            },
            None => Err(self.unexpected(Some(what))),
        }
    }

    fn qualify(&self, name: &str) -> String {
        let name = name.to_lowercase();
        if let Some(stripped) = name.strip_prefix("::") {
            return stripped.to_string();
        }
        match self.namespaces.last() {
            Some(ns) => format!("{}::{}", ns, name),
            None => name,
        }
    }

    // ------------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------------

    /// Parse statements until `end` (not consumed) or end of input.
    fn parse_statements(&mut self, end: Option<&TokenKind>) -> Result<Block> {
        let mut block = Vec::new();
        loop {
            match (self.ts.peek(), end) {
                (None, None) => break,
                (None, Some(_)) => return Err(self.unexpected(end.map(|k| k.to_string()).as_deref())),
                (Some(k), Some(e)) if k == e => break,
                _ => {}
            }
            if let Some(stmt) = self.parse_statement()? {
                block.push(stmt);
            }
        }
        Ok(block)
    }

    fn parse_block(&mut self) -> Result<Block> {
        self.expect(TokenKind::LBrace)?;
        let block = self.parse_statements(Some(&TokenKind::RBrace))?;
        self.expect(TokenKind::RBrace)?;
        Ok(block)
    }

    fn parse_restricted_block(&mut self) -> Result<Block> {
        self.restricted += 1;
        let block = self.parse_block();
        self.restricted -= 1;
        block
    }

    fn parse_statement(&mut self) -> Result<Option<Statement>> {
        let loc = self.ts.loc();
        let Some(kind) = self.ts.peek() else {
            return Err(self.unexpected(None));
        };
        let next = self.ts.peek_nth(1);
        match kind {
            TokenKind::Semic => {
                self.ts.advance();
                Ok(None)
            }
            TokenKind::Import => {
                self.parse_import()?;
                Ok(None)
            }
            TokenKind::Class if next != Some(&TokenKind::LBrace) => {
                self.parse_definition(DefinitionKind::Class)?;
                Ok(None)
            }
            TokenKind::Define => {
                self.parse_definition(DefinitionKind::Define)?;
                Ok(None)
            }
            TokenKind::Node => {
                self.parse_node()?;
                Ok(None)
            }
            TokenKind::Variable(name)
                if matches!(next, Some(TokenKind::Equals | TokenKind::AppendEquals)) =>
            {
                self.ts.advance();
                let append = matches!(self.ts.advance().map(|t| &t.kind), Some(TokenKind::AppendEquals));
                let value = self.parse_expr()?;
                Ok(Some(Statement {
                    kind: StatementKind::Assign {
                        name: name.clone(),
                        value,
                        append,
                    },
                    loc,
                }))
            }
            TokenKind::If => self.parse_if().map(Some),
            TokenKind::Unless => self.parse_unless().map(Some),
            TokenKind::Case => self.parse_case().map(Some),
            TokenKind::Name(name) if next == Some(&TokenKind::LParen) => {
                self.ts.advance();
                let args = self.parse_call_args()?;
                Ok(Some(Statement {
                    kind: StatementKind::Call {
                        name: name.clone(),
                        args,
                    },
                    loc,
                }))
            }
            TokenKind::Name(name)
                if STATEMENT_FUNCTIONS.contains(&name.as_str()) && next != Some(&TokenKind::LBrace) =>
            {
                self.ts.advance();
                let mut args = vec![self.parse_expr()?];
                while self.ts.eat(&TokenKind::Comma) {
                    args.push(self.parse_expr()?);
                }
                Ok(Some(Statement {
                    kind: StatementKind::Call {
                        name: name.clone(),
                        args,
                    },
                    loc,
                }))
            }
            _ => self.parse_chainable(loc).map(Some),
        }
    }

    fn parse_import(&mut self) -> Result<()> {
        self.ts.advance();
        loop {
            let loc = self.ts.loc();
            match self.ts.peek() {
                Some(TokenKind::Str(pattern)) => {
                    self.ts.advance();
                    self.imports.push((pattern.clone(), loc));
                }
                Some(TokenKind::DqPre(_)) => {
                    return Err(Error::parse("import patterns cannot be interpolated", loc));
                }
                _ => return Err(self.unexpected(Some("a quoted file pattern"))),
            }
            if !self.ts.eat(&TokenKind::Comma) {
                return Ok(());
            }
        }
    }

    fn parse_arguments(&mut self) -> Result<IndexMap<String, Option<Expr>>> {
        let mut args = IndexMap::new();
        if !self.ts.eat(&TokenKind::LParen) {
            return Ok(args);
        }
        while !self.ts.check(&TokenKind::RParen) {
            let loc = self.ts.loc();
            let name = match self.ts.peek() {
                Some(TokenKind::Variable(v)) => {
                    self.ts.advance();
                    v.clone()
                }
                _ => return Err(self.unexpected(Some("a parameter variable"))),
            };
            let default = if self.ts.eat(&TokenKind::Equals) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            if args.insert(name.clone(), default).is_some() {
                return Err(Error::parse(format!("duplicate parameter '${}'", name), loc));
            }
            if !self.ts.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    fn parse_definition(&mut self, kind: DefinitionKind) -> Result<()> {
        let keyword = self.expect(if kind == DefinitionKind::Class {
            TokenKind::Class
        } else {
            TokenKind::Define
        })?;
        let loc = keyword.location();
        if self.restricted > 0 {
            return Err(Error::parse(
                "classes and definitions may only appear at top level or inside other classes",
                loc,
            ));
        }
        let name = self.expect_word("a class or define name")?;
        let name = self.qualify(&name);
        let arguments = self.parse_arguments()?;
        let parent = if kind == DefinitionKind::Class && self.ts.eat(&TokenKind::Inherits) {
            Some(self.expect_word("a parent class name")?.to_lowercase())
        } else {
            None
        };

        self.namespaces.push(name.clone());
        let body = if kind == DefinitionKind::Define {
            self.parse_restricted_block()
        } else {
            self.parse_block()
        };
        self.namespaces.pop();

        self.definitions.push(Definition {
            kind,
            name,
            regex: None,
            parent,
            arguments,
            body: Arc::new(body?),
            loc,
            doc: keyword.doc.clone(),
        });
        Ok(())
    }

    /// `default`, a quoted string, a regex, or dotted bare words.
    fn parse_hostname(&mut self) -> Result<(String, Option<String>)> {
        match self.ts.peek() {
            Some(TokenKind::Default) => {
                self.ts.advance();
                Ok(("default".to_string(), None))
            }
            Some(TokenKind::Str(s)) => {
                self.ts.advance();
                Ok((s.to_lowercase(), None))
            }
            Some(TokenKind::Regex(r)) => {
                self.ts.advance();
                let synthetic: String = r
                    .chars()
                    .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
                    .collect();
                Ok((format!("__node_regexp__{}", synthetic), Some(r.clone())))
            }
            Some(TokenKind::Name(first)) => {
                self.ts.advance();
                let mut name = first.clone();
                while self.ts.check(&TokenKind::Dot) {
                    self.ts.advance();
                    match self.ts.peek() {
                        Some(TokenKind::Name(part)) => name.push_str(&format!(".{}", part)),
                        Some(TokenKind::Number(n)) => name.push_str(&format!(".{}", n)),
                        _ => return Err(self.unexpected(Some("a host name segment"))),
                    }
                    self.ts.advance();
                }
                Ok((name.to_lowercase(), None))
            }
            _ => Err(self.unexpected(Some("a node name"))),
        }
    }

    fn parse_node(&mut self) -> Result<()> {
        let keyword = self.expect(TokenKind::Node)?;
        let loc = keyword.location();
        if self.restricted > 0 || !self.namespaces.is_empty() {
            return Err(Error::parse("node definitions may only appear at top level", loc));
        }
        let mut names = vec![self.parse_hostname()?];
        while self.ts.eat(&TokenKind::Comma) {
            names.push(self.parse_hostname()?);
        }
        let parent = if self.ts.eat(&TokenKind::Inherits) {
            Some(self.parse_hostname()?.0)
        } else {
            None
        };
        let body = Arc::new(self.parse_restricted_block()?);
        for (name, regex) in names {
            self.definitions.push(Definition {
                kind: DefinitionKind::Node,
                name,
                regex,
                parent: parent.clone(),
                arguments: IndexMap::new(),
                body: Arc::clone(&body),
                loc: loc.clone(),
                doc: keyword.doc.clone(),
            });
        }
        Ok(())
    }

    fn parse_if(&mut self) -> Result<Statement> {
        let loc = self.ts.loc();
        self.ts.advance();
        let test = self.parse_expr()?;
        let then_block = self.parse_restricted_block()?;
        let else_block = if self.ts.check(&TokenKind::Elsif) {
            Some(vec![self.parse_if()?])
        } else if self.ts.eat(&TokenKind::Else) {
            Some(self.parse_restricted_block()?)
        } else {
            None
        };
        Ok(Statement {
            kind: StatementKind::If {
                test,
                then_block,
                else_block,
            },
            loc,
        })
    }

    fn parse_unless(&mut self) -> Result<Statement> {
        let loc = self.ts.loc();
        self.ts.advance();
        let test = self.parse_expr()?;
        let test = Expr::new(ExprKind::Not(Box::new(test)), loc.clone());
        let then_block = self.parse_restricted_block()?;
        let else_block = if self.ts.eat(&TokenKind::Else) {
            Some(self.parse_restricted_block()?)
        } else {
            None
        };
        Ok(Statement {
            kind: StatementKind::If {
                test,
                then_block,
                else_block,
            },
            loc,
        })
    }

    fn check_duplicate(seen: &mut HashSet<String>, value: &Expr, what: &str) -> Result<()> {
        if let Some(key) = value.literal_key() {
            if !seen.insert(key) {
                return Err(Error::parse(
                    format!("duplicate value in {}: option is already used", what),
                    value.loc.clone(),
                ));
            }
        }
        Ok(())
    }

    fn parse_case(&mut self) -> Result<Statement> {
        let loc = self.ts.loc();
        self.ts.advance();
        let test = self.parse_expr()?;
        self.expect(TokenKind::LBrace)?;
        let mut options = Vec::new();
        let mut seen = HashSet::new();
        while !self.ts.check(&TokenKind::RBrace) {
            let option_loc = self.ts.loc();
            let mut values = vec![self.parse_expr()?];
            while self.ts.eat(&TokenKind::Comma) {
                values.push(self.parse_expr()?);
            }
            for value in &values {
                Self::check_duplicate(&mut seen, value, "case statement")?;
            }
            self.expect(TokenKind::Colon)?;
            let body = self.parse_restricted_block()?;
            options.push(CaseOption {
                values,
                body,
                loc: option_loc,
            });
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Statement {
            kind: StatementKind::Case { test, options },
            loc,
        })
    }

    // ------------------------------------------------------------------------
    // Resources, defaults, overrides, collections, relationships
    // ------------------------------------------------------------------------

    fn parse_chainable(&mut self, loc: Location) -> Result<Statement> {
        if let Some(TokenKind::ClassRef(type_name)) = self.ts.peek() {
            match self.ts.peek_nth(1) {
                Some(TokenKind::LBrace) => {
                    self.ts.advance();
                    let params = self.parse_param_block(false)?;
                    return Ok(Statement {
                        kind: StatementKind::Defaults {
                            type_name: type_name.clone(),
                            params,
                        },
                        loc,
                    });
                }
                Some(TokenKind::LBrack) => {
                    let target = self.parse_primary()?;
                    if self.ts.check(&TokenKind::LBrace) {
                        let params = self.parse_param_block(true)?;
                        return Ok(Statement {
                            kind: StatementKind::Override { target, params },
                            loc,
                        });
                    }
                    return self.finish_chain(RelOperand::Reference(target), loc);
                }
                _ => {}
            }
        }
        let first = self.parse_rel_operand()?;
        self.finish_chain(first, loc)
    }

    fn finish_chain(&mut self, first: RelOperand, loc: Location) -> Result<Statement> {
        let mut rest = Vec::new();
        while let Some(arrow) = self.ts.peek().and_then(arrow_of) {
            self.ts.advance();
            rest.push((arrow, self.parse_rel_operand()?));
        }
        if !rest.is_empty() {
            return Ok(Statement {
                kind: StatementKind::Chain { first, rest },
                loc,
            });
        }
        match first {
            RelOperand::Resource(decl, _) => Ok(Statement {
                kind: StatementKind::Resource(decl),
                loc,
            }),
            RelOperand::Collect(collect) => Ok(Statement {
                kind: StatementKind::Collect(collect),
                loc,
            }),
            RelOperand::Reference(_) => Err(self.unexpected(Some("'{' or a relationship arrow"))),
        }
    }

    fn parse_rel_operand(&mut self) -> Result<RelOperand> {
        let loc = self.ts.loc();
        match (self.ts.peek(), self.ts.peek_nth(1)) {
            (Some(TokenKind::At | TokenKind::AtAt), _)
            | (Some(TokenKind::Name(_) | TokenKind::Class), Some(TokenKind::LBrace)) => {
                Ok(RelOperand::Resource(self.parse_resource()?, loc))
            }
            (Some(TokenKind::ClassRef(_)), Some(TokenKind::LCollect | TokenKind::LLCollect)) => {
                Ok(RelOperand::Collect(self.parse_collect()?))
            }
            (Some(TokenKind::ClassRef(_)), Some(TokenKind::LBrack)) => {
                Ok(RelOperand::Reference(self.parse_primary()?))
            }
            _ => Err(self.unexpected(Some("a resource, reference or collection"))),
        }
    }

    fn parse_resource(&mut self) -> Result<ResourceDecl> {
        let virtuality = if self.ts.eat(&TokenKind::AtAt) {
            Virtuality::Exported
        } else if self.ts.eat(&TokenKind::At) {
            Virtuality::Virtual
        } else {
            Virtuality::Real
        };
        let type_name = match self.ts.peek() {
            Some(TokenKind::Name(n)) => n.clone(),
            Some(TokenKind::Class) => "class".to_string(),
            _ => return Err(self.unexpected(Some("a resource type"))),
        };
        self.ts.advance();
        self.expect(TokenKind::LBrace)?;
        let mut bodies = Vec::new();
        while !self.ts.check(&TokenKind::RBrace) {
            let loc = self.ts.loc();
            let title = self.parse_expr()?;
            self.expect(TokenKind::Colon)?;
            let params = self.parse_params(false)?;
            bodies.push(ResourceBody { title, params, loc });
            if !self.ts.eat(&TokenKind::Semic) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        if bodies.is_empty() {
            return Err(Error::parse(
                format!("resource declaration of '{}' has no title", type_name),
                self.ts.loc(),
            ));
        }
        Ok(ResourceDecl {
            type_name,
            virtuality,
            bodies,
        })
    }

    /// `name => value` pairs up to (not including) `}` or `;`.
    fn parse_params(&mut self, allow_append: bool) -> Result<Vec<ParamExpr>> {
        let mut params = Vec::new();
        while !matches!(self.ts.peek(), Some(TokenKind::RBrace | TokenKind::Semic) | None) {
            let loc = self.ts.loc();
            let name = self.expect_word("a parameter name")?;
            let append = match self.ts.peek() {
                Some(TokenKind::FatArrow) => false,
                Some(TokenKind::PlusArrow) if allow_append => true,
                _ => return Err(self.unexpected(Some("'=>'"))),
            };
            self.ts.advance();
            let value = self.parse_expr()?;
            params.push(ParamExpr {
                name,
                value,
                append,
                loc,
            });
            if !self.ts.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(params)
    }

    fn parse_param_block(&mut self, allow_append: bool) -> Result<Vec<ParamExpr>> {
        self.expect(TokenKind::LBrace)?;
        let params = self.parse_params(allow_append)?;
        self.ts.eat(&TokenKind::Semic);
        self.expect(TokenKind::RBrace)?;
        Ok(params)
    }

    fn parse_collect(&mut self) -> Result<CollectExpr> {
        let loc = self.ts.loc();
        let type_name = match self.ts.advance().map(|t| &t.kind) {
            Some(TokenKind::ClassRef(n)) => n.clone(),
            _ => return Err(self.unexpected(Some("a type reference"))),
        };
        let (form, close) = if self.ts.eat(&TokenKind::LLCollect) {
            (CollectForm::Exported, TokenKind::RRCollect)
        } else {
            self.expect(TokenKind::LCollect)?;
            (CollectForm::Virtual, TokenKind::RCollect)
        };
        let query = if self.ts.check(&close) {
            None
        } else {
            Some(self.parse_query_or()?)
        };
        self.expect(close)?;
        let overrides = if self.ts.check(&TokenKind::LBrace) {
            self.parse_param_block(true)?
        } else {
            Vec::new()
        };
        Ok(CollectExpr {
            type_name,
            form,
            query,
            overrides,
            loc,
        })
    }

    fn parse_query_or(&mut self) -> Result<QueryExpr> {
        let mut left = self.parse_query_and()?;
        while self.ts.eat(&TokenKind::Or) {
            let right = self.parse_query_and()?;
            left = QueryExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_query_and(&mut self) -> Result<QueryExpr> {
        let mut left = self.parse_query_atom()?;
        while self.ts.eat(&TokenKind::And) {
            let right = self.parse_query_atom()?;
            left = QueryExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_query_atom(&mut self) -> Result<QueryExpr> {
        if self.ts.eat(&TokenKind::LParen) {
            let inner = self.parse_query_or()?;
            self.expect(TokenKind::RParen)?;
            return Ok(inner);
        }
        let param = self.expect_word("a parameter name")?;
        let op = match self.ts.peek() {
            Some(TokenKind::IsEqual) => QueryOp::Eq,
            Some(TokenKind::NotEqual) => QueryOp::Ne,
            _ => return Err(self.unexpected(Some("'==' or '!='"))),
        };
        self.ts.advance();
        let value = self.parse_primary()?;
        Ok(QueryExpr::Compare { param, op, value })
    }

    // ------------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_binary(0)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while let Some((op, prec)) = self.ts.peek().and_then(binary_op) {
            if prec < min_prec {
                break;
            }
            let loc = self.ts.loc();
            self.ts.advance();
            let right = self.parse_binary(prec + 1)?;
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                loc,
            );
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let loc = self.ts.loc();
        if self.ts.eat(&TokenKind::Not) {
            let inner = self.parse_unary()?;
            return Ok(Expr::new(ExprKind::Not(Box::new(inner)), loc));
        }
        if self.ts.eat(&TokenKind::Minus) {
            let inner = self.parse_unary()?;
            let kind = match inner.kind {
                ExprKind::Integer(n) => ExprKind::Integer(-n),
                ExprKind::Float(x) => ExprKind::Float(-x),
                _ => ExprKind::Negate(Box::new(inner)),
            };
            return Ok(Expr::new(kind, loc));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        while self.ts.check(&TokenKind::QMark) {
            let loc = self.ts.loc();
            self.ts.advance();
            self.expect(TokenKind::LBrace)?;
            let mut options = Vec::new();
            let mut seen = HashSet::new();
            while !self.ts.check(&TokenKind::RBrace) {
                let key = self.parse_primary()?;
                Self::check_duplicate(&mut seen, &key, "selector")?;
                self.expect(TokenKind::FatArrow)?;
                let value = self.parse_expr()?;
                options.push((key, value));
                if !self.ts.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RBrace)?;
            expr = Expr::new(
                ExprKind::Selector {
                    test: Box::new(expr),
                    options,
                },
                loc,
            );
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        while !self.ts.check(&TokenKind::RParen) {
            args.push(self.parse_expr()?);
            if !self.ts.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let loc = self.ts.loc();
        let Some(kind) = self.ts.peek() else {
            return Err(self.unexpected(Some("an expression")));
        };
        let expr = match kind {
            TokenKind::Str(s) => ExprKind::Str(s.clone()),
            TokenKind::DqPre(_) => return self.parse_interpolated(),
            TokenKind::Number(n) => ExprKind::Integer(*n),
            TokenKind::Float(x) => ExprKind::Float(*x),
            TokenKind::True => ExprKind::Bool(true),
            TokenKind::False => ExprKind::Bool(false),
            TokenKind::Undef => ExprKind::Undef,
            TokenKind::Default => ExprKind::Default,
            TokenKind::Variable(v) => ExprKind::Variable(v.clone()),
            TokenKind::Regex(r) => ExprKind::Regex(r.clone()),
            TokenKind::Name(n) => {
                self.ts.advance();
                if self.ts.check(&TokenKind::LParen) {
                    let args = self.parse_call_args()?;
                    return Ok(Expr::new(
                        ExprKind::Call {
                            name: n.clone(),
                            args,
                        },
                        loc,
                    ));
                }
                return Ok(Expr::new(ExprKind::Name(n.clone()), loc));
            }
            TokenKind::ClassRef(type_name) => {
                self.ts.advance();
                if !self.ts.eat(&TokenKind::LBrack) {
                    return Ok(Expr::new(ExprKind::Name(type_name.clone()), loc));
                }
                let mut titles = Vec::new();
                while !self.ts.check(&TokenKind::RBrack) {
                    titles.push(self.parse_expr()?);
                    if !self.ts.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBrack)?;
                if titles.is_empty() {
                    return Err(Error::parse(
                        format!("reference to {} has no title", type_name),
                        loc,
                    ));
                }
                return Ok(Expr::new(
                    ExprKind::ResourceRef {
                        type_name: type_name.clone(),
                        titles,
                    },
                    loc,
                ));
            }
            TokenKind::LBrack => {
                self.ts.advance();
                let mut items = Vec::new();
                while !self.ts.check(&TokenKind::RBrack) {
                    items.push(self.parse_expr()?);
                    if !self.ts.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBrack)?;
                return Ok(Expr::new(ExprKind::Array(items), loc));
            }
            TokenKind::LBrace => {
                self.ts.advance();
                let mut pairs = Vec::new();
                while !self.ts.check(&TokenKind::RBrace) {
                    let key = self.parse_primary()?;
                    self.expect(TokenKind::FatArrow)?;
                    let value = self.parse_expr()?;
                    pairs.push((key, value));
                    if !self.ts.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace)?;
                return Ok(Expr::new(ExprKind::Hash(pairs), loc));
            }
            TokenKind::LParen => {
                self.ts.advance();
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                return Ok(inner);
            }
            _ => return Err(self.unexpected(Some("an expression"))),
        };
        self.ts.advance();
        Ok(Expr::new(expr, loc))
    }

    fn parse_interpolated(&mut self) -> Result<Expr> {
        let loc = self.ts.loc();
        let mut parts = Vec::new();
        if let Some(TokenKind::DqPre(text)) = self.ts.peek() {
            self.ts.advance();
            parts.push(Expr::new(ExprKind::Str(text.clone()), loc.clone()));
        }
        loop {
            parts.push(self.parse_expr()?);
            let seg_loc = self.ts.loc();
            match self.ts.peek() {
                Some(TokenKind::DqMid(text)) => {
                    self.ts.advance();
                    parts.push(Expr::new(ExprKind::Str(text.clone()), seg_loc));
                }
                Some(TokenKind::DqPost(text)) => {
                    self.ts.advance();
                    parts.push(Expr::new(ExprKind::Str(text.clone()), seg_loc));
                    break;
                }
                _ => return Err(self.unexpected(Some("end of interpolation"))),
            }
        }
        parts.retain(|p| !matches!(&p.kind, ExprKind::Str(s) if s.is_empty()));
        Ok(Expr::new(ExprKind::Concat(parts), loc))
    }
}
