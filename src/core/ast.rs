//! Abstract syntax tree produced by the parser.
//!
//! Expressions and statements are closed enums; the evaluator dispatches on
//! them with `match`. Every node carries its `Location`. Class, define and
//! node definitions are not statements: the parser collects them into
//! [`Manifest::definitions`] so the registry can register them at load time.

use super::types::Location;
use indexmap::IndexMap;
use std::sync::Arc;

pub type Block = Vec<Statement>;

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Undef,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Str(String),
    /// Interpolated string: literal and expression parts, concatenated.
    Concat(Vec<Expr>),
    /// Bare word.
    Name(String),
    /// The `default` keyword inside case and selector options.
    Default,
    Variable(String),
    Regex(String),
    Array(Vec<Expr>),
    Hash(Vec<(Expr, Expr)>),
    ResourceRef {
        type_name: String,
        titles: Vec<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    Negate(Box<Expr>),
    Selector {
        test: Box<Expr>,
        options: Vec<(Expr, Expr)>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Match,
    NoMatch,
    Lt,
    Gt,
    Le,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Or => "or",
            Self::And => "and",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Match => "=~",
            Self::NoMatch => "!~",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::In => "in",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }
}

impl Expr {
    pub fn new(kind: ExprKind, loc: Location) -> Self {
        Self { kind, loc }
    }

    /// Node kind name used in internal-error traces.
    pub fn node_name(&self) -> &'static str {
        match &self.kind {
            ExprKind::Undef
            | ExprKind::Bool(_)
            | ExprKind::Integer(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_) => "literal",
            ExprKind::Concat(_) => "string",
            ExprKind::Name(_) => "name",
            ExprKind::Default => "default",
            ExprKind::Variable(_) => "variable",
            ExprKind::Regex(_) => "regex",
            ExprKind::Array(_) => "array",
            ExprKind::Hash(_) => "hash",
            ExprKind::ResourceRef { .. } => "resource reference",
            ExprKind::Binary { .. } => "operator",
            ExprKind::Not(_) | ExprKind::Negate(_) => "unary operator",
            ExprKind::Selector { .. } => "selector",
            ExprKind::Call { .. } => "function call",
        }
    }

    /// Literal key used to detect duplicate case/selector options.
    pub fn literal_key(&self) -> Option<String> {
        match &self.kind {
            ExprKind::Str(s) | ExprKind::Name(s) => Some(format!("s:{}", s.to_lowercase())),
            ExprKind::Integer(n) => Some(format!("n:{}", *n as f64)),
            ExprKind::Float(x) => Some(format!("n:{}", x)),
            ExprKind::Bool(b) => Some(format!("b:{}", b)),
            ExprKind::Regex(r) => Some(format!("r:{}", r)),
            ExprKind::Undef => Some("u".to_string()),
            _ => None,
        }
    }
}

// ============================================================================
// Statements
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Assign {
        name: String,
        value: Expr,
        append: bool,
    },
    Resource(ResourceDecl),
    Defaults {
        type_name: String,
        params: Vec<ParamExpr>,
    },
    Override {
        target: Expr,
        params: Vec<ParamExpr>,
    },
    Collect(CollectExpr),
    Chain {
        first: RelOperand,
        rest: Vec<(Arrow, RelOperand)>,
    },
    If {
        test: Expr,
        then_block: Block,
        else_block: Option<Block>,
    },
    Case {
        test: Expr,
        options: Vec<CaseOption>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

impl Statement {
    pub fn node_name(&self) -> &'static str {
        match &self.kind {
            StatementKind::Assign { .. } => "assignment",
            StatementKind::Resource(_) => "resource declaration",
            StatementKind::Defaults { .. } => "resource defaults",
            StatementKind::Override { .. } => "resource override",
            StatementKind::Collect(_) => "collection",
            StatementKind::Chain { .. } => "relationship",
            StatementKind::If { .. } => "if statement",
            StatementKind::Case { .. } => "case statement",
            StatementKind::Call { .. } => "function call",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Virtuality {
    Real,
    Virtual,
    Exported,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDecl {
    /// Type as written: `file`, `apache::vhost`, `class`.
    pub type_name: String,
    pub virtuality: Virtuality,
    pub bodies: Vec<ResourceBody>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceBody {
    pub title: Expr,
    pub params: Vec<ParamExpr>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamExpr {
    pub name: String,
    pub value: Expr,
    /// `+>` rather than `=>`.
    pub append: bool,
    pub loc: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectForm {
    Virtual,
    Exported,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectExpr {
    pub type_name: String,
    pub form: CollectForm,
    pub query: Option<QueryExpr>,
    pub overrides: Vec<ParamExpr>,
    pub loc: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryExpr {
    Compare {
        param: String,
        op: QueryOp,
        value: Expr,
    },
    And(Box<QueryExpr>, Box<QueryExpr>),
    Or(Box<QueryExpr>, Box<QueryExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelOperand {
    Resource(ResourceDecl, Location),
    Reference(Expr),
    Collect(CollectExpr),
}

/// Relationship arrows. `->`/`<-` order, `~>`/`<~` also notify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrow {
    Before,
    Notify,
    After,
    NotifiedBy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseOption {
    pub values: Vec<Expr>,
    pub body: Block,
    pub loc: Location,
}

// ============================================================================
// Definitions and manifests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefinitionKind {
    Class,
    Define,
    Node,
}

impl DefinitionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Define => "define",
            Self::Node => "node",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub kind: DefinitionKind,
    /// Lowercased, fully qualified name. Regex nodes get a synthetic name.
    pub name: String,
    /// Source of a regex node name.
    pub regex: Option<String>,
    pub parent: Option<String>,
    pub arguments: IndexMap<String, Option<Expr>>,
    pub body: Arc<Block>,
    pub loc: Location,
    pub doc: Option<String>,
}

/// One parsed source file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub file: Option<Arc<str>>,
    pub statements: Block,
    pub definitions: Vec<Definition>,
    pub imports: Vec<(String, Location)>,
}
