// AST node types for trace scripts (`.tts` files).
//
// Every node carries a `SimpleSpan` so the script loader and the tracer can
// point diagnostics back at the source.
//
// Preconditions: produced by the parser from a valid or partially-valid token stream.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use chumsky::span::SimpleSpan;

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

// ── Root ──

/// A complete script: a sequence of function definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub functions: Vec<FnDef>,
    pub span: Span,
}

// ── fn_def: 'fn' IDENT '(' params? ')' '{' body '}' ──

#[derive(Debug, Clone, PartialEq)]
pub struct FnDef {
    pub name: Ident,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// A formal parameter with its example shape (`x: [3, 4]`; scalar when
/// the annotation is omitted).
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Ident,
    pub shape: Vec<usize>,
    pub span: Span,
}

// ── Statements ──

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `let IDENT = expr`: a local alias, invisible in the output.
    Let { name: Ident, value: Expr },
    /// `return expr (',' expr)*`
    Return(Vec<Expr>),
}

// ── Expressions ──

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Expr { kind, span }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr, span: Span) -> Self {
        Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), span)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Number(f64),
    /// Bracketed list of non-negative integers (`[1, 3]`), used for shapes
    /// and permutations.
    Dims(Vec<usize>),
    Var(Ident),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Ident, Vec<Expr>),
    /// `expr as IDENT ('(' IDENT, ... ')')?`
    Named {
        value: Box<Expr>,
        name: Ident,
        depends_on: Option<Vec<Ident>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    MatMul,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

// ── Leaf types ──

#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}
