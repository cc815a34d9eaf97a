// expr.rs — Expression forest produced by the builder, consumed by the renderer
//
// Trees are fully index-annotated: every array reference carries the index
// symbols of its surviving (non-singleton) axes, and summations carry the
// symbols they bind.
//
// Preconditions: none (data-only module).
// Postconditions: none.
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::ir::{Comparison, UnaryFn};

// ── Operators ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinOp {
    pub fn name(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Pow => "pow",
        }
    }
}

/// Named elementwise functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Relu,
    Exp,
    Log,
    Sin,
    Cos,
    Tanh,
    Sqrt,
}

impl From<UnaryFn> for Function {
    fn from(f: UnaryFn) -> Self {
        match f {
            UnaryFn::Exp => Function::Exp,
            UnaryFn::Log => Function::Log,
            UnaryFn::Sin => Function::Sin,
            UnaryFn::Cos => Function::Cos,
            UnaryFn::Tanh => Function::Tanh,
            UnaryFn::Sqrt => Function::Sqrt,
        }
    }
}

impl Function {
    pub fn name(self) -> &'static str {
        match self {
            Function::Relu => "relu",
            Function::Exp => "exp",
            Function::Log => "log",
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tanh => "tanh",
            Function::Sqrt => "sqrt",
        }
    }
}

// ── Index symbols ───────────────────────────────────────────────────────────

/// An index symbol: a letter plus a number of primes (`i`, `j'`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Index {
    pub letter: char,
    pub primes: u8,
}

impl Index {
    pub fn new(letter: char) -> Self {
        Index { letter, primes: 0 }
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter)?;
        for _ in 0..self.primes {
            write!(f, "'")?;
        }
        Ok(())
    }
}

// ── Symbols ─────────────────────────────────────────────────────────────────

/// A display symbol: base name plus optional dependency arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub name: String,
    pub deps: Vec<String>,
}

impl Symbol {
    pub fn plain(name: impl Into<String>) -> Self {
        Symbol {
            name: name.into(),
            deps: Vec::new(),
        }
    }

    pub fn with_deps(name: impl Into<String>, deps: Vec<String>) -> Self {
        Symbol {
            name: name.into(),
            deps,
        }
    }

    /// The same symbol with a derivative prefix on the base name.
    pub fn prefixed(&self, prefix: &str) -> Self {
        Symbol {
            name: format!("{prefix}{}", self.name),
            deps: self.deps.clone(),
        }
    }
}

/// A symbol applied to index symbols (one per surviving axis).
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolRef {
    pub symbol: Symbol,
    pub indices: Vec<Index>,
}

impl fmt::Display for SymbolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol.name)?;
        if !self.indices.is_empty() {
            write!(f, "[")?;
            for index in &self.indices {
                write!(f, "{index}")?;
            }
            write!(f, "]")?;
        }
        if !self.symbol.deps.is_empty() {
            write!(f, "({})", self.symbol.deps.join(", "))?;
        }
        Ok(())
    }
}

// ── Expressions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Var(SymbolRef),
    Literal(f64),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Neg(Box<Expr>),
    Call {
        func: Function,
        arg: Box<Expr>,
    },
    Indicator {
        cmp: Comparison,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Explicit summation binding `indices` over `body`.
    Sum {
        indices: Vec<Index>,
        body: Box<Expr>,
    },
    /// Ordered additive contributions (accumulated cotangents).
    Terms(Vec<Expr>),
}

impl Expr {
    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Number of additive terms at the top level.
    pub fn term_count(&self) -> usize {
        match self {
            Expr::Terms(terms) => terms.len(),
            Expr::Binary {
                op: BinOp::Add | BinOp::Sub,
                lhs,
                ..
            } => lhs.term_count() + 1,
            _ => 1,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Var(var) => write!(f, "{var}"),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Binary { op, lhs, rhs } => write!(f, "({} {} {})", op.name(), lhs, rhs),
            Expr::Neg(inner) => write!(f, "(neg {inner})"),
            Expr::Call { func, arg } => write!(f, "({} {})", func.name(), arg),
            Expr::Indicator { cmp, lhs, rhs } => {
                write!(f, "(indicator {} {} {})", cmp.name(), lhs, rhs)
            }
            Expr::Sum { indices, body } => {
                write!(f, "(sum [")?;
                for index in indices {
                    write!(f, "{index}")?;
                }
                write!(f, "] {body})")
            }
            Expr::Terms(terms) => {
                write!(f, "(terms")?;
                for term in terms {
                    write!(f, " {term}")?;
                }
                write!(f, ")")
            }
        }
    }
}

// ── Program ─────────────────────────────────────────────────────────────────

/// Why an equation is part of the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquationKind {
    /// A user-named intermediate.
    Binding,
    /// Tangent or cotangent of a named intermediate.
    Derivative,
    /// A return value of the function.
    Output,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Equation {
    pub kind: EquationKind,
    pub lhs: SymbolRef,
    pub rhs: Expr,
}

/// Ordered equations: bindings, derivative equations, then outputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub equations: Vec<Equation>,
}

impl Program {
    pub fn outputs(&self) -> impl Iterator<Item = &Equation> {
        self.equations
            .iter()
            .filter(|eq| eq.kind == EquationKind::Output)
    }

    /// First equation whose left-hand side has the given base name.
    pub fn equation(&self, name: &str) -> Option<&Equation> {
        self.equations.iter().find(|eq| eq.lhs.symbol.name == name)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for eq in &self.equations {
            writeln!(f, "{} = {}", eq.lhs, eq.rhs)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Expr {
        Expr::Var(SymbolRef {
            symbol: Symbol::plain(name),
            indices: vec![],
        })
    }

    #[test]
    fn display_is_s_expression() {
        let e = Expr::binary(BinOp::Mul, var("x"), Expr::Neg(Box::new(var("y"))));
        assert_eq!(e.to_string(), "(mul x (neg y))");
    }

    #[test]
    fn symbol_ref_display_includes_indices_and_deps() {
        let r = SymbolRef {
            symbol: Symbol::with_deps("z", vec!["x".into(), "y".into()]),
            indices: vec![Index::new('i'), Index { letter: 'j', primes: 1 }],
        };
        assert_eq!(r.to_string(), "z[ij'](x, y)");
    }

    #[test]
    fn term_count_flattens_left_nested_sums() {
        let e = Expr::binary(
            BinOp::Add,
            Expr::binary(BinOp::Sub, var("a"), var("b")),
            var("c"),
        );
        assert_eq!(e.term_count(), 3);
        assert_eq!(Expr::Terms(vec![var("a"), var("b")]).term_count(), 2);
        assert_eq!(var("a").term_count(), 1);
    }

    #[test]
    fn prefixed_keeps_dependencies() {
        let s = Symbol::with_deps("z", vec!["x".into()]).prefixed("d");
        assert_eq!(s.name, "dz");
        assert_eq!(s.deps, vec!["x".to_string()]);
    }
}
