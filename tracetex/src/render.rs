// render.rs — Expression forest to LaTeX text
//
// One `<lhs> = <rhs>` line per equation. Parenthesization is decided from
// the precedence of each child relative to its parent, so the output never
// carries redundant brackets for the operator forms produced by the builder.
//
// Preconditions: none.
// Postconditions: `\left(`/`\right)` and `{`/`}` are balanced in every line.
// Failure modes: none.
// Side effects: none.

use crate::expr::{BinOp, Equation, Expr, Function, SymbolRef};
use crate::ir::Comparison;
use crate::options::TranscribeOptions;

/// Binding strength, loosest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    Sum,
    Product,
    Power,
    Atom,
}

fn prec(expr: &Expr) -> Prec {
    match expr {
        Expr::Literal(v) if *v < 0.0 => Prec::Sum,
        Expr::Literal(_) | Expr::Var(_) | Expr::Call { .. } | Expr::Indicator { .. } => Prec::Atom,
        Expr::Binary { op, .. } => match op {
            BinOp::Add | BinOp::Sub => Prec::Sum,
            BinOp::Mul | BinOp::Div => Prec::Product,
            BinOp::Pow => Prec::Power,
        },
        Expr::Neg(_) => Prec::Sum,
        Expr::Sum { .. } => Prec::Product,
        Expr::Terms(terms) => match terms.as_slice() {
            [single] => prec(single),
            _ => Prec::Sum,
        },
    }
}

fn paren(s: String) -> String {
    format!("\\left({s}\\right)")
}

fn paren_if(cond: bool, s: String) -> String {
    if cond {
        paren(s)
    } else {
        s
    }
}

/// Concatenate two factors. A factor that starts with a digit is set off
/// with a thin space (math mode drops plain spaces, so `x 2 3` would read
/// as `x23`); otherwise a space goes only where two alphanumerics would
/// fuse into one name (`x y`).
fn juxtapose(lhs: &str, rhs: &str) -> String {
    let (Some(last), Some(first)) = (lhs.chars().last(), rhs.chars().next()) else {
        return format!("{lhs}{rhs}");
    };
    if first.is_ascii_digit() {
        format!("{lhs}\\,{rhs}")
    } else if last.is_alphanumeric() && first.is_alphanumeric() {
        format!("{lhs} {rhs}")
    } else {
        format!("{lhs}{rhs}")
    }
}

/// Whether the rendered expression ends in a summation, which would absorb
/// a factor written after it.
fn ends_with_sum(expr: &Expr) -> bool {
    match expr {
        Expr::Sum { .. } => true,
        Expr::Binary {
            op: BinOp::Mul,
            rhs,
            ..
        } => prec(rhs) >= Prec::Product && ends_with_sum(rhs),
        Expr::Terms(terms) => matches!(terms.as_slice(), [single] if ends_with_sum(single)),
        _ => false,
    }
}

/// Integral values print without a decimal point; everything else uses the
/// shortest representation that reads back to the same value.
pub fn format_literal(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

fn comparison(cmp: Comparison) -> &'static str {
    match cmp {
        Comparison::Lt => "<",
        Comparison::Le => "\\leq",
        Comparison::Gt => ">",
        Comparison::Ge => "\\geq",
        Comparison::Eq => "=",
        Comparison::Ne => "\\neq",
    }
}

pub fn render_symbol(r: &SymbolRef) -> String {
    let mut out = r.symbol.name.clone();
    if !r.indices.is_empty() {
        out.push_str("_{");
        for index in &r.indices {
            out.push_str(&index.to_string());
        }
        out.push('}');
    }
    if !r.symbol.deps.is_empty() {
        out.push('(');
        out.push_str(&r.symbol.deps.join(", "));
        out.push(')');
    }
    out
}

pub fn render_expr(expr: &Expr) -> String {
    match expr {
        Expr::Var(r) => render_symbol(r),
        Expr::Literal(v) => format_literal(*v),
        Expr::Binary { op, lhs, rhs } => render_binary(*op, lhs, rhs),
        Expr::Neg(inner) => format!("-{}", paren_if(prec(inner) <= Prec::Sum, render_expr(inner))),
        Expr::Call { func, arg } => {
            let arg = render_expr(arg);
            match func {
                Function::Sqrt => format!("\\sqrt{{{arg}}}"),
                Function::Relu => format!("\\mathrm{{relu}}{}", paren(arg)),
                other => format!("\\{}{}", other.name(), paren(arg)),
            }
        }
        Expr::Indicator { cmp, lhs, rhs } => format!(
            "\\mathbb{{1}}_{{{} {} {}}}",
            render_expr(lhs),
            comparison(*cmp),
            render_expr(rhs)
        ),
        Expr::Sum { indices, body } => {
            let bound: String = indices.iter().map(|i| i.to_string()).collect();
            let body_text = paren_if(prec(body) < Prec::Product, render_expr(body));
            format!("\\sum_{{{bound}}}{body_text}")
        }
        Expr::Terms(terms) => {
            let mut out = String::new();
            for (k, term) in terms.iter().enumerate() {
                let text = render_expr(term);
                if k == 0 {
                    out.push_str(&text);
                } else {
                    out.push_str(" + ");
                    out.push_str(&paren_if(text.starts_with('-'), text));
                }
            }
            out
        }
    }
}

fn render_binary(op: BinOp, lhs: &Expr, rhs: &Expr) -> String {
    match op {
        BinOp::Add => {
            let r = render_expr(rhs);
            format!("{} + {}", render_expr(lhs), paren_if(r.starts_with('-'), r))
        }
        BinOp::Sub => format!(
            "{} - {}",
            render_expr(lhs),
            paren_if(prec(rhs) <= Prec::Sum, render_expr(rhs))
        ),
        BinOp::Mul => {
            // A summation on the left would absorb the right factor.
            let wrap_lhs = prec(lhs) < Prec::Product || ends_with_sum(lhs);
            let l = paren_if(wrap_lhs, render_expr(lhs));
            let r = paren_if(prec(rhs) < Prec::Product, render_expr(rhs));
            juxtapose(&l, &r)
        }
        BinOp::Div => format!("{{{} \\over {}}}", render_expr(lhs), render_expr(rhs)),
        BinOp::Pow => {
            let base = paren_if(prec(lhs) < Prec::Atom, render_expr(lhs));
            format!("{{{base}}}^{{{}}}", render_expr(rhs))
        }
    }
}

pub fn render_equation(eq: &Equation) -> String {
    format!("{} = {}", render_symbol(&eq.lhs), render_expr(&eq.rhs))
}

/// All equations joined by the configured separator.
pub fn render(equations: &[Equation], options: &TranscribeOptions) -> String {
    equations
        .iter()
        .map(render_equation)
        .collect::<Vec<_>>()
        .join(&options.line_separator)
}

/// Wrap rendered equations for display math.
pub fn aligned(text: &str) -> String {
    format!("\\begin{{aligned}}\n{text}\n\\end{{aligned}}")
}
