// primitives.rs — Primitive rule table
//
// Maps every operation kind to the rule the expression builder applies to it,
// and primitive names (as spelled by tracers and the interchange format) to
// their arity and family. The name table is built once on first use and is
// read-only afterwards, so concurrent transcriptions may share it.
//
// Preconditions: none.
// Postconditions: `rule` is total over `OpKind`; only `Opaque` is rejected.
// Failure modes: `UnsupportedPrimitiveError` for opaque primitives.
// Side effects: first call to `primitive_table` initializes the static table.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::diag::UnsupportedPrimitiveError;
use crate::expr::{BinOp, Function};
use crate::ir::{Comparison, OpKind, UnaryFn};

// ── Rules ───────────────────────────────────────────────────────────────────

/// How the expression builder treats an operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Representation change with no mathematical content: the node is
    /// replaced by its single operand.
    Elide,
    /// Reshape: elided when it only inserts or drops extent-1 axes.
    Reshape,
    /// Elementwise binary operator.
    Infix(BinOp),
    Negate,
    /// Elementwise named function.
    Call(Function),
    Indicator(Comparison),
    /// Contraction over paired axes (dot products, matrix products).
    Contract,
    /// Summation over axes.
    Reduce,
    /// Axis insertion/expansion: re-indexes the operand only.
    Broadcast,
    /// Axis permutation: re-indexes the operand only.
    Transpose,
    /// Ordered sum of cotangent contributions.
    Accumulate,
}

/// Look up the rule for an operation kind.
pub fn rule(kind: &OpKind) -> Result<Rule, UnsupportedPrimitiveError> {
    let rule = match kind {
        OpKind::Add => Rule::Infix(BinOp::Add),
        OpKind::Sub => Rule::Infix(BinOp::Sub),
        OpKind::Mul => Rule::Infix(BinOp::Mul),
        OpKind::Div => Rule::Infix(BinOp::Div),
        OpKind::Pow => Rule::Infix(BinOp::Pow),
        OpKind::Neg => Rule::Negate,
        OpKind::Relu => Rule::Call(Function::Relu),
        OpKind::Unary(f) => Rule::Call(Function::from(*f)),
        OpKind::Indicator(cmp) => Rule::Indicator(*cmp),
        OpKind::DotGeneral { .. } => Rule::Contract,
        OpKind::ReduceSum { .. } => Rule::Reduce,
        OpKind::Broadcast { .. } => Rule::Broadcast,
        OpKind::Transpose { .. } => Rule::Transpose,
        OpKind::Reshape => Rule::Reshape,
        OpKind::Cast { .. } => Rule::Elide,
        OpKind::AddAny => Rule::Accumulate,
        OpKind::Opaque { name } => return Err(UnsupportedPrimitiveError::new(name.clone())),
    };
    Ok(rule)
}

// ── Name table ──────────────────────────────────────────────────────────────

/// Which `OpKind` constructor a primitive name maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Relu,
    Unary(UnaryFn),
    Indicator(Comparison),
    DotGeneral,
    /// `matmul`/`dot`: a `DotGeneral` whose axes are derived from operand ranks.
    Matmul,
    ReduceSum,
    Broadcast,
    Transpose,
    Reshape,
    Cast,
    AddAny,
}

/// Static metadata about a named primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimitiveSpec {
    pub name: &'static str,
    pub arity: usize,
    pub family: Family,
}

const SPECS: &[PrimitiveSpec] = &[
    PrimitiveSpec { name: "add", arity: 2, family: Family::Add },
    PrimitiveSpec { name: "sub", arity: 2, family: Family::Sub },
    PrimitiveSpec { name: "mul", arity: 2, family: Family::Mul },
    PrimitiveSpec { name: "div", arity: 2, family: Family::Div },
    PrimitiveSpec { name: "pow", arity: 2, family: Family::Pow },
    PrimitiveSpec { name: "neg", arity: 1, family: Family::Neg },
    PrimitiveSpec { name: "relu", arity: 1, family: Family::Relu },
    PrimitiveSpec { name: "exp", arity: 1, family: Family::Unary(UnaryFn::Exp) },
    PrimitiveSpec { name: "log", arity: 1, family: Family::Unary(UnaryFn::Log) },
    PrimitiveSpec { name: "sin", arity: 1, family: Family::Unary(UnaryFn::Sin) },
    PrimitiveSpec { name: "cos", arity: 1, family: Family::Unary(UnaryFn::Cos) },
    PrimitiveSpec { name: "tanh", arity: 1, family: Family::Unary(UnaryFn::Tanh) },
    PrimitiveSpec { name: "sqrt", arity: 1, family: Family::Unary(UnaryFn::Sqrt) },
    PrimitiveSpec { name: "lt", arity: 2, family: Family::Indicator(Comparison::Lt) },
    PrimitiveSpec { name: "le", arity: 2, family: Family::Indicator(Comparison::Le) },
    PrimitiveSpec { name: "gt", arity: 2, family: Family::Indicator(Comparison::Gt) },
    PrimitiveSpec { name: "ge", arity: 2, family: Family::Indicator(Comparison::Ge) },
    PrimitiveSpec { name: "eq", arity: 2, family: Family::Indicator(Comparison::Eq) },
    PrimitiveSpec { name: "ne", arity: 2, family: Family::Indicator(Comparison::Ne) },
    PrimitiveSpec { name: "dot_general", arity: 2, family: Family::DotGeneral },
    PrimitiveSpec { name: "matmul", arity: 2, family: Family::Matmul },
    PrimitiveSpec { name: "dot", arity: 2, family: Family::Matmul },
    PrimitiveSpec { name: "reduce_sum", arity: 1, family: Family::ReduceSum },
    PrimitiveSpec { name: "sum", arity: 1, family: Family::ReduceSum },
    PrimitiveSpec { name: "broadcast_in_dim", arity: 1, family: Family::Broadcast },
    PrimitiveSpec { name: "broadcast", arity: 1, family: Family::Broadcast },
    PrimitiveSpec { name: "transpose", arity: 1, family: Family::Transpose },
    PrimitiveSpec { name: "reshape", arity: 1, family: Family::Reshape },
    PrimitiveSpec { name: "squeeze", arity: 1, family: Family::Reshape },
    PrimitiveSpec { name: "expand_dims", arity: 1, family: Family::Reshape },
    PrimitiveSpec { name: "convert_element_type", arity: 1, family: Family::Cast },
    PrimitiveSpec { name: "cast", arity: 1, family: Family::Cast },
    PrimitiveSpec { name: "add_any", arity: 2, family: Family::AddAny },
];

static TABLE: OnceLock<HashMap<&'static str, PrimitiveSpec>> = OnceLock::new();

/// The process-wide primitive name table.
pub fn primitive_table() -> &'static HashMap<&'static str, PrimitiveSpec> {
    TABLE.get_or_init(|| SPECS.iter().map(|spec| (spec.name, *spec)).collect())
}

/// Look up a primitive by name.
pub fn lookup(name: &str) -> Option<&'static PrimitiveSpec> {
    primitive_table().get(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_named_primitive_has_a_rule() {
        for spec in SPECS {
            let kind = match spec.family {
                Family::Add => OpKind::Add,
                Family::Sub => OpKind::Sub,
                Family::Mul => OpKind::Mul,
                Family::Div => OpKind::Div,
                Family::Pow => OpKind::Pow,
                Family::Neg => OpKind::Neg,
                Family::Relu => OpKind::Relu,
                Family::Unary(f) => OpKind::Unary(f),
                Family::Indicator(c) => OpKind::Indicator(c),
                Family::DotGeneral | Family::Matmul => OpKind::matmul(1, 1),
                Family::ReduceSum => OpKind::ReduceSum { axes: vec![0] },
                Family::Broadcast => OpKind::Broadcast { dims: vec![] },
                Family::Transpose => OpKind::Transpose {
                    permutation: vec![1, 0],
                },
                Family::Reshape => OpKind::Reshape,
                Family::Cast => OpKind::Cast {
                    dtype: "float32".into(),
                },
                Family::AddAny => OpKind::AddAny,
            };
            assert!(rule(&kind).is_ok(), "no rule for {}", spec.name);
        }
    }

    #[test]
    fn opaque_primitives_are_rejected_by_name() {
        let err = rule(&OpKind::Opaque {
            name: "cumsum".into(),
        })
        .unwrap_err();
        assert_eq!(err.primitive, "cumsum");
    }

    #[test]
    fn casts_are_elided() {
        let cast = OpKind::Cast {
            dtype: "float16".into(),
        };
        assert_eq!(rule(&cast).unwrap(), Rule::Elide);
    }

    #[test]
    fn aliases_share_a_family() {
        assert_eq!(lookup("matmul").unwrap().family, lookup("dot").unwrap().family);
        assert_eq!(lookup("sum").unwrap().family, Family::ReduceSum);
        assert!(lookup("cumsum").is_none());
    }

    #[test]
    fn table_is_initialized_once() {
        let a = primitive_table() as *const _;
        let b = primitive_table() as *const _;
        assert_eq!(a, b);
    }
}
