// ir.rs — Operation graph captured from a traced function
//
// A flat, topologically ordered arena of values: argument leaves, scalar
// literals, and primitive operations referring to earlier values by id.
// Differentiation transforms add tangent/cotangent nodes to the same arena and
// record what they are the derivative of in `DerivativeTag`s.
//
// Preconditions: none (data-only module).
// Postconditions: `Graph::push` keeps operands strictly before consumers.
// Failure modes: none.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::ValueId;

// ── Shape ───────────────────────────────────────────────────────────────────

/// Array shape: ordered axis extents, empty for scalars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn dim(&self, axis: usize) -> usize {
        self.0[axis]
    }

    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// Axes whose extent is not one, in order.
    pub fn non_singleton_dims(&self) -> Vec<usize> {
        self.0.iter().copied().filter(|&d| d != 1).collect()
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

// ── Operation kinds ─────────────────────────────────────────────────────────

/// Boolean comparison rendered as an indicator condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    pub fn name(self) -> &'static str {
        match self {
            Comparison::Lt => "lt",
            Comparison::Le => "le",
            Comparison::Gt => "gt",
            Comparison::Ge => "ge",
            Comparison::Eq => "eq",
            Comparison::Ne => "ne",
        }
    }
}

/// Elementwise transcendental functions rendered as named calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryFn {
    Exp,
    Log,
    Sin,
    Cos,
    Tanh,
    Sqrt,
}

impl UnaryFn {
    pub fn name(self) -> &'static str {
        match self {
            UnaryFn::Exp => "exp",
            UnaryFn::Log => "log",
            UnaryFn::Sin => "sin",
            UnaryFn::Cos => "cos",
            UnaryFn::Tanh => "tanh",
            UnaryFn::Sqrt => "sqrt",
        }
    }
}

/// Primitive operation kinds.
///
/// Axis parameters follow XLA conventions: `DotGeneral` output axes are batch
/// axes, then lhs free axes, then rhs free axes; `Broadcast` maps operand axis
/// `k` to output axis `dims[k]`; `Transpose` output axis `k` is operand axis
/// `permutation[k]`.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Relu,
    Unary(UnaryFn),
    Indicator(Comparison),
    DotGeneral {
        lhs_contract: Vec<usize>,
        rhs_contract: Vec<usize>,
        lhs_batch: Vec<usize>,
        rhs_batch: Vec<usize>,
    },
    ReduceSum {
        axes: Vec<usize>,
    },
    Broadcast {
        dims: Vec<usize>,
    },
    Transpose {
        permutation: Vec<usize>,
    },
    Reshape,
    Cast {
        dtype: String,
    },
    /// Accumulation of cotangent contributions (reverse mode).
    AddAny,
    /// A primitive the tracer recorded but this crate has no rule for.
    Opaque {
        name: String,
    },
}

impl OpKind {
    /// Canonical primitive name (the interchange spelling).
    pub fn name(&self) -> &str {
        match self {
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Pow => "pow",
            OpKind::Neg => "neg",
            OpKind::Relu => "relu",
            OpKind::Unary(f) => f.name(),
            OpKind::Indicator(c) => c.name(),
            OpKind::DotGeneral { .. } => "dot_general",
            OpKind::ReduceSum { .. } => "reduce_sum",
            OpKind::Broadcast { .. } => "broadcast_in_dim",
            OpKind::Transpose { .. } => "transpose",
            OpKind::Reshape => "reshape",
            OpKind::Cast { .. } => "convert_element_type",
            OpKind::AddAny => "add_any",
            OpKind::Opaque { name } => name,
        }
    }

    /// Product contracting the last lhs axis with rhs's second-to-last axis
    /// (its only axis when rank 1). Batched products need an explicit
    /// `DotGeneral` with batch dimensions.
    pub fn matmul(lhs_rank: usize, rhs_rank: usize) -> OpKind {
        let lhs_axis = lhs_rank.saturating_sub(1);
        let rhs_axis = if rhs_rank >= 2 { rhs_rank - 2 } else { 0 };
        OpKind::DotGeneral {
            lhs_contract: vec![lhs_axis],
            rhs_contract: vec![rhs_axis],
            lhs_batch: Vec::new(),
            rhs_batch: Vec::new(),
        }
    }
}

/// Axes of a `DotGeneral` operand that are neither contracted nor batched,
/// ascending. These become the operand's output axes.
pub fn free_axes(rank: usize, contract: &[usize], batch: &[usize]) -> Vec<usize> {
    (0..rank)
        .filter(|a| !contract.contains(a) && !batch.contains(a))
        .collect()
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ── Values ──────────────────────────────────────────────────────────────────

/// A primitive operation applied to earlier values.
#[derive(Debug, Clone, PartialEq)]
pub struct OpNode {
    pub kind: OpKind,
    pub operands: Vec<ValueId>,
}

/// What a value is.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    /// A function input (primal argument, tangent input, or cotangent seed).
    Leaf,
    /// A scalar constant.
    Literal(f64),
    Op(OpNode),
}

/// A node of the graph together with its output shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub id: ValueId,
    pub kind: ValueKind,
    pub shape: Shape,
}

impl Value {
    pub fn op(&self) -> Option<&OpNode> {
        match &self.kind {
            ValueKind::Op(op) => Some(op),
            _ => None,
        }
    }

    pub fn literal(&self) -> Option<f64> {
        match self.kind {
            ValueKind::Literal(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, ValueKind::Leaf)
    }
}

// ── Derivative tags ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivativeKind {
    /// Forward-mode derivative quantity.
    Tangent,
    /// Reverse-mode (adjoint) quantity.
    Cotangent,
}

/// Records that `value` is the tangent or cotangent of `primal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeTag {
    pub kind: DerivativeKind,
    pub primal: ValueId,
    pub value: ValueId,
}

// ── Graph ───────────────────────────────────────────────────────────────────

/// Topologically ordered value arena.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    values: Vec<Value>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value. Operands must already exist.
    pub fn push(&mut self, kind: ValueKind, shape: Shape) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        if let ValueKind::Op(op) = &kind {
            debug_assert!(op.operands.iter().all(|o| *o < id));
        }
        self.values.push(Value { id, kind, shape });
        id
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    pub fn get(&self, id: ValueId) -> Option<&Value> {
        self.values.get(id.index())
    }

    pub fn shape(&self, id: ValueId) -> &Shape {
        &self.values[id.index()].shape
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Consumers of every value, in graph order.
    pub fn consumers(&self) -> Vec<Vec<ValueId>> {
        let mut out = vec![Vec::new(); self.values.len()];
        for value in &self.values {
            if let ValueKind::Op(op) = &value.kind {
                for operand in &op.operands {
                    if !out[operand.index()].contains(&value.id) {
                        out[operand.index()].push(value.id);
                    }
                }
            }
        }
        out
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for value in &self.values {
            match &value.kind {
                ValueKind::Leaf => writeln!(f, "{} = leaf {}", value.id, value.shape)?,
                ValueKind::Literal(v) => writeln!(f, "{} = literal {}", value.id, v)?,
                ValueKind::Op(op) => {
                    write!(f, "{} = {}", value.id, op.kind)?;
                    for operand in &op.operands {
                        write!(f, " {}", operand)?;
                    }
                    writeln!(f, " : {}", value.shape)?;
                }
            }
        }
        Ok(())
    }
}
