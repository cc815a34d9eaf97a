// trace.rs — Symbolic tracer, traceable functions, and trace interchange
//
// A `Tracer` records every arithmetic operation performed on its `Traced`
// handles into a flat operation graph. No numeric values are ever computed;
// only shapes are propagated and checked.
//
// Preconditions: handles passed to a tracer were created by that tracer.
// Postconditions: `Tracer::finish` returns a graph whose operands precede
//   their consumers, or the first capture error.
// Failure modes: shape mismatches, bad axes, invalid bindings and malformed
//   imports are `TraceCaptureError`s. Operator overloads cannot return
//   `Result`, so the first error poisons the tracer and later operations
//   produce placeholder values until `finish` reports it.
// Side effects: none.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::binder::{Argument, Binder, Binding};
use crate::diag::TraceCaptureError;
use crate::id::ValueId;
use crate::ir::{
    free_axes, Comparison, DerivativeKind, DerivativeTag, Graph, OpKind, OpNode, Shape, UnaryFn,
    ValueKind,
};
use crate::primitives::{lookup, Family};

// ── Trace ───────────────────────────────────────────────────────────────────

/// A captured function: its graph, inputs, user annotations, and outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub name: String,
    pub graph: Graph,
    /// Function inputs in call order.
    pub arguments: Vec<Argument>,
    pub bindings: Vec<Binding>,
    pub tags: Vec<DerivativeTag>,
    pub outputs: Vec<ValueId>,
}

impl Trace {
    /// The first derivative tag attached to `value` (what it was created as).
    pub fn tag_of(&self, value: ValueId) -> Option<&DerivativeTag> {
        self.tags.iter().find(|t| t.value == value)
    }

    /// The last derivative tag attached to `value` (what it was finally
    /// used as, e.g. the cotangent of an argument).
    pub fn last_tag_of(&self, value: ValueId) -> Option<&DerivativeTag> {
        self.tags.iter().rev().find(|t| t.value == value)
    }

    /// Position of the argument with the given formal name.
    pub fn argument_position(&self, name: &str) -> Option<usize> {
        self.arguments
            .iter()
            .position(|a| a.name.as_deref() == Some(name))
    }

    pub fn argument_shapes(&self) -> Vec<Shape> {
        self.arguments
            .iter()
            .map(|a| self.graph.shape(a.value).clone())
            .collect()
    }
}

// ── Shape rules ─────────────────────────────────────────────────────────────

/// Numpy-style broadcast of two shapes (trailing axes aligned).
pub fn broadcast_shapes(a: &Shape, b: &Shape) -> Result<Shape, String> {
    let rank = a.rank().max(b.rank());
    let mut dims = Vec::with_capacity(rank);
    for axis in 0..rank {
        let da = dim_from_end(a, rank - axis);
        let db = dim_from_end(b, rank - axis);
        let d = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return Err(format!("cannot broadcast shapes {a} and {b}")),
        };
        dims.push(d);
    }
    Ok(Shape(dims))
}

fn dim_from_end(shape: &Shape, from_end: usize) -> usize {
    if from_end > shape.rank() {
        1
    } else {
        shape.dim(shape.rank() - from_end)
    }
}

/// Output shape of an operation whose shape follows from its operands.
///
/// `Broadcast` and `Reshape` carry their target shape separately and are
/// checked with [`check_broadcast`] and [`check_reshape`].
pub fn infer_shape(kind: &OpKind, operands: &[&Shape]) -> Result<Shape, String> {
    let expect = |n: usize| -> Result<(), String> {
        if operands.len() == n {
            Ok(())
        } else {
            Err(format!(
                "`{}` takes {} operand(s), got {}",
                kind.name(),
                n,
                operands.len()
            ))
        }
    };
    match kind {
        OpKind::Add
        | OpKind::Sub
        | OpKind::Mul
        | OpKind::Div
        | OpKind::Pow
        | OpKind::Indicator(_)
        | OpKind::AddAny => {
            expect(2)?;
            broadcast_shapes(operands[0], operands[1])
        }
        OpKind::Neg | OpKind::Relu | OpKind::Unary(_) | OpKind::Cast { .. } => {
            expect(1)?;
            Ok(operands[0].clone())
        }
        OpKind::DotGeneral {
            lhs_contract,
            rhs_contract,
            lhs_batch,
            rhs_batch,
        } => {
            expect(2)?;
            dot_general_shape(
                operands[0],
                operands[1],
                lhs_contract,
                rhs_contract,
                lhs_batch,
                rhs_batch,
            )
        }
        OpKind::ReduceSum { axes } => {
            expect(1)?;
            let operand = operands[0];
            check_axes(axes, operand.rank(), "reduce_sum")?;
            Ok(Shape(
                (0..operand.rank())
                    .filter(|a| !axes.contains(a))
                    .map(|a| operand.dim(a))
                    .collect(),
            ))
        }
        OpKind::Transpose { permutation } => {
            expect(1)?;
            let operand = operands[0];
            if permutation.len() != operand.rank() {
                return Err(format!(
                    "transpose permutation {:?} does not match rank {}",
                    permutation,
                    operand.rank()
                ));
            }
            check_axes(permutation, operand.rank(), "transpose")?;
            Ok(Shape(permutation.iter().map(|&a| operand.dim(a)).collect()))
        }
        OpKind::Broadcast { .. } | OpKind::Reshape => Err(format!(
            "`{}` needs an explicit output shape",
            kind.name()
        )),
        OpKind::Opaque { .. } => Ok(operands.first().map(|s| (*s).clone()).unwrap_or_default()),
    }
}

fn check_axes(axes: &[usize], rank: usize, what: &str) -> Result<(), String> {
    for (i, &a) in axes.iter().enumerate() {
        if a >= rank {
            return Err(format!("{what}: axis {a} out of range for rank {rank}"));
        }
        if axes[..i].contains(&a) {
            return Err(format!("{what}: axis {a} repeated"));
        }
    }
    Ok(())
}

fn dot_general_shape(
    lhs: &Shape,
    rhs: &Shape,
    lhs_contract: &[usize],
    rhs_contract: &[usize],
    lhs_batch: &[usize],
    rhs_batch: &[usize],
) -> Result<Shape, String> {
    if lhs_contract.len() != rhs_contract.len() || lhs_batch.len() != rhs_batch.len() {
        return Err("dot_general: lhs and rhs axis lists differ in length".to_string());
    }
    let lhs_axes: Vec<usize> = lhs_contract.iter().chain(lhs_batch).copied().collect();
    let rhs_axes: Vec<usize> = rhs_contract.iter().chain(rhs_batch).copied().collect();
    check_axes(&lhs_axes, lhs.rank(), "dot_general")?;
    check_axes(&rhs_axes, rhs.rank(), "dot_general")?;
    for (&l, &r) in lhs_axes.iter().zip(&rhs_axes) {
        if lhs.dim(l) != rhs.dim(r) {
            return Err(format!(
                "dot_general: lhs axis {l} (extent {}) does not match rhs axis {r} (extent {}) for shapes {lhs} and {rhs}",
                lhs.dim(l),
                rhs.dim(r)
            ));
        }
    }
    let mut dims: Vec<usize> = lhs_batch.iter().map(|&a| lhs.dim(a)).collect();
    dims.extend(
        free_axes(lhs.rank(), lhs_contract, lhs_batch)
            .into_iter()
            .map(|a| lhs.dim(a)),
    );
    dims.extend(
        free_axes(rhs.rank(), rhs_contract, rhs_batch)
            .into_iter()
            .map(|a| rhs.dim(a)),
    );
    Ok(Shape(dims))
}

/// `broadcast_in_dim`: operand axis `k` maps to target axis `dims[k]`.
pub fn check_broadcast(operand: &Shape, dims: &[usize], target: &Shape) -> Result<(), String> {
    if dims.len() != operand.rank() {
        return Err(format!(
            "broadcast: {} dims given for operand of rank {}",
            dims.len(),
            operand.rank()
        ));
    }
    for (k, &d) in dims.iter().enumerate() {
        if d >= target.rank() || (k > 0 && dims[k - 1] >= d) {
            return Err(format!("broadcast: invalid dims {dims:?} for target {target}"));
        }
        let extent = operand.dim(k);
        if extent != 1 && extent != target.dim(d) {
            return Err(format!("cannot broadcast {operand} to {target}"));
        }
    }
    Ok(())
}

pub fn check_reshape(operand: &Shape, target: &Shape) -> Result<(), String> {
    let count = |s: &Shape| s.dims().iter().product::<usize>();
    if count(operand) != count(target) {
        return Err(format!("cannot reshape {operand} to {target}"));
    }
    Ok(())
}

/// Broadcast dims aligning a rank-`rank` operand with the trailing axes of a
/// rank-`out_rank` result.
pub fn trailing_dims(rank: usize, out_rank: usize) -> Vec<usize> {
    (out_rank - rank..out_rank).collect()
}

// ── Tracer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct TracerState {
    graph: Graph,
    arguments: Vec<Argument>,
    binder: Binder,
    tags: Vec<DerivativeTag>,
    error: Option<TraceCaptureError>,
}

/// Records operations on [`Traced`] handles.
#[derive(Debug, Default)]
pub struct Tracer {
    state: RefCell<TracerState>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue recording on top of an existing trace (used by
    /// differentiation transforms). Bindings are revalidated.
    pub fn resume(trace: Trace) -> Result<Self, TraceCaptureError> {
        let binder = Binder::replay(&trace.graph, &trace.bindings)?;
        Ok(Tracer {
            state: RefCell::new(TracerState {
                graph: trace.graph,
                arguments: trace.arguments,
                binder,
                tags: trace.tags,
                error: None,
            }),
        })
    }

    /// Add a function input.
    pub fn argument(&self, shape: impl Into<Shape>, name: Option<&str>) -> Traced<'_> {
        let mut st = self.state.borrow_mut();
        let value = st.graph.push(ValueKind::Leaf, shape.into());
        st.arguments.push(Argument {
            value,
            name: name.map(str::to_string),
            derivative: false,
        });
        Traced::new(self, value)
    }

    /// Add a tangent or cotangent input for `primal` (shaped like it) and
    /// tag it accordingly.
    pub fn derivative_input(&self, kind: DerivativeKind, primal: ValueId) -> Traced<'_> {
        let shape = self.shape(primal);
        let value = {
            let mut st = self.state.borrow_mut();
            let value = st.graph.push(ValueKind::Leaf, shape);
            st.arguments.push(Argument {
                value,
                name: None,
                derivative: true,
            });
            value
        };
        self.tag(kind, primal, value);
        Traced::new(self, value)
    }

    /// A scalar constant.
    pub fn literal(&self, value: f64) -> Traced<'_> {
        let id = self
            .state
            .borrow_mut()
            .graph
            .push(ValueKind::Literal(value), Shape::scalar());
        Traced::new(self, id)
    }

    /// Handle to a value already in the graph.
    pub fn value(&self, id: ValueId) -> Traced<'_> {
        Traced::new(self, id)
    }

    pub fn shape(&self, id: ValueId) -> Shape {
        self.state
            .borrow()
            .graph
            .get(id)
            .map(|v| v.shape.clone())
            .unwrap_or_default()
    }

    /// The literal value of `id`, if it is a literal.
    pub fn literal_value(&self, id: ValueId) -> Option<f64> {
        self.state.borrow().graph.get(id).and_then(|v| v.literal())
    }

    /// The operation that produced `id`, if any.
    pub fn op(&self, id: ValueId) -> Option<OpNode> {
        self.state
            .borrow()
            .graph
            .get(id)
            .and_then(|v| v.op().cloned())
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.borrow().error.is_some()
    }

    /// Record a capture error (only the first is kept) and return a
    /// placeholder value so tracing can continue.
    pub fn fail(&self, message: impl Into<String>) -> Traced<'_> {
        {
            let mut st = self.state.borrow_mut();
            if st.error.is_none() {
                let message = message.into();
                debug!(%message, "trace poisoned");
                st.error = Some(TraceCaptureError::new(message));
            }
        }
        self.literal(0.0)
    }

    /// Record that `value` is the tangent or cotangent of `primal`.
    pub fn tag(&self, kind: DerivativeKind, primal: ValueId, value: ValueId) {
        let mut st = self.state.borrow_mut();
        let tag = DerivativeTag {
            kind,
            primal,
            value,
        };
        if !st.tags.contains(&tag) {
            st.tags.push(tag);
        }
    }

    /// Give `value` a display name, optionally declaring which arguments or
    /// named values it depends on. Returns the same value.
    pub fn named<'t>(
        &'t self,
        value: Traced<'t>,
        name: &str,
        depends_on: Option<&[Traced<'t>]>,
    ) -> Traced<'t> {
        let deps = depends_on.map(|ds| ds.iter().map(|d| d.id).collect());
        let result = {
            let mut st = self.state.borrow_mut();
            let TracerState { graph, binder, .. } = &mut *st;
            binder.bind(graph, value.id, name, deps)
        };
        if let Err(err) = result {
            self.fail(err.message);
        }
        value
    }

    /// Record a primitive by name. Known names dispatch to the matching
    /// operation with default parameters; unknown names are recorded as
    /// opaque operations, which fail at transcription time.
    pub fn primitive<'t>(&'t self, name: &str, operands: &[Traced<'t>]) -> Traced<'t> {
        let Some(spec) = lookup(name) else {
            let ids = operands.iter().map(|o| o.id).collect();
            return self.push(
                OpKind::Opaque {
                    name: name.to_string(),
                },
                ids,
            );
        };
        if operands.len() != spec.arity {
            return self.fail(format!(
                "`{name}` takes {} operand(s), got {}",
                spec.arity,
                operands.len()
            ));
        }
        let a = operands[0];
        let b = || operands[1];
        match spec.family {
            Family::Add => self.elementwise(OpKind::Add, a, b()),
            Family::Sub => self.elementwise(OpKind::Sub, a, b()),
            Family::Mul => self.elementwise(OpKind::Mul, a, b()),
            Family::Div => self.elementwise(OpKind::Div, a, b()),
            Family::Pow => self.elementwise(OpKind::Pow, a, b()),
            Family::AddAny => self.elementwise(OpKind::AddAny, a, b()),
            Family::Indicator(cmp) => self.elementwise(OpKind::Indicator(cmp), a, b()),
            Family::Neg => -a,
            Family::Relu => a.relu(),
            Family::Unary(f) => self.push(OpKind::Unary(f), vec![a.id]),
            Family::DotGeneral | Family::Matmul => a.matmul(b()),
            Family::ReduceSum => a.sum_all(),
            Family::Transpose => {
                let rank = a.shape().rank();
                let permutation: Vec<usize> = (0..rank).rev().collect();
                a.transpose(&permutation)
            }
            Family::Cast => a.cast("float32"),
            Family::Broadcast | Family::Reshape => {
                self.fail(format!("`{name}` needs a target shape"))
            }
        }
    }

    /// Push an operation whose shape follows from its operands.
    pub(crate) fn push<'t>(&'t self, kind: OpKind, operands: Vec<ValueId>) -> Traced<'t> {
        let shape = {
            let st = self.state.borrow();
            let shapes: Vec<&Shape> = operands.iter().map(|o| st.graph.shape(*o)).collect();
            infer_shape(&kind, &shapes)
        };
        match shape {
            Ok(shape) => self.push_shaped(kind, operands, shape),
            Err(message) => self.fail(message),
        }
    }

    pub(crate) fn push_shaped<'t>(
        &'t self,
        kind: OpKind,
        operands: Vec<ValueId>,
        shape: Shape,
    ) -> Traced<'t> {
        let id = self
            .state
            .borrow_mut()
            .graph
            .push(ValueKind::Op(OpNode { kind, operands }), shape);
        Traced::new(self, id)
    }

    /// Elementwise binary operation with numpy-style broadcasting. Array
    /// operands whose shape differs from the result get an explicit
    /// `broadcast_in_dim`; scalar literals are used as-is.
    pub(crate) fn elementwise<'t>(&'t self, kind: OpKind, a: Traced<'t>, b: Traced<'t>) -> Traced<'t> {
        let (sa, sb) = (a.shape(), b.shape());
        let out = match broadcast_shapes(&sa, &sb) {
            Ok(out) => out,
            Err(message) => return self.fail(format!("{}: {message}", kind.name())),
        };
        let a = self.broadcast_operand(a, &sa, &out);
        let b = self.broadcast_operand(b, &sb, &out);
        self.push_shaped(kind, vec![a.id, b.id], out)
    }

    fn broadcast_operand<'t>(&'t self, v: Traced<'t>, shape: &Shape, out: &Shape) -> Traced<'t> {
        if shape == out || self.literal_value(v.id).is_some() {
            return v;
        }
        let dims = trailing_dims(shape.rank(), out.rank());
        self.push_shaped(OpKind::Broadcast { dims }, vec![v.id], out.clone())
    }

    /// Close the trace. `outputs` must be values of this tracer.
    pub fn finish(self, name: &str, outputs: Vec<ValueId>) -> Result<Trace, TraceCaptureError> {
        let st = self.state.into_inner();
        if let Some(err) = st.error {
            return Err(err);
        }
        if outputs.is_empty() {
            return Err(TraceCaptureError::new(format!(
                "function `{name}` returned no values"
            )));
        }
        if let Some(bad) = outputs.iter().find(|o| st.graph.get(**o).is_none()) {
            return Err(TraceCaptureError::new(format!(
                "output {bad} is not a value of this trace"
            )));
        }
        debug!(function = name, values = st.graph.len(), "trace captured");
        Ok(Trace {
            name: name.to_string(),
            graph: st.graph,
            arguments: st.arguments,
            bindings: st.binder.into_bindings(),
            tags: st.tags,
            outputs,
        })
    }
}

// ── Traced values ───────────────────────────────────────────────────────────

/// A value being traced: a cheap handle into its [`Tracer`].
#[derive(Debug, Clone, Copy)]
pub struct Traced<'t> {
    tracer: &'t Tracer,
    id: ValueId,
}

/// Anything usable as an operand: traced values and scalar constants.
pub trait Operand<'t> {
    fn into_traced(self, tracer: &'t Tracer) -> Traced<'t>;
}

impl<'t> Operand<'t> for Traced<'t> {
    fn into_traced(self, _tracer: &'t Tracer) -> Traced<'t> {
        self
    }
}

impl<'t> Operand<'t> for f64 {
    fn into_traced(self, tracer: &'t Tracer) -> Traced<'t> {
        tracer.literal(self)
    }
}

impl<'t> Traced<'t> {
    fn new(tracer: &'t Tracer, id: ValueId) -> Self {
        Traced { tracer, id }
    }

    pub fn id(self) -> ValueId {
        self.id
    }

    pub fn tracer(self) -> &'t Tracer {
        self.tracer
    }

    pub fn shape(self) -> Shape {
        self.tracer.shape(self.id)
    }

    pub fn named(self, name: &str, depends_on: Option<&[Traced<'t>]>) -> Self {
        self.tracer.named(self, name, depends_on)
    }

    pub fn pow(self, exponent: impl Operand<'t>) -> Self {
        let exponent = exponent.into_traced(self.tracer);
        self.tracer.elementwise(OpKind::Pow, self, exponent)
    }

    pub fn powf(self, exponent: f64) -> Self {
        self.pow(exponent)
    }

    /// Matrix product: contracts the last axis of `self` with the
    /// second-to-last axis of `rhs` (its only axis when `rhs` is a vector).
    pub fn matmul(self, rhs: Traced<'t>) -> Self {
        let (lr, rr) = (self.shape().rank(), rhs.shape().rank());
        if lr == 0 || rr == 0 {
            return self.tracer.fail("matmul: operands must have rank at least 1");
        }
        self.tracer.push(OpKind::matmul(lr, rr), vec![self.id, rhs.id])
    }

    pub fn dot_general(
        self,
        rhs: Traced<'t>,
        lhs_contract: &[usize],
        rhs_contract: &[usize],
        lhs_batch: &[usize],
        rhs_batch: &[usize],
    ) -> Self {
        self.tracer.push(
            OpKind::DotGeneral {
                lhs_contract: lhs_contract.to_vec(),
                rhs_contract: rhs_contract.to_vec(),
                lhs_batch: lhs_batch.to_vec(),
                rhs_batch: rhs_batch.to_vec(),
            },
            vec![self.id, rhs.id],
        )
    }

    /// Sum over `axes`, removing them.
    pub fn sum(self, axes: &[usize]) -> Self {
        self.tracer.push(
            OpKind::ReduceSum {
                axes: axes.to_vec(),
            },
            vec![self.id],
        )
    }

    pub fn sum_all(self) -> Self {
        let axes: Vec<usize> = (0..self.shape().rank()).collect();
        self.sum(&axes)
    }

    /// Permute axes: output axis `k` is input axis `permutation[k]`.
    pub fn transpose(self, permutation: &[usize]) -> Self {
        self.tracer.push(
            OpKind::Transpose {
                permutation: permutation.to_vec(),
            },
            vec![self.id],
        )
    }

    pub fn reshape(self, shape: impl Into<Shape>) -> Self {
        let target = shape.into();
        if let Err(message) = check_reshape(&self.shape(), &target) {
            return self.tracer.fail(message);
        }
        self.tracer.push_shaped(OpKind::Reshape, vec![self.id], target)
    }

    /// Numpy-style broadcast to `shape` (trailing axes aligned).
    pub fn broadcast_to(self, shape: impl Into<Shape>) -> Self {
        let target = shape.into();
        let own = self.shape();
        if target.rank() < own.rank() {
            return self.tracer.fail(format!("cannot broadcast {own} to {target}"));
        }
        let dims = trailing_dims(own.rank(), target.rank());
        if let Err(message) = check_broadcast(&own, &dims, &target) {
            return self.tracer.fail(message);
        }
        self.tracer
            .push_shaped(OpKind::Broadcast { dims }, vec![self.id], target)
    }

    pub fn cast(self, dtype: &str) -> Self {
        self.tracer.push(
            OpKind::Cast {
                dtype: dtype.to_string(),
            },
            vec![self.id],
        )
    }

    pub fn relu(self) -> Self {
        self.tracer.push(OpKind::Relu, vec![self.id])
    }

    fn unary(self, f: UnaryFn) -> Self {
        self.tracer.push(OpKind::Unary(f), vec![self.id])
    }

    pub fn exp(self) -> Self {
        self.unary(UnaryFn::Exp)
    }

    pub fn log(self) -> Self {
        self.unary(UnaryFn::Log)
    }

    pub fn sin(self) -> Self {
        self.unary(UnaryFn::Sin)
    }

    pub fn cos(self) -> Self {
        self.unary(UnaryFn::Cos)
    }

    pub fn tanh(self) -> Self {
        self.unary(UnaryFn::Tanh)
    }

    pub fn sqrt(self) -> Self {
        self.unary(UnaryFn::Sqrt)
    }

    /// Indicator of an elementwise comparison (1 where it holds, else 0).
    pub fn compare(self, cmp: Comparison, other: impl Operand<'t>) -> Self {
        let other = other.into_traced(self.tracer);
        self.tracer.elementwise(OpKind::Indicator(cmp), self, other)
    }

    pub fn lt(self, other: impl Operand<'t>) -> Self {
        self.compare(Comparison::Lt, other)
    }

    pub fn le(self, other: impl Operand<'t>) -> Self {
        self.compare(Comparison::Le, other)
    }

    pub fn gt(self, other: impl Operand<'t>) -> Self {
        self.compare(Comparison::Gt, other)
    }

    pub fn ge(self, other: impl Operand<'t>) -> Self {
        self.compare(Comparison::Ge, other)
    }

    pub fn eq(self, other: impl Operand<'t>) -> Self {
        self.compare(Comparison::Eq, other)
    }

    pub fn ne(self, other: impl Operand<'t>) -> Self {
        self.compare(Comparison::Ne, other)
    }
}

macro_rules! binary_operator {
    ($op:ident, $method:ident, $kind:expr) => {
        impl<'t, R: Operand<'t>> $op<R> for Traced<'t> {
            type Output = Traced<'t>;

            fn $method(self, rhs: R) -> Traced<'t> {
                let rhs = rhs.into_traced(self.tracer);
                self.tracer.elementwise($kind, self, rhs)
            }
        }

        impl<'t> $op<Traced<'t>> for f64 {
            type Output = Traced<'t>;

            fn $method(self, rhs: Traced<'t>) -> Traced<'t> {
                let lhs = rhs.tracer.literal(self);
                rhs.tracer.elementwise($kind, lhs, rhs)
            }
        }
    };
}

binary_operator!(Add, add, OpKind::Add);
binary_operator!(Sub, sub, OpKind::Sub);
binary_operator!(Mul, mul, OpKind::Mul);
binary_operator!(Div, div, OpKind::Div);

impl<'t> Neg for Traced<'t> {
    type Output = Traced<'t>;

    fn neg(self) -> Traced<'t> {
        self.tracer.push(OpKind::Neg, vec![self.id])
    }
}

// ── Traceable functions ─────────────────────────────────────────────────────

type Body = dyn for<'t> Fn(&'t Tracer, &[Traced<'t>]) -> Vec<Traced<'t>>;

/// Something that can be traced into a [`Trace`] from example shapes.
pub trait Traceable {
    fn name(&self) -> &str;

    /// Trace the function for arguments of the given shapes.
    fn capture(&self, example: &[Shape]) -> Result<Trace, TraceCaptureError>;
}

/// A traceable function: a name, optional formal parameter names, and a body
/// that records operations on its arguments.
#[derive(Clone)]
pub struct Function {
    name: String,
    arg_names: Option<Vec<String>>,
    body: Rc<Body>,
}

impl Function {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: for<'t> Fn(&'t Tracer, &[Traced<'t>]) -> Vec<Traced<'t>> + 'static,
    {
        Function {
            name: name.into(),
            arg_names: None,
            body: Rc::new(body),
        }
    }

    pub fn arg_names(&self) -> Option<&[String]> {
        self.arg_names.as_deref()
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("arg_names", &self.arg_names)
            .finish_non_exhaustive()
    }
}

/// Bind `value` to a display name; see [`Tracer::named`].
pub fn named<'t>(value: Traced<'t>, name: &str, depends_on: Option<&[Traced<'t>]>) -> Traced<'t> {
    value.tracer.named(value, name, depends_on)
}

/// Associate formal parameter names with `function`'s arguments, so leaves
/// render with those names instead of positional placeholders.
pub fn with_argument_names(mut function: Function, names: &[&str]) -> Function {
    function.arg_names = Some(names.iter().map(|n| n.to_string()).collect());
    function
}

impl Traceable for Function {
    fn name(&self) -> &str {
        &self.name
    }

    fn capture(&self, example: &[Shape]) -> Result<Trace, TraceCaptureError> {
        if let Some(names) = &self.arg_names {
            if names.len() != example.len() {
                return Err(TraceCaptureError::new(format!(
                    "function `{}` declares {} argument name(s) but was traced with {} argument(s)",
                    self.name,
                    names.len(),
                    example.len()
                )));
            }
        }
        let tracer = Tracer::new();
        let outputs: Vec<ValueId> = {
            let args: Vec<Traced<'_>> = example
                .iter()
                .enumerate()
                .map(|(i, shape)| {
                    let name = self
                        .arg_names
                        .as_ref()
                        .and_then(|names| names.get(i))
                        .map(String::as_str);
                    tracer.argument(shape.clone(), name)
                })
                .collect();
            (self.body)(&tracer, &args).iter().map(|v| v.id()).collect()
        };
        tracer.finish(&self.name, outputs)
    }
}

/// Trace `function` for arguments of the given shapes.
pub fn capture<F: Traceable + ?Sized>(
    function: &F,
    example: &[Shape],
) -> Result<Trace, TraceCaptureError> {
    function.capture(example)
}

// ── JSON interchange ────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct RawTrace {
    name: String,
    arguments: Vec<Argument>,
    values: Vec<RawValue>,
    #[serde(default)]
    bindings: Vec<RawBinding>,
    #[serde(default)]
    tags: Vec<DerivativeTag>,
    outputs: Vec<ValueId>,
}

#[derive(Serialize, Deserialize)]
struct RawBinding {
    name: String,
    value: ValueId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    depends_on: Option<Vec<ValueId>>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawValue {
    Leaf {
        id: ValueId,
        shape: Shape,
    },
    Literal {
        id: ValueId,
        value: f64,
    },
    Op {
        id: ValueId,
        primitive: String,
        operands: Vec<ValueId>,
        shape: Shape,
        #[serde(default, skip_serializing_if = "Params::is_empty")]
        params: Params,
    },
}

impl RawValue {
    fn id(&self) -> ValueId {
        match self {
            RawValue::Leaf { id, .. } | RawValue::Literal { id, .. } | RawValue::Op { id, .. } => {
                *id
            }
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Params {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lhs_contract: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rhs_contract: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lhs_batch: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rhs_batch: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    axes: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dims: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    permutation: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dtype: Option<String>,
}

impl Params {
    fn is_empty(&self) -> bool {
        self.lhs_contract.is_none()
            && self.rhs_contract.is_none()
            && self.lhs_batch.is_none()
            && self.rhs_batch.is_none()
            && self.axes.is_none()
            && self.dims.is_none()
            && self.permutation.is_none()
            && self.dtype.is_none()
    }

    fn of(kind: &OpKind) -> Params {
        let mut p = Params::default();
        match kind {
            OpKind::DotGeneral {
                lhs_contract,
                rhs_contract,
                lhs_batch,
                rhs_batch,
            } => {
                p.lhs_contract = Some(lhs_contract.clone());
                p.rhs_contract = Some(rhs_contract.clone());
                p.lhs_batch = Some(lhs_batch.clone());
                p.rhs_batch = Some(rhs_batch.clone());
            }
            OpKind::ReduceSum { axes } => p.axes = Some(axes.clone()),
            OpKind::Broadcast { dims } => p.dims = Some(dims.clone()),
            OpKind::Transpose { permutation } => p.permutation = Some(permutation.clone()),
            OpKind::Cast { dtype } => p.dtype = Some(dtype.clone()),
            _ => {}
        }
        p
    }
}

fn invalid(message: impl fmt::Display) -> TraceCaptureError {
    TraceCaptureError::new(format!("invalid trace: {message}"))
}

/// Rebuild an operation kind from an imported primitive name and parameters.
fn import_kind(
    primitive: &str,
    params: Params,
    operands: &[&Shape],
) -> Result<OpKind, TraceCaptureError> {
    let Some(spec) = lookup(primitive) else {
        return Ok(OpKind::Opaque {
            name: primitive.to_string(),
        });
    };
    if operands.len() != spec.arity {
        return Err(invalid(format!(
            "`{primitive}` takes {} operand(s), got {}",
            spec.arity,
            operands.len()
        )));
    }
    let required = |v: Option<Vec<usize>>, field: &str| {
        v.ok_or_else(|| invalid(format!("`{primitive}` is missing `{field}`")))
    };
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
        Family::AddAny => OpKind::AddAny,
        Family::Matmul => OpKind::matmul(operands[0].rank(), operands[1].rank()),
        Family::DotGeneral => OpKind::DotGeneral {
            lhs_contract: required(params.lhs_contract, "lhs_contract")?,
            rhs_contract: required(params.rhs_contract, "rhs_contract")?,
            lhs_batch: params.lhs_batch.unwrap_or_default(),
            rhs_batch: params.rhs_batch.unwrap_or_default(),
        },
        Family::ReduceSum => OpKind::ReduceSum {
            axes: params
                .axes
                .unwrap_or_else(|| (0..operands[0].rank()).collect()),
        },
        Family::Broadcast => OpKind::Broadcast {
            dims: required(params.dims, "dims")?,
        },
        Family::Transpose => OpKind::Transpose {
            permutation: params
                .permutation
                .unwrap_or_else(|| (0..operands[0].rank()).rev().collect()),
        },
        Family::Reshape => OpKind::Reshape,
        Family::Cast => OpKind::Cast {
            dtype: params.dtype.unwrap_or_else(|| "float32".to_string()),
        },
    };
    Ok(kind)
}

impl Trace {
    fn to_raw(&self) -> RawTrace {
        let values = self
            .graph
            .values()
            .iter()
            .map(|v| match &v.kind {
                ValueKind::Leaf => RawValue::Leaf {
                    id: v.id,
                    shape: v.shape.clone(),
                },
                ValueKind::Literal(value) => RawValue::Literal {
                    id: v.id,
                    value: *value,
                },
                ValueKind::Op(op) => RawValue::Op {
                    id: v.id,
                    primitive: op.kind.name().to_string(),
                    operands: op.operands.clone(),
                    shape: v.shape.clone(),
                    params: Params::of(&op.kind),
                },
            })
            .collect();
        RawTrace {
            name: self.name.clone(),
            arguments: self.arguments.clone(),
            values,
            bindings: self
                .bindings
                .iter()
                .map(|b| RawBinding {
                    name: b.name.clone(),
                    value: b.value,
                    depends_on: b.depends_on.clone(),
                })
                .collect(),
            tags: self.tags.clone(),
            outputs: self.outputs.clone(),
        }
    }

    /// Pretty-printed interchange JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.to_raw())
    }

    /// Compact interchange JSON, stable across runs (used for provenance).
    pub fn canonical_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.to_raw())
    }

    /// Import a trace exported by any tracer.
    ///
    /// Values must be listed in id order with operands before consumers;
    /// every leaf must be an argument; bindings, tags, and outputs must refer
    /// to existing values. Unknown primitive names import as opaque
    /// operations.
    pub fn from_json(json: &str) -> Result<Trace, TraceCaptureError> {
        let raw: RawTrace = serde_json::from_str(json).map_err(invalid)?;
        let mut graph = Graph::new();
        for (position, value) in raw.values.into_iter().enumerate() {
            let id = value.id();
            if id.index() != position {
                return Err(invalid(format!(
                    "value {id} listed at position {position}; values must be listed in id order"
                )));
            }
            match value {
                RawValue::Leaf { shape, .. } => {
                    graph.push(ValueKind::Leaf, shape);
                }
                RawValue::Literal { value, .. } => {
                    graph.push(ValueKind::Literal(value), Shape::scalar());
                }
                RawValue::Op {
                    primitive,
                    operands,
                    shape,
                    params,
                    ..
                } => {
                    if let Some(bad) = operands.iter().find(|o| **o >= id) {
                        return Err(invalid(format!(
                            "{id} uses {bad}, which is not defined before it"
                        )));
                    }
                    let shapes: Vec<&Shape> = operands.iter().map(|o| graph.shape(*o)).collect();
                    let kind = import_kind(&primitive, params, &shapes)?;
                    check_imported_shape(&kind, &shapes, &shape)
                        .map_err(|m| invalid(format!("{id}: {m}")))?;
                    graph.push(ValueKind::Op(OpNode { kind, operands }), shape);
                }
            }
        }

        let exists = |v: ValueId| graph.get(v).is_some();
        for (i, arg) in raw.arguments.iter().enumerate() {
            match graph.get(arg.value) {
                Some(v) if v.is_leaf() => {}
                _ => return Err(invalid(format!("argument {} is not a leaf", arg.value))),
            }
            if raw.arguments[..i].iter().any(|a| a.value == arg.value) {
                return Err(invalid(format!("argument {} listed twice", arg.value)));
            }
        }
        if let Some(leaf) = graph
            .values()
            .iter()
            .find(|v| v.is_leaf() && !raw.arguments.iter().any(|a| a.value == v.id))
        {
            return Err(invalid(format!("leaf {} is not an argument", leaf.id)));
        }
        for tag in &raw.tags {
            if !exists(tag.primal) || !exists(tag.value) {
                return Err(invalid(format!(
                    "derivative tag refers to unknown value ({} of {})",
                    tag.value, tag.primal
                )));
            }
        }
        if raw.outputs.is_empty() {
            return Err(invalid("no outputs"));
        }
        if let Some(bad) = raw.outputs.iter().find(|o| !exists(**o)) {
            return Err(invalid(format!("output {bad} does not exist")));
        }

        let mut binder = Binder::new();
        for b in raw.bindings {
            binder
                .bind(&graph, b.value, &b.name, b.depends_on)
                .map_err(|e| invalid(e.message))?;
        }

        Ok(Trace {
            name: raw.name,
            graph,
            arguments: raw.arguments,
            bindings: binder.into_bindings(),
            tags: raw.tags,
            outputs: raw.outputs,
        })
    }
}

fn check_imported_shape(kind: &OpKind, operands: &[&Shape], shape: &Shape) -> Result<(), String> {
    match kind {
        OpKind::Broadcast { dims } => check_broadcast(operands[0], dims, shape),
        OpKind::Reshape => check_reshape(operands[0], shape),
        OpKind::Opaque { .. } => Ok(()),
        _ => {
            let inferred = infer_shape(kind, operands)?;
            if &inferred == shape {
                Ok(())
            } else {
                Err(format!(
                    "`{}` produces {inferred}, but the trace says {shape}",
                    kind.name()
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quotient() -> Function {
        with_argument_names(
            Function::new("f", |_t, a| vec![a[0] * (a[0] - a[1]) / (a[0] + a[1]) + a[1]]),
            &["x", "y"],
        )
    }

    #[test]
    fn records_operations_in_topological_order() {
        let trace = capture(&quotient(), &[Shape::scalar(), Shape::scalar()]).unwrap();
        let kinds: Vec<_> = trace
            .graph
            .values()
            .iter()
            .filter_map(|v| v.op().map(|op| op.kind.name().to_string()))
            .collect();
        assert_eq!(kinds, vec!["sub", "mul", "add", "div", "add"]);
        assert_eq!(trace.outputs, vec![ValueId(6)]);
        assert_eq!(trace.argument_position("y"), Some(1));
    }

    #[test]
    fn argument_name_arity_mismatch_is_a_capture_error() {
        let err = capture(&quotient(), &[Shape::scalar()]).unwrap_err();
        assert!(err.message.contains("declares 2 argument name(s)"));
    }

    #[test]
    fn broadcasting_inserts_explicit_nodes() {
        let f = Function::new("f", |_t, a| vec![a[0] + a[1]]);
        let trace = capture(&f, &[Shape::from([3]), Shape::from([2, 3])]).unwrap();
        let bcast = trace.graph.value(ValueId(2));
        assert_eq!(
            bcast.op().map(|op| op.kind.clone()),
            Some(OpKind::Broadcast { dims: vec![1] })
        );
        assert_eq!(trace.graph.shape(trace.outputs[0]), &Shape::from([2, 3]));
    }

    #[test]
    fn scalar_literals_are_not_broadcast() {
        let f = Function::new("f", |_t, a| vec![a[0] * 2.0]);
        let trace = capture(&f, &[Shape::from([4])]).unwrap();
        assert_eq!(trace.graph.len(), 3);
    }

    #[test]
    fn shape_mismatch_poisons_the_trace() {
        let f = Function::new("f", |_t, a| vec![(a[0] + a[1]).exp()]);
        let err = capture(&f, &[Shape::from([3]), Shape::from([4])]).unwrap_err();
        assert!(err.message.contains("cannot broadcast"), "{}", err.message);
    }

    #[test]
    fn contraction_extent_mismatch_is_reported() {
        let f = Function::new("f", |_t, a| vec![a[0].matmul(a[1])]);
        let err = capture(&f, &[Shape::from([3]), Shape::from([4, 2])]).unwrap_err();
        assert!(err.message.contains("does not match"));
    }

    #[test]
    fn matmul_shape_drops_contracted_axes() {
        let f = Function::new("f", |_t, a| vec![a[0].matmul(a[1])]);
        let trace = capture(&f, &[Shape::from([3]), Shape::from([3, 4])]).unwrap();
        assert_eq!(trace.graph.shape(trace.outputs[0]), &Shape::from([4]));
    }

    #[test]
    fn unknown_primitives_are_recorded_as_opaque() {
        let f = Function::new("f", |t, a| vec![t.primitive("cumsum", &[a[0]])]);
        let trace = capture(&f, &[Shape::from([3])]).unwrap();
        let out = trace.graph.value(trace.outputs[0]);
        assert_eq!(out.op().map(|op| op.kind.name()), Some("cumsum"));
    }

    #[test]
    fn bad_binding_dependency_is_reported_at_finish() {
        let f = Function::new("f", |_t, a| {
            let s = a[0] + a[1];
            vec![(s * 2.0).named("w", Some(&[s][..]))]
        });
        let err = capture(&f, &[Shape::scalar(), Shape::scalar()]).unwrap_err();
        assert!(err.message.contains("neither an argument nor a named value"));
    }

    #[test]
    fn json_round_trip_preserves_the_trace() {
        let f = with_argument_names(
            Function::new("g", |_t, a| {
                let z = (a[0] + a[1]).named("z", Some(&[a[0]][..]));
                vec![z.matmul(a[2]).sum_all()]
            }),
            &["x", "y", "U"],
        );
        let trace = capture(&f, &[Shape::from([3]), Shape::from([3]), Shape::from([3, 4])]).unwrap();
        let json = trace.to_json().unwrap();
        let back = Trace::from_json(&json).unwrap();
        assert_eq!(back, trace);
    }

    #[test]
    fn import_rejects_forward_references() {
        let json = r#"{
            "name": "f",
            "arguments": [{"value": 0, "name": "x"}],
            "values": [
                {"kind": "leaf", "id": 0, "shape": []},
                {"kind": "op", "id": 1, "primitive": "neg", "operands": [2], "shape": []}
            ],
            "outputs": [1]
        }"#;
        let err = Trace::from_json(json).unwrap_err();
        assert!(err.message.contains("not defined before it"));
    }

    #[test]
    fn import_rejects_wrong_arity() {
        let json = r#"{
            "name": "f",
            "arguments": [{"value": 0, "name": "x"}],
            "values": [
                {"kind": "leaf", "id": 0, "shape": []},
                {"kind": "op", "id": 1, "primitive": "add", "operands": [0], "shape": []}
            ],
            "outputs": [1]
        }"#;
        let err = Trace::from_json(json).unwrap_err();
        assert!(err.message.contains("takes 2 operand(s)"));
    }

    #[test]
    fn import_keeps_unknown_primitives_opaque() {
        let json = r#"{
            "name": "f",
            "arguments": [{"value": 0, "name": "x"}],
            "values": [
                {"kind": "leaf", "id": 0, "shape": [3]},
                {"kind": "op", "id": 1, "primitive": "sort", "operands": [0], "shape": [3]}
            ],
            "outputs": [1]
        }"#;
        let trace = Trace::from_json(json).unwrap();
        assert_eq!(
            trace.graph.value(ValueId(1)).op().map(|op| op.kind.clone()),
            Some(OpKind::Opaque {
                name: "sort".into()
            })
        );
    }

    #[test]
    fn import_rejects_malformed_json() {
        assert!(Trace::from_json("{").unwrap_err().message.starts_with("invalid trace"));
    }

    #[test]
    fn broadcast_shapes_follow_numpy() {
        let s = broadcast_shapes(&Shape::from([1, 3]), &Shape::from([2, 1])).unwrap();
        assert_eq!(s, Shape::from([2, 3]));
        assert!(broadcast_shapes(&Shape::from([2]), &Shape::from([3])).is_err());
    }
}
