// autodiff.rs — Graph-level differentiation transforms (jvp, vjp, grad)
//
// Each transform takes a captured trace and records its derivative into the
// same graph through a resumed `Tracer`, tagging every derivative quantity
// with the primal value it belongs to. Nothing here renders or simplifies;
// transcription treats the result like any externally produced graph.
//
// Preconditions: `wrt` positions index the trace's arguments.
// Postconditions: jvp outputs are the primal outputs followed by one tangent
//   per primal output; vjp/grad outputs are the cotangents of the `wrt`
//   arguments, in order.
// Failure modes: `TraceCaptureError` for a bad `wrt` position, an opaque
//   primitive on a differentiated path, or a non-scalar `grad` output.
// Side effects: none.

use std::collections::HashSet;

use tracing::debug;

use crate::diag::TraceCaptureError;
use crate::id::ValueId;
use crate::ir::{free_axes, DerivativeKind, Graph, OpKind, OpNode, Shape, UnaryFn};
use crate::trace::{Trace, Traceable, Traced, Tracer};

// ── Transform wrappers ──────────────────────────────────────────────────────

/// Which derivative a [`Differentiated`] function computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Forward mode: tangents of the outputs.
    Jvp,
    /// Reverse mode with one cotangent seed argument per output.
    Vjp,
    /// Reverse mode of a scalar function seeded with the unit literal.
    Grad,
}

/// A traceable function whose trace is differentiated after capture.
///
/// Example shapes are those of the primal arguments; tangent and cotangent
/// inputs take the shapes of the values they belong to.
#[derive(Debug, Clone)]
pub struct Differentiated<F> {
    inner: F,
    mode: Mode,
    wrt: Vec<usize>,
}

impl<F: Traceable> Traceable for Differentiated<F> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capture(&self, example: &[Shape]) -> Result<Trace, TraceCaptureError> {
        let trace = self.inner.capture(example)?;
        transform(trace, self.mode, &self.wrt)
    }
}

/// Forward-mode derivative with respect to the arguments at `wrt`
/// (all arguments when empty).
pub fn jvp<F: Traceable>(function: F, wrt: &[usize]) -> Differentiated<F> {
    Differentiated {
        inner: function,
        mode: Mode::Jvp,
        wrt: wrt.to_vec(),
    }
}

/// Reverse-mode derivative with respect to the arguments at `wrt`
/// (all arguments when empty).
pub fn vjp<F: Traceable>(function: F, wrt: &[usize]) -> Differentiated<F> {
    Differentiated {
        inner: function,
        mode: Mode::Vjp,
        wrt: wrt.to_vec(),
    }
}

/// Gradient of a scalar function with respect to the arguments at `wrt`
/// (all arguments when empty).
pub fn grad<F: Traceable>(function: F, wrt: &[usize]) -> Differentiated<F> {
    Differentiated {
        inner: function,
        mode: Mode::Grad,
        wrt: wrt.to_vec(),
    }
}

/// Differentiate an already captured trace.
pub fn transform(trace: Trace, mode: Mode, wrt: &[usize]) -> Result<Trace, TraceCaptureError> {
    debug!(function = %trace.name, ?mode, ?wrt, "differentiating");
    match mode {
        Mode::Jvp => jvp_trace(trace, wrt),
        Mode::Vjp => vjp_trace(trace, wrt, Seed::Leaves),
        Mode::Grad => vjp_trace(trace, wrt, Seed::Unit),
    }
}

fn wrt_values(trace: &Trace, wrt: &[usize]) -> Result<Vec<ValueId>, TraceCaptureError> {
    if wrt.is_empty() {
        return Ok(trace.arguments.iter().map(|a| a.value).collect());
    }
    let mut values = Vec::with_capacity(wrt.len());
    for &position in wrt {
        let Some(arg) = trace.arguments.get(position) else {
            return Err(TraceCaptureError::new(format!(
                "cannot differentiate `{}` with respect to argument {position}: it takes {} argument(s)",
                trace.name,
                trace.arguments.len()
            )));
        };
        if !values.contains(&arg.value) {
            values.push(arg.value);
        }
    }
    Ok(values)
}

fn no_rule(kind: &OpKind) -> TraceCaptureError {
    TraceCaptureError::new(format!("no differentiation rule for primitive `{}`", kind.name()))
}

// ── Forward mode ────────────────────────────────────────────────────────────

fn jvp_trace(trace: Trace, wrt: &[usize]) -> Result<Trace, TraceCaptureError> {
    let args = wrt_values(&trace, wrt)?;
    let name = trace.name.clone();
    let primal_outputs = trace.outputs.clone();
    let graph = trace.graph.clone();
    let tracer = Tracer::resume(trace)?;

    let outputs = {
        let mut tangents: Vec<Option<Traced<'_>>> = vec![None; graph.len()];
        for &arg in &args {
            tangents[arg.index()] = Some(tracer.derivative_input(DerivativeKind::Tangent, arg));
        }
        for value in graph.values() {
            let Some(op) = value.op() else { continue };
            if let Some(t) = jvp_rule(&tracer, value.id, op, &graph, &tangents)? {
                tracer.tag(DerivativeKind::Tangent, value.id, t.id());
                tangents[value.id.index()] = Some(t);
            }
        }
        let mut outputs = primal_outputs.clone();
        for o in &primal_outputs {
            let t = match tangents[o.index()] {
                Some(t) => t,
                None => tracer.literal(0.0),
            };
            tracer.tag(DerivativeKind::Tangent, *o, t.id());
            outputs.push(t.id());
        }
        outputs
    };
    tracer.finish(&name, outputs)
}

fn add_opt<'t>(a: Option<Traced<'t>>, b: Option<Traced<'t>>) -> Option<Traced<'t>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (x, None) | (None, x) => x,
    }
}

fn sub_opt<'t>(a: Option<Traced<'t>>, b: Option<Traced<'t>>) -> Option<Traced<'t>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a - b),
        (a, None) => a,
        (None, Some(b)) => Some(-b),
    }
}

/// Tangent of `id = op(operands)`, or `None` when it is identically zero.
fn jvp_rule<'t>(
    tracer: &'t Tracer,
    id: ValueId,
    op: &OpNode,
    graph: &Graph,
    tangents: &[Option<Traced<'t>>],
) -> Result<Option<Traced<'t>>, TraceCaptureError> {
    let primal = |k: usize| tracer.value(op.operands[k]);
    let tangent = |k: usize| tangents[op.operands[k].index()];
    if op.operands.iter().all(|o| tangents[o.index()].is_none()) {
        return Ok(None);
    }
    let out = tracer.value(id);
    let t = match &op.kind {
        OpKind::Add => add_opt(tangent(0), tangent(1)),
        OpKind::AddAny => match (tangent(0), tangent(1)) {
            (Some(a), Some(b)) => Some(tracer.elementwise(OpKind::AddAny, a, b)),
            (x, None) | (None, x) => x,
        },
        OpKind::Sub => sub_opt(tangent(0), tangent(1)),
        OpKind::Mul => {
            let (a, b) = (primal(0), primal(1));
            add_opt(tangent(0).map(|ta| ta * b), tangent(1).map(|tb| a * tb))
        }
        OpKind::Div => {
            let (a, b) = (primal(0), primal(1));
            sub_opt(
                tangent(0).map(|ta| ta / b),
                tangent(1).map(|tb| (a * tb) / b.pow(2.0)),
            )
        }
        OpKind::Pow => {
            let (a, b) = (primal(0), primal(1));
            let base = tangent(0).map(|ta| power_derivative(tracer, a, b) * ta);
            let exponent = tangent(1).map(|tb| out * a.log() * tb);
            add_opt(base, exponent)
        }
        OpKind::Neg => tangent(0).map(|t| -t),
        OpKind::Relu => tangent(0).map(|t| primal(0).gt(0.0) * t),
        OpKind::Unary(f) => tangent(0).map(|t| {
            let a = primal(0);
            match f {
                UnaryFn::Exp => out * t,
                UnaryFn::Log => t / a,
                UnaryFn::Sin => a.cos() * t,
                UnaryFn::Cos => -(a.sin() * t),
                UnaryFn::Tanh => (1.0 - out.pow(2.0)) * t,
                UnaryFn::Sqrt => t / (2.0 * out),
            }
        }),
        OpKind::Indicator(_) => None,
        OpKind::DotGeneral {
            lhs_contract,
            rhs_contract,
            lhs_batch,
            rhs_batch,
        } => {
            let (a, b) = (primal(0), primal(1));
            let dot = |l: Traced<'t>, r: Traced<'t>| {
                l.dot_general(r, lhs_contract, rhs_contract, lhs_batch, rhs_batch)
            };
            add_opt(tangent(0).map(|ta| dot(ta, b)), tangent(1).map(|tb| dot(a, tb)))
        }
        OpKind::ReduceSum { axes } => tangent(0).map(|t| t.sum(axes)),
        OpKind::Broadcast { dims } => tangent(0).map(|t| {
            tracer.push_shaped(
                OpKind::Broadcast { dims: dims.clone() },
                vec![t.id()],
                graph.shape(id).clone(),
            )
        }),
        OpKind::Transpose { permutation } => tangent(0).map(|t| t.transpose(permutation)),
        OpKind::Reshape => tangent(0).map(|t| t.reshape(graph.shape(id).clone())),
        OpKind::Cast { dtype } => tangent(0).map(|t| t.cast(dtype)),
        OpKind::Opaque { .. } => return Err(no_rule(&op.kind)),
    };
    Ok(t)
}

/// d/da of a^b: `c a^{c-1}` for a literal exponent, `b a^{b-1}` otherwise.
fn power_derivative<'t>(tracer: &'t Tracer, a: Traced<'t>, b: Traced<'t>) -> Traced<'t> {
    match tracer.literal_value(b.id()) {
        Some(c) if c - 1.0 == 1.0 => c * a,
        Some(c) => c * a.pow(c - 1.0),
        None => b * a.pow(b - 1.0),
    }
}

// ── Reverse mode ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seed {
    /// One cotangent input per output.
    Leaves,
    /// The unit literal (scalar output only).
    Unit,
}

/// Values that depend on any of `sources`.
fn dependents(graph: &Graph, sources: &[ValueId]) -> Vec<bool> {
    let mut depends = vec![false; graph.len()];
    for value in graph.values() {
        depends[value.id.index()] = match value.op() {
            Some(op) => op.operands.iter().any(|o| depends[o.index()]),
            None => sources.contains(&value.id),
        };
    }
    depends
}

fn vjp_trace(trace: Trace, wrt: &[usize], seed: Seed) -> Result<Trace, TraceCaptureError> {
    let args = wrt_values(&trace, wrt)?;
    if seed == Seed::Unit {
        let scalar = trace.outputs.len() == 1
            && trace
                .graph
                .shape(trace.outputs[0])
                .dims()
                .iter()
                .all(|&d| d == 1);
        if !scalar {
            return Err(TraceCaptureError::new(format!(
                "grad of `{}` requires a single scalar output",
                trace.name
            )));
        }
    }
    let name = trace.name.clone();
    let primal_outputs = trace.outputs.clone();
    let bound: HashSet<ValueId> = trace.bindings.iter().map(|b| b.value).collect();
    let graph = trace.graph.clone();
    let depends = dependents(&graph, &args);
    let tracer = Tracer::resume(trace)?;

    let outputs = {
        let mut cts: Vec<Option<Traced<'_>>> = vec![None; graph.len()];
        let unit = match seed {
            Seed::Unit => Some(tracer.literal(1.0)),
            Seed::Leaves => None,
        };
        for &o in &primal_outputs {
            let s = match unit {
                Some(u) => {
                    tracer.tag(DerivativeKind::Cotangent, o, u.id());
                    u
                }
                None => tracer.derivative_input(DerivativeKind::Cotangent, o),
            };
            if depends[o.index()] {
                accumulate(&tracer, &mut cts, o, s);
            }
        }
        let rules = Rules {
            tracer: &tracer,
            graph: &graph,
            unit: unit.map(|u| u.id()),
            depends: &depends,
        };
        for value in graph.values().iter().rev() {
            let Some(ct) = cts[value.id.index()] else {
                continue;
            };
            let Some(op) = value.op() else { continue };
            if bound.contains(&value.id) {
                tracer.tag(DerivativeKind::Cotangent, value.id, ct.id());
            }
            for (operand, contribution) in rules.transpose(value.id, op, ct)? {
                accumulate(&tracer, &mut cts, operand, contribution);
            }
        }
        let mut outputs = Vec::with_capacity(args.len());
        for &arg in &args {
            let ct = match cts[arg.index()] {
                Some(ct) => ct,
                None => tracer.literal(0.0),
            };
            tracer.tag(DerivativeKind::Cotangent, arg, ct.id());
            outputs.push(ct.id());
        }
        outputs
    };
    tracer.finish(&name, outputs)
}

/// Add a cotangent contribution, pairing with earlier ones via `add_any` in
/// the order they arrive.
fn accumulate<'t>(
    tracer: &'t Tracer,
    cts: &mut [Option<Traced<'t>>],
    target: ValueId,
    contribution: Traced<'t>,
) {
    let slot = &mut cts[target.index()];
    *slot = Some(match *slot {
        None => contribution,
        Some(prev) => tracer.elementwise(OpKind::AddAny, prev, contribution),
    });
}

struct Rules<'a, 't> {
    tracer: &'t Tracer,
    graph: &'a Graph,
    unit: Option<ValueId>,
    depends: &'a [bool],
}

impl<'a, 't> Rules<'a, 't> {
    /// Product that skips the unit seed.
    fn times(&self, a: Traced<'t>, b: Traced<'t>) -> Traced<'t> {
        if self.is_unit(a.id()) {
            b
        } else if self.is_unit(b.id()) {
            a
        } else {
            a * b
        }
    }

    /// The unit seed, or a shape-only rearrangement of it (a summed-out
    /// seed comes back as a broadcast of the literal).
    fn is_unit(&self, id: ValueId) -> bool {
        let Some(unit) = self.unit else {
            return false;
        };
        let mut current = id;
        loop {
            if current == unit {
                return true;
            }
            match self.tracer.op(current) {
                Some(OpNode {
                    kind:
                        OpKind::Broadcast { .. }
                        | OpKind::Reshape
                        | OpKind::Cast { .. }
                        | OpKind::Transpose { .. },
                    operands,
                }) if !operands.is_empty() => current = operands[0],
                _ => return false,
            }
        }
    }

    fn shape(&self, id: ValueId) -> &'a Shape {
        self.graph.shape(id)
    }

    /// Sum a contribution shaped like the result down to the operand's shape
    /// (undoing implicit broadcasting).
    fn unbroadcast(&self, contribution: Traced<'t>, target: &Shape) -> Traced<'t> {
        let shape = contribution.shape();
        if &shape == target {
            return contribution;
        }
        let lead = shape.rank().saturating_sub(target.rank());
        let offset = target.rank().saturating_sub(shape.rank());
        let mut axes: Vec<usize> = (0..lead).collect();
        for k in offset..target.rank() {
            let axis = lead + k - offset;
            if target.dim(k) == 1 && shape.dim(axis) != 1 {
                axes.push(axis);
            }
        }
        let summed = if axes.is_empty() {
            contribution
        } else {
            contribution.sum(&axes)
        };
        let summed_shape = summed.shape();
        let count = |s: &Shape| s.dims().iter().product::<usize>();
        if &summed_shape == target {
            summed
        } else if count(&summed_shape) == count(target) {
            summed.reshape(target.clone())
        } else {
            summed.broadcast_to(target.clone())
        }
    }

    /// Cotangent contributions of `id = op(operands)` to the operands that
    /// depend on a differentiated argument.
    fn transpose(
        &self,
        id: ValueId,
        op: &OpNode,
        ct: Traced<'t>,
    ) -> Result<Vec<(ValueId, Traced<'t>)>, TraceCaptureError> {
        let tracer = self.tracer;
        let needs = |k: usize| self.depends[op.operands[k].index()];
        let primal = |k: usize| tracer.value(op.operands[k]);
        let mut out: Vec<(ValueId, Traced<'t>)> = Vec::with_capacity(2);
        let mut emit = |k: usize, contribution: Traced<'t>| {
            let operand = op.operands[k];
            out.push((operand, self.unbroadcast(contribution, self.shape(operand))));
        };
        let value = tracer.value(id);

        match &op.kind {
            OpKind::Add | OpKind::AddAny => {
                for k in 0..2 {
                    if needs(k) {
                        emit(k, ct);
                    }
                }
            }
            OpKind::Sub => {
                if needs(0) {
                    emit(0, ct);
                }
                if needs(1) {
                    emit(1, -ct);
                }
            }
            OpKind::Mul => {
                let (a, b) = (primal(0), primal(1));
                if needs(0) {
                    emit(0, self.times(ct, b));
                }
                if needs(1) {
                    emit(1, self.times(a, ct));
                }
            }
            OpKind::Div => {
                let (a, b) = (primal(0), primal(1));
                if needs(0) {
                    emit(0, ct / b);
                }
                if needs(1) {
                    emit(1, -(self.times(ct, a) / b.pow(2.0)));
                }
            }
            OpKind::Pow => {
                let (a, b) = (primal(0), primal(1));
                if needs(0) {
                    emit(0, self.times(ct, power_derivative(tracer, a, b)));
                }
                if needs(1) {
                    emit(1, self.times(ct, value * a.log()));
                }
            }
            OpKind::Neg => {
                if needs(0) {
                    emit(0, -ct);
                }
            }
            OpKind::Relu => {
                if needs(0) {
                    emit(0, self.times(primal(0).gt(0.0), ct));
                }
            }
            OpKind::Unary(f) => {
                if needs(0) {
                    let a = primal(0);
                    let contribution = match f {
                        UnaryFn::Exp => self.times(ct, value),
                        UnaryFn::Log => ct / a,
                        UnaryFn::Sin => self.times(ct, a.cos()),
                        UnaryFn::Cos => -self.times(ct, a.sin()),
                        UnaryFn::Tanh => self.times(ct, 1.0 - value.pow(2.0)),
                        UnaryFn::Sqrt => ct / (2.0 * value),
                    };
                    emit(0, contribution);
                }
            }
            OpKind::Indicator(_) => {}
            OpKind::Cast { .. } => {
                if needs(0) {
                    emit(0, ct);
                }
            }
            OpKind::Reshape => {
                if needs(0) {
                    emit(0, ct.reshape(self.shape(op.operands[0]).clone()));
                }
            }
            OpKind::Transpose { permutation } => {
                if needs(0) {
                    let mut inverse = vec![0; permutation.len()];
                    for (k, &p) in permutation.iter().enumerate() {
                        inverse[p] = k;
                    }
                    emit(0, ct.transpose(&inverse));
                }
            }
            OpKind::Broadcast { dims } => {
                if needs(0) {
                    let operand = self.shape(op.operands[0]);
                    let target = self.shape(id);
                    let axes: Vec<usize> = (0..target.rank())
                        .filter(|axis| match dims.iter().position(|d| d == axis) {
                            None => true,
                            Some(k) => operand.dim(k) == 1 && target.dim(*axis) != 1,
                        })
                        .collect();
                    let summed = if axes.is_empty() { ct } else { ct.sum(&axes) };
                    let contribution = if &summed.shape() == operand {
                        summed
                    } else {
                        summed.reshape(operand.clone())
                    };
                    emit(0, contribution);
                }
            }
            OpKind::ReduceSum { axes } => {
                if needs(0) {
                    let operand = self.shape(op.operands[0]);
                    let kept: Vec<usize> =
                        (0..operand.rank()).filter(|a| !axes.contains(a)).collect();
                    emit(
                        0,
                        tracer.push_shaped(
                            OpKind::Broadcast { dims: kept },
                            vec![ct.id()],
                            operand.clone(),
                        ),
                    );
                }
            }
            OpKind::DotGeneral {
                lhs_contract,
                rhs_contract,
                lhs_batch,
                rhs_batch,
            } => {
                let (a, b) = (primal(0), primal(1));
                let (ra, rb) = (self.shape(op.operands[0]).rank(), self.shape(op.operands[1]).rank());
                let a_free = free_axes(ra, lhs_contract, lhs_batch);
                let b_free = free_axes(rb, rhs_contract, rhs_batch);
                let nb = lhs_batch.len();
                let ct_batch: Vec<usize> = (0..nb).collect();
                let ct_a_free: Vec<usize> = (nb..nb + a_free.len()).collect();
                let ct_b_free: Vec<usize> =
                    (nb + a_free.len()..nb + a_free.len() + b_free.len()).collect();
                if needs(0) {
                    // Result axes: batch, a's free axes, then b's contracted
                    // axes in ascending order (paired back to a's).
                    let product = ct.dot_general(b, &ct_b_free, &b_free, &ct_batch, rhs_batch);
                    let mut order: Vec<usize> = lhs_batch.clone();
                    order.extend(&a_free);
                    order.extend(paired_in_order(rhs_contract, lhs_contract));
                    emit(0, permute_into(product, &order));
                }
                if needs(1) {
                    let product = a.dot_general(ct, &a_free, &ct_a_free, lhs_batch, &ct_batch);
                    let mut order: Vec<usize> = rhs_batch.clone();
                    order.extend(paired_in_order(lhs_contract, rhs_contract));
                    order.extend(&b_free);
                    emit(1, permute_into(product, &order));
                }
            }
            OpKind::Opaque { .. } => return Err(no_rule(&op.kind)),
        }
        Ok(out)
    }
}

/// `partner[k]` for each `k`, ordered by ascending `by[k]`.
fn paired_in_order(by: &[usize], partner: &[usize]) -> Vec<usize> {
    let mut pairs: Vec<(usize, usize)> = by.iter().copied().zip(partner.iter().copied()).collect();
    pairs.sort();
    pairs.into_iter().map(|(_, p)| p).collect()
}

/// `value`'s axis `k` is operand axis `order[k]`; transpose it back into
/// operand axis order (a no-op when already in order).
fn permute_into<'t>(value: Traced<'t>, order: &[usize]) -> Traced<'t> {
    if order.iter().enumerate().all(|(k, &a)| k == a) {
        return value;
    }
    let mut permutation = vec![0; order.len()];
    for (k, &axis) in order.iter().enumerate() {
        permutation[axis] = k;
    }
    value.transpose(&permutation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ValueKind;
    use crate::trace::{capture, with_argument_names, Function};

    fn quotient() -> Function {
        with_argument_names(
            Function::new("f", |_t, a| vec![a[0] * (a[0] - a[1]) / (a[0] + a[1]) + a[1]]),
            &["x", "y"],
        )
    }

    fn scalars(n: usize) -> Vec<Shape> {
        vec![Shape::scalar(); n]
    }

    /// Flatten a left-nested `add_any` chain.
    fn terms(trace: &Trace, id: ValueId) -> Vec<ValueId> {
        match trace.graph.value(id).op() {
            Some(op) if op.kind == OpKind::AddAny => {
                let mut t = terms(trace, op.operands[0]);
                t.extend(terms(trace, op.operands[1]));
                t
            }
            _ => vec![id],
        }
    }

    #[test]
    fn grad_accumulates_three_contributions_for_x() {
        let trace = capture(&grad(quotient(), &[0]), &scalars(2)).unwrap();
        assert_eq!(trace.outputs.len(), 1);
        let ct_x = trace.outputs[0];
        assert_eq!(terms(&trace, ct_x).len(), 3);
        let tag = trace.last_tag_of(ct_x).unwrap();
        assert_eq!(tag.kind, DerivativeKind::Cotangent);
        assert_eq!(tag.primal, ValueId(0));
    }

    #[test]
    fn grad_skips_products_with_the_unit_seed() {
        let f = with_argument_names(Function::new("f", |_t, a| vec![a[0] * a[1]]), &["x", "y"]);
        let trace = capture(&grad(f, &[0]), &scalars(2)).unwrap();
        // d(xy)/dx is y itself: no new multiplication.
        assert_eq!(trace.outputs, vec![ValueId(1)]);
        assert_eq!(trace.last_tag_of(ValueId(1)).map(|t| t.primal), Some(ValueId(0)));
    }

    #[test]
    fn grad_skips_the_seed_broadcast_by_a_sum() {
        let f = with_argument_names(
            Function::new("loss", |_t, a| {
                let h = a[0].exp().named("h", None);
                vec![(h * h).sum_all()]
            }),
            &["x"],
        );
        let trace = capture(&grad(f, &[0]), &[Shape::from([4])]).unwrap();
        let h = trace.bindings[0].value;
        let ct_h = trace
            .tags
            .iter()
            .find(|t| t.primal == h && t.kind == DerivativeKind::Cotangent)
            .map(|t| t.value)
            .unwrap();
        // Both contributions are h itself.
        assert_eq!(terms(&trace, ct_h), vec![h, h]);
        let has_unit_factor = trace.graph.values().iter().any(|v| match v.op() {
            Some(op) if op.kind == OpKind::Mul => op.operands.iter().any(|o| {
                matches!(
                    trace.graph.value(*o).op().map(|op| &op.kind),
                    Some(OpKind::Broadcast { .. })
                )
            }),
            _ => false,
        });
        assert!(!has_unit_factor);
    }

    #[test]
    fn grad_requires_scalar_output() {
        let f = Function::new("f", |_t, a| vec![a[0] * 2.0]);
        let err = capture(&grad(f, &[]), &[Shape::from([3])]).unwrap_err();
        assert!(err.message.contains("single scalar output"));
    }

    #[test]
    fn independent_argument_gets_literal_zero() {
        let f = Function::new("f", |_t, a| vec![a[0].exp()]);
        let trace = capture(&grad(f, &[1]), &scalars(2)).unwrap();
        assert_eq!(trace.graph.value(trace.outputs[0]).literal(), Some(0.0));
    }

    #[test]
    fn vjp_seeds_are_tagged_leaves() {
        let f = Function::new("f", |_t, a| vec![a[0].sin()]);
        let trace = capture(&vjp(f, &[0]), &[Shape::from([3])]).unwrap();
        assert_eq!(trace.arguments.len(), 2);
        let seed = trace.arguments[1].value;
        assert!(trace.graph.value(seed).is_leaf());
        assert!(trace.arguments[1].derivative);
        let tag = trace.tag_of(seed).unwrap();
        assert_eq!(tag.kind, DerivativeKind::Cotangent);
        assert_eq!(trace.graph.shape(seed), &Shape::from([3]));
    }

    #[test]
    fn jvp_appends_tangent_inputs_and_outputs() {
        let f = Function::new("f", |_t, a| vec![a[0] * a[1]]);
        let trace = capture(&jvp(f, &[]), &scalars(2)).unwrap();
        assert_eq!(trace.arguments.len(), 4);
        assert_eq!(trace.outputs.len(), 2);
        let tangent = trace.outputs[1];
        assert_eq!(trace.tag_of(tangent).map(|t| t.primal), Some(trace.outputs[0]));
        assert_eq!(
            trace.graph.value(tangent).op().map(|op| op.kind.clone()),
            Some(OpKind::Add)
        );
    }

    #[test]
    fn opaque_primitive_on_path_fails() {
        let f = Function::new("f", |t, a| vec![t.primitive("cumsum", &[a[0]]).sum_all()]);
        let err = capture(&grad(f, &[]), &[Shape::from([3])]).unwrap_err();
        assert!(err.message.contains("cumsum"));
    }

    #[test]
    fn bound_intermediates_get_cotangent_tags() {
        let f = with_argument_names(
            Function::new("f", |_t, a| {
                let z = (a[0] + a[1]).named("z", None);
                vec![a[0] / z]
            }),
            &["x", "y"],
        );
        let trace = capture(&grad(f, &[0]), &scalars(2)).unwrap();
        let z = trace.bindings[0].value;
        assert!(trace
            .tags
            .iter()
            .any(|t| t.primal == z && t.kind == DerivativeKind::Cotangent));
    }

    #[test]
    fn matmul_cotangents_have_operand_shapes() {
        let f = Function::new("f", |_t, a| vec![a[0].matmul(a[1]).sum_all()]);
        let trace = capture(&grad(f, &[]), &[Shape::from([3]), Shape::from([3, 4])]).unwrap();
        assert_eq!(trace.graph.shape(trace.outputs[0]), &Shape::from([3]));
        assert_eq!(trace.graph.shape(trace.outputs[1]), &Shape::from([3, 4]));
    }

    #[test]
    fn transpose_cotangent_uses_inverse_permutation() {
        let f = Function::new("f", |_t, a| vec![a[0].transpose(&[1, 2, 0]).sum_all()]);
        let trace = capture(&grad(f, &[]), &[Shape::from([2, 3, 4])]).unwrap();
        assert_eq!(trace.graph.shape(trace.outputs[0]), &Shape::from([2, 3, 4]));
        let has_inverse = trace.graph.values().iter().any(|v| {
            matches!(
                v.op().map(|op| &op.kind),
                Some(OpKind::Transpose { permutation }) if permutation == &vec![2, 0, 1]
            )
        });
        assert!(has_inverse);
    }

    #[test]
    fn bad_position_is_a_capture_error() {
        let err = capture(&grad(quotient(), &[5]), &scalars(2)).unwrap_err();
        assert!(err.message.contains("argument 5"));
    }

    #[test]
    fn derivative_leaves_are_inputs() {
        let trace = capture(&vjp(quotient(), &[0, 1]), &scalars(2)).unwrap();
        let leaves = trace
            .graph
            .values()
            .iter()
            .filter(|v| matches!(v.kind, ValueKind::Leaf))
            .count();
        assert_eq!(leaves, trace.arguments.len());
        assert_eq!(trace.outputs.len(), 2);
    }
}
