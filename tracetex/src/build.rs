// build.rs — Expression builder: graph values to index-annotated expressions
//
// Every equation is built from its root value with a fresh index scope. The
// root's non-singleton axes receive the first free symbols; contractions and
// reductions open nested scopes for the symbols they bind. Expansion stops at
// any value that has a display symbol, except the equation's own root.
//
// Preconditions: names were resolved and threaded for the same trace.
// Postconditions: the program lists binding equations (each followed by its
//   tangent equation), cotangent equations of bound values in reverse
//   declaration order, then one equation per output.
// Failure modes: `UnsupportedPrimitiveError` for opaque primitives and for
//   reshapes that change non-singleton structure. No partial program is
//   returned.
// Side effects: `debug!` for elisions.

use tracing::debug;

use crate::binder::NameTable;
use crate::diag::UnsupportedPrimitiveError;
use crate::expr::{BinOp, Equation, EquationKind, Expr, Index, Program, Symbol, SymbolRef};
use crate::id::ValueId;
use crate::index::IndexAllocator;
use crate::ir::{free_axes, DerivativeKind, Graph, OpKind, OpNode, Shape, ValueKind};
use crate::options::TranscribeOptions;
use crate::primitives::{rule, Rule};
use crate::threader::{accumulation_terms, Threading};
use crate::trace::Trace;

/// Index symbols of a value's axes; `None` marks an elided (extent-1) axis.
type Axes = [Option<Index>];

fn reference(symbol: Symbol, idx: &Axes) -> Expr {
    Expr::Var(SymbolRef {
        symbol,
        indices: idx.iter().flatten().copied().collect(),
    })
}

// ── Build context ───────────────────────────────────────────────────────────

/// Explicit builder state: the graph, the symbols, and the index scope.
pub struct BuildCtx<'a> {
    graph: &'a Graph,
    names: &'a NameTable,
    indices: IndexAllocator,
    root: Option<ValueId>,
}

impl<'a> BuildCtx<'a> {
    pub fn new(graph: &'a Graph, names: &'a NameTable, alphabet: &str) -> Self {
        BuildCtx {
            graph,
            names,
            indices: IndexAllocator::new(alphabet),
            root: None,
        }
    }

    /// Build `symbol = root`. The right-hand side is the root's symbol when it
    /// has a different one (aliases, pass-through derivatives), otherwise its
    /// expansion.
    pub fn equation(
        &mut self,
        kind: EquationKind,
        symbol: Symbol,
        root: ValueId,
    ) -> Result<Equation, UnsupportedPrimitiveError> {
        let (graph, names) = (self.graph, self.names);
        let mark = self.indices.mark();
        let idx = self.free_indices(graph.shape(root));
        let rhs = match names.symbol(root) {
            Some(own) if *own != symbol => reference(own.clone(), &idx),
            _ => {
                self.root = Some(root);
                let built = self.build(root, &idx);
                self.root = None;
                built?
            }
        };
        self.indices.release(mark);
        Ok(Equation {
            kind,
            lhs: SymbolRef {
                symbol,
                indices: idx.iter().flatten().copied().collect(),
            },
            rhs,
        })
    }

    fn free_indices(&mut self, shape: &Shape) -> Vec<Option<Index>> {
        shape
            .dims()
            .iter()
            .map(|&d| if d == 1 { None } else { Some(self.indices.fresh()) })
            .collect()
    }

    /// Expression for value `id` whose axes carry `idx`.
    pub fn build(&mut self, id: ValueId, idx: &Axes) -> Result<Expr, UnsupportedPrimitiveError> {
        let graph = self.graph;
        let names = self.names;
        if self.root != Some(id) {
            if let Some(symbol) = names.symbol(id) {
                return Ok(reference(symbol.clone(), idx));
            }
        }
        let value = graph.value(id);
        match &value.kind {
            ValueKind::Leaf => {
                let symbol = names
                    .symbol(id)
                    .cloned()
                    .unwrap_or_else(|| Symbol::plain(id.to_string()));
                Ok(reference(symbol, idx))
            }
            ValueKind::Literal(v) => Ok(Expr::Literal(*v)),
            ValueKind::Op(op) => self.build_op(id, op, &value.shape, idx),
        }
    }

    fn build_op(
        &mut self,
        id: ValueId,
        op: &OpNode,
        shape: &Shape,
        idx: &Axes,
    ) -> Result<Expr, UnsupportedPrimitiveError> {
        let rule = rule(&op.kind).map_err(|e| e.at(id))?;
        let mismatch = || UnsupportedPrimitiveError::new(op.kind.name()).at(id);
        match rule {
            Rule::Elide => {
                debug!(value = %id, primitive = op.kind.name(), "elided");
                self.build(op.operands[0], idx)
            }
            Rule::Reshape => self.reshape(id, op.operands[0], shape, idx),
            Rule::Infix(bop) => {
                let lhs = self.elementwise(op.operands[0], shape, idx)?;
                let rhs = self.elementwise(op.operands[1], shape, idx)?;
                Ok(Expr::binary(bop, lhs, rhs))
            }
            Rule::Negate => {
                let inner = self.elementwise(op.operands[0], shape, idx)?;
                Ok(Expr::Neg(Box::new(inner)))
            }
            Rule::Call(func) => {
                let arg = self.elementwise(op.operands[0], shape, idx)?;
                Ok(Expr::Call {
                    func,
                    arg: Box::new(arg),
                })
            }
            Rule::Indicator(cmp) => {
                let lhs = self.elementwise(op.operands[0], shape, idx)?;
                let rhs = self.elementwise(op.operands[1], shape, idx)?;
                Ok(Expr::Indicator {
                    cmp,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                })
            }
            Rule::Contract => {
                let OpKind::DotGeneral {
                    lhs_contract,
                    rhs_contract,
                    lhs_batch,
                    rhs_batch,
                } = &op.kind
                else {
                    return Err(mismatch());
                };
                let axes = ContractAxes {
                    lhs_contract,
                    rhs_contract,
                    lhs_batch,
                    rhs_batch,
                };
                self.contract(op.operands[0], op.operands[1], &axes, idx)
            }
            Rule::Reduce => {
                let OpKind::ReduceSum { axes } = &op.kind else {
                    return Err(mismatch());
                };
                self.reduce(op.operands[0], axes, idx)
            }
            Rule::Broadcast => {
                let OpKind::Broadcast { dims } = &op.kind else {
                    return Err(mismatch());
                };
                let operand = op.operands[0];
                let from = self.graph.shape(operand);
                let operand_idx: Vec<Option<Index>> = from
                    .dims()
                    .iter()
                    .zip(dims)
                    .map(|(&d, &axis)| if d == 1 { None } else { idx.get(axis).copied().flatten() })
                    .collect();
                self.build(operand, &operand_idx)
            }
            Rule::Transpose => {
                let OpKind::Transpose { permutation } = &op.kind else {
                    return Err(mismatch());
                };
                let operand = op.operands[0];
                let mut operand_idx = vec![None; self.graph.shape(operand).rank()];
                for (k, &axis) in permutation.iter().enumerate() {
                    if let Some(slot) = operand_idx.get_mut(axis) {
                        *slot = idx.get(k).copied().flatten();
                    }
                }
                self.build(operand, &operand_idx)
            }
            Rule::Accumulate => {
                let terms = accumulation_terms(self.graph, id, self.names);
                let mut built = Vec::with_capacity(terms.len());
                for term in terms {
                    built.push(self.elementwise(term, shape, idx)?);
                }
                Ok(match built.len() {
                    1 => built.remove(0),
                    _ => Expr::Terms(built),
                })
            }
        }
    }

    /// Operand of an elementwise operation: trailing axes align with the
    /// result's; extent-1 operand axes get no index.
    fn elementwise(
        &mut self,
        operand: ValueId,
        out: &Shape,
        idx: &Axes,
    ) -> Result<Expr, UnsupportedPrimitiveError> {
        let shape = self.graph.shape(operand);
        let offset = out.rank().saturating_sub(shape.rank());
        let operand_idx: Vec<Option<Index>> = shape
            .dims()
            .iter()
            .enumerate()
            .map(|(k, &d)| if d == 1 { None } else { idx.get(offset + k).copied().flatten() })
            .collect();
        self.build(operand, &operand_idx)
    }

    fn reshape(
        &mut self,
        id: ValueId,
        operand: ValueId,
        shape: &Shape,
        idx: &Axes,
    ) -> Result<Expr, UnsupportedPrimitiveError> {
        let from = self.graph.shape(operand);
        if from.non_singleton_dims() != shape.non_singleton_dims() {
            return Err(UnsupportedPrimitiveError::new("reshape")
                .at(id)
                .with_detail(format!("{from} to {shape} changes non-singleton axes")));
        }
        debug!(value = %id, %from, to = %shape, "singleton reshape elided");
        let mut surviving = idx
            .iter()
            .zip(shape.dims())
            .filter(|(_, &d)| d != 1)
            .map(|(i, _)| *i);
        let operand_idx: Vec<Option<Index>> = from
            .dims()
            .iter()
            .map(|&d| if d == 1 { None } else { surviving.next().flatten() })
            .collect();
        self.build(operand, &operand_idx)
    }

    fn contract(
        &mut self,
        lhs: ValueId,
        rhs: ValueId,
        axes: &ContractAxes<'_>,
        idx: &Axes,
    ) -> Result<Expr, UnsupportedPrimitiveError> {
        let graph = self.graph;
        let (ls, rs) = (graph.shape(lhs), graph.shape(rhs));
        let mut lhs_idx: Vec<Option<Index>> = vec![None; ls.rank()];
        let mut rhs_idx: Vec<Option<Index>> = vec![None; rs.rank()];
        let at = |k: usize| idx.get(k).copied().flatten();
        let unless_singleton = |shape: &Shape, axis: usize, i: Option<Index>| {
            if shape.dim(axis) == 1 {
                None
            } else {
                i
            }
        };

        // Output axes: batch, then lhs free, then rhs free.
        let batch = axes.lhs_batch.len();
        for (k, (&la, &ra)) in axes.lhs_batch.iter().zip(axes.rhs_batch).enumerate() {
            lhs_idx[la] = unless_singleton(ls, la, at(k));
            rhs_idx[ra] = unless_singleton(rs, ra, at(k));
        }
        let lhs_free = free_axes(ls.rank(), axes.lhs_contract, axes.lhs_batch);
        let rhs_free = free_axes(rs.rank(), axes.rhs_contract, axes.rhs_batch);
        for (k, &a) in lhs_free.iter().enumerate() {
            lhs_idx[a] = unless_singleton(ls, a, at(batch + k));
        }
        for (k, &a) in rhs_free.iter().enumerate() {
            rhs_idx[a] = unless_singleton(rs, a, at(batch + lhs_free.len() + k));
        }

        let mark = self.indices.mark();
        let mut bound = Vec::new();
        for (&la, &ra) in axes.lhs_contract.iter().zip(axes.rhs_contract) {
            if ls.dim(la) == 1 || rs.dim(ra) == 1 {
                debug!(lhs = %lhs, rhs = %rhs, "singleton contraction elided");
                continue;
            }
            let symbol = self.indices.fresh();
            lhs_idx[la] = Some(symbol);
            rhs_idx[ra] = Some(symbol);
            bound.push(symbol);
        }
        let built_lhs = self.build(lhs, &lhs_idx);
        let built_rhs = self.build(rhs, &rhs_idx);
        self.indices.release(mark);

        let body = Expr::binary(BinOp::Mul, built_lhs?, built_rhs?);
        Ok(summation(bound, body))
    }

    fn reduce(
        &mut self,
        operand: ValueId,
        axes: &[usize],
        idx: &Axes,
    ) -> Result<Expr, UnsupportedPrimitiveError> {
        let from = self.graph.shape(operand);
        let mark = self.indices.mark();
        let mut kept = idx.iter().copied();
        let mut bound = Vec::new();
        let mut operand_idx = Vec::with_capacity(from.rank());
        for (axis, &d) in from.dims().iter().enumerate() {
            if axes.contains(&axis) {
                if d == 1 {
                    operand_idx.push(None);
                } else {
                    let symbol = self.indices.fresh();
                    bound.push(symbol);
                    operand_idx.push(Some(symbol));
                }
            } else {
                let i = kept.next().flatten();
                operand_idx.push(if d == 1 { None } else { i });
            }
        }
        let body = self.build(operand, &operand_idx);
        self.indices.release(mark);
        Ok(summation(bound, body?))
    }
}

struct ContractAxes<'k> {
    lhs_contract: &'k [usize],
    rhs_contract: &'k [usize],
    lhs_batch: &'k [usize],
    rhs_batch: &'k [usize],
}

fn summation(indices: Vec<Index>, body: Expr) -> Expr {
    if indices.is_empty() {
        body
    } else {
        Expr::Sum {
            indices,
            body: Box::new(body),
        }
    }
}

// ── Program ─────────────────────────────────────────────────────────────────

/// Build every equation of a transcription.
pub fn build_program(
    trace: &Trace,
    names: &NameTable,
    threading: &Threading,
    options: &TranscribeOptions,
) -> Result<Program, UnsupportedPrimitiveError> {
    let mut ctx = BuildCtx::new(&trace.graph, names, &options.index_alphabet);
    let mut equations = Vec::new();

    for bound in names.bound() {
        if bound.owns_value {
            equations.push(ctx.equation(EquationKind::Binding, bound.symbol.clone(), bound.value)?);
            for d in threading.equations_for(DerivativeKind::Tangent, bound.value) {
                equations.push(ctx.equation(EquationKind::Derivative, d.symbol.clone(), d.value)?);
            }
        } else if names.symbol(bound.value) != Some(&bound.symbol) {
            equations.push(ctx.equation(EquationKind::Binding, bound.symbol.clone(), bound.value)?);
        }
    }

    for bound in names.bound().iter().rev().filter(|b| b.owns_value) {
        for d in threading.equations_for(DerivativeKind::Cotangent, bound.value) {
            equations.push(ctx.equation(EquationKind::Derivative, d.symbol.clone(), d.value)?);
        }
    }

    for &output in &trace.outputs {
        let symbol = threading.output_symbol(trace, names, output);
        equations.push(ctx.equation(EquationKind::Output, symbol, output)?);
    }

    Ok(Program { equations })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::grad;
    use crate::binder::resolve;
    use crate::threader::thread;
    use crate::trace::{capture, with_argument_names, Function, Traceable, Traced};

    fn program(f: &impl Traceable, shapes: &[Shape]) -> Result<Program, UnsupportedPrimitiveError> {
        let trace = capture(f, shapes).unwrap();
        let options = TranscribeOptions::default();
        let mut names = resolve(&trace.name, &trace.arguments, &trace.bindings).names;
        let threading = thread(&trace, &mut names, &options);
        build_program(&trace, &names, &threading, &options)
    }

    fn text(f: &impl Traceable, shapes: &[Shape]) -> String {
        program(f, shapes).unwrap().to_string()
    }

    fn unary(body: impl for<'t> Fn(Traced<'t>) -> Traced<'t> + 'static) -> Function {
        with_argument_names(Function::new("f", move |_t, a| vec![body(a[0])]), &["x"])
    }

    fn binary(
        body: impl for<'t> Fn(Traced<'t>, Traced<'t>) -> Traced<'t> + 'static,
        names: [&str; 2],
    ) -> Function {
        with_argument_names(Function::new("f", move |_t, a| vec![body(a[0], a[1])]), &names)
    }

    #[test]
    fn elementwise_scalars() {
        let f = binary(|x, y| x * (x - y) / (x + y) + y, ["x", "y"]);
        let s = text(&f, &[Shape::scalar(), Shape::scalar()]);
        assert_eq!(s, "f = (add (div (mul x (sub x y)) (add x y)) y)\n");
    }

    #[test]
    fn vector_matrix_product_binds_one_symbol() {
        let f = binary(|x, u| x.matmul(u), ["x", "U"]);
        let s = text(&f, &[Shape::from([3]), Shape::from([3, 4])]);
        assert_eq!(s, "f[i] = (sum [j] (mul x[j] U[ji]))\n");
    }

    #[test]
    fn singleton_contraction_has_no_summation() {
        let f = binary(|x, u| x.matmul(u), ["x", "U"]);
        let s = text(&f, &[Shape::from([1]), Shape::from([1, 4])]);
        assert_eq!(s, "f[i] = (mul x U[i])\n");
    }

    #[test]
    fn matrix_product_orders_free_axes() {
        let f = binary(|a, b| a.matmul(b), ["A", "B"]);
        let s = text(&f, &[Shape::from([2, 3]), Shape::from([3, 4])]);
        assert_eq!(s, "f[ij] = (sum [k] (mul A[ik] B[kj]))\n");
    }

    #[test]
    fn broadcast_scalar_has_no_indices() {
        let f = binary(|x, y| x + y, ["x", "y"]);
        let s = text(&f, &[Shape::from([3]), Shape::scalar()]);
        assert_eq!(s, "f[i] = (add x[i] y)\n");
    }

    #[test]
    fn reduction_over_axis() {
        let f = unary(|x| x.sum(&[1]));
        let s = text(&f, &[Shape::from([2, 3])]);
        assert_eq!(s, "f[i] = (sum [j] x[ij])\n");
    }

    #[test]
    fn sibling_reductions_reuse_a_symbol() {
        let f = binary(|x, y| x.sum_all() + y.sum_all(), ["x", "y"]);
        let s = text(&f, &[Shape::from([3]), Shape::from([4])]);
        assert_eq!(s, "f = (add (sum [i] x[i]) (sum [i] y[i]))\n");
    }

    #[test]
    fn transpose_permutes_indices() {
        let f = unary(|u| u.transpose(&[1, 0]));
        let s = text(&f, &[Shape::from([3, 4])]);
        assert_eq!(s, "f[ij] = x[ji]\n");
    }

    #[test]
    fn cast_and_singleton_reshape_are_elided() {
        let f = unary(|x| x.cast("float64").reshape([3, 1]) * 2.0);
        let s = text(&f, &[Shape::from([3])]);
        assert_eq!(s, "f[i] = (mul x[i] 2)\n");
    }

    #[test]
    fn structural_reshape_is_unsupported() {
        let f = unary(|x| x.reshape([6]));
        let err = program(&f, &[Shape::from([2, 3])]).unwrap_err();
        assert_eq!(err.primitive, "reshape");
        assert!(err.detail.is_some());
    }

    #[test]
    fn opaque_primitive_is_unsupported() {
        let f = with_argument_names(
            Function::new("f", |t, a| vec![t.primitive("erf", &[a[0]]) + a[0]]),
            &["x"],
        );
        let err = program(&f, &[Shape::scalar()]).unwrap_err();
        assert_eq!(err.primitive, "erf");
        assert!(err.value.is_some());
    }

    #[test]
    fn named_value_stops_expansion() {
        let f = binary(
            |x, y| {
                let z = (x + y).named("z", None);
                x * (x - y) / z + y
            },
            ["x", "y"],
        );
        let s = text(&f, &[Shape::scalar(), Shape::scalar()]);
        assert_eq!(s, "z = (add x y)\nf = (add (div (mul x (sub x y)) z) y)\n");
    }

    #[test]
    fn second_binding_of_a_value_is_an_alias() {
        let f = unary(|x| {
            let z = x.exp().named("z", None);
            z.named("w", None) * 2.0
        });
        let s = text(&f, &[Shape::scalar()]);
        assert_eq!(s, "z = (exp x)\nw = z\nf = (mul z 2)\n");
    }

    #[test]
    fn gradient_accumulates_terms() {
        let f = binary(|x, y| x * (x - y) / (x + y) + y, ["x", "y"]);
        let p = program(&grad(f, &[0]), &[Shape::scalar(), Shape::scalar()]).unwrap();
        let out = p.outputs().next().unwrap();
        assert_eq!(out.lhs.symbol.name, "\\delta x");
        assert_eq!(out.rhs.term_count(), 3);
    }

    #[test]
    fn equation_lhs_carries_free_indices() {
        let f = unary(|x| x.exp());
        let p = program(&f, &[Shape::from([2, 1, 5])]).unwrap();
        let eq = &p.equations[0];
        assert_eq!(eq.lhs.to_string(), "f[ij]");
        assert_eq!(eq.rhs.to_string(), "(exp x[ij])");
    }
}
