// threader.rs — Naming of tangent and cotangent quantities
//
// Walks the derivative tags of a trace and gives derivative quantities the
// symbol of their primal with a `d` (tangent) or `\delta ` (cotangent)
// prefix. Values that belong to the primal computation keep their own
// rendering even when a tag says they also equal some derivative; only
// derivative inputs and values created by the differentiation are renamed.
//
// Preconditions: `names` was resolved from the same trace.
// Postconditions: every argument has a symbol; every bound primal with a
//   non-leaf derivative value has exactly one derivative equation per kind.
// Failure modes: none.
// Side effects: `debug!` for each symbol assigned.

use std::collections::HashSet;

use tracing::debug;

use crate::binder::{placeholder, NameTable};
use crate::expr::Symbol;
use crate::id::ValueId;
use crate::ir::{DerivativeKind, DerivativeTag, Graph, OpKind};
use crate::options::TranscribeOptions;
use crate::trace::Trace;

/// A derivative equation for a bound primal: `symbol = expansion(value)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivativeEquation {
    pub kind: DerivativeKind,
    pub primal: ValueId,
    pub value: ValueId,
    pub symbol: Symbol,
}

/// Result of threading: derivative equations plus what is needed to label
/// output equations.
#[derive(Debug, Clone)]
pub struct Threading {
    /// In tag order.
    pub derivatives: Vec<DerivativeEquation>,
    /// Values that stand for "the function" (its primal outputs), in order.
    function_primals: Vec<ValueId>,
    function: Symbol,
    tangent_prefix: String,
    cotangent_prefix: String,
}

impl Threading {
    pub fn prefix(&self, kind: DerivativeKind) -> &str {
        match kind {
            DerivativeKind::Tangent => &self.tangent_prefix,
            DerivativeKind::Cotangent => &self.cotangent_prefix,
        }
    }

    /// The function's symbol for `primal` if it is one of the function's
    /// outputs; suffixed `^{(k)}` when there are several.
    pub fn function_symbol(&self, primal: ValueId) -> Option<Symbol> {
        let position = self.function_primals.iter().position(|p| *p == primal)?;
        if self.function_primals.len() == 1 {
            return Some(self.function.clone());
        }
        Some(Symbol {
            name: format!("{}^{{({})}}", self.function.name, position + 1),
            deps: self.function.deps.clone(),
        })
    }

    /// How `primal` is called when naming its derivatives.
    pub fn primal_symbol(&self, names: &NameTable, primal: ValueId) -> Option<Symbol> {
        names
            .symbol(primal)
            .cloned()
            .or_else(|| self.function_symbol(primal))
    }

    /// Left-hand side symbol of the output equation for `output`.
    ///
    /// Tangent outputs are derivatives of the function (`df`); cotangent
    /// outputs are derivatives with respect to an argument (`\delta x`).
    pub fn output_symbol(&self, trace: &Trace, names: &NameTable, output: ValueId) -> Symbol {
        let Some(tag) = trace.last_tag_of(output) else {
            return self
                .function_symbol(output)
                .unwrap_or_else(|| self.function.clone());
        };
        let base = match tag.kind {
            DerivativeKind::Tangent => self
                .function_symbol(tag.primal)
                .or_else(|| names.symbol(tag.primal).cloned()),
            DerivativeKind::Cotangent => self.primal_symbol(names, tag.primal),
        };
        base.unwrap_or_else(|| self.function.clone())
            .prefixed(self.prefix(tag.kind))
    }

    /// Derivative equations of `primal` of the given kind.
    pub fn equations_for(
        &self,
        kind: DerivativeKind,
        primal: ValueId,
    ) -> impl Iterator<Item = &DerivativeEquation> {
        self.derivatives
            .iter()
            .filter(move |d| d.kind == kind && d.primal == primal)
    }
}

// ── Threading ───────────────────────────────────────────────────────────────

/// Assign derivative symbols and collect derivative equations.
pub fn thread(trace: &Trace, names: &mut NameTable, options: &TranscribeOptions) -> Threading {
    let graph = &trace.graph;
    let mut threading = Threading {
        derivatives: Vec::new(),
        function_primals: function_primals(trace),
        function: names.function().clone(),
        tangent_prefix: options.tangent_prefix.clone(),
        cotangent_prefix: options.cotangent_prefix.clone(),
    };
    let primal = primal_closure(trace, names);

    for tag in &trace.tags {
        let value = graph.value(tag.value);
        if value.literal().is_some() || names.has_symbol(tag.value) {
            continue;
        }
        if !value.is_leaf() && primal[tag.value.index()] {
            continue;
        }
        let base = if value.is_leaf() && tag.kind == DerivativeKind::Cotangent {
            // A cotangent seed stands for the derivative of the function.
            threading
                .function_symbol(tag.primal)
                .or_else(|| names.symbol(tag.primal).cloned())
        } else {
            threading.primal_symbol(names, tag.primal)
        };
        let Some(base) = base else { continue };
        let symbol = base.prefixed(threading.prefix(tag.kind));
        debug!(value = %tag.value, primal = %tag.primal, "derivative symbol `{}`", symbol.name);
        names.assign(tag.value, symbol);
    }

    // Derivative inputs nothing could name (imported traces only).
    for (position, arg) in trace.arguments.iter().enumerate() {
        if !names.has_symbol(arg.value) {
            names.assign(arg.value, Symbol::plain(placeholder(position)));
        }
    }

    let mut seen: HashSet<(DerivativeKind, ValueId)> = HashSet::new();
    for tag in &trace.tags {
        if !names.is_bound(tag.primal) || graph.value(tag.value).is_leaf() {
            continue;
        }
        if !seen.insert((tag.kind, tag.primal)) {
            continue;
        }
        let Some(primal_symbol) = names.symbol(tag.primal) else {
            continue;
        };
        threading.derivatives.push(DerivativeEquation {
            kind: tag.kind,
            primal: tag.primal,
            value: tag.value,
            symbol: primal_symbol.prefixed(threading.prefix(tag.kind)),
        });
    }
    threading
}

/// Outputs that are not derivative quantities, then primals of cotangent
/// seeds (the outputs of a function differentiated in reverse mode).
fn function_primals(trace: &Trace) -> Vec<ValueId> {
    let mut primals: Vec<ValueId> = Vec::new();
    for &output in &trace.outputs {
        if trace.last_tag_of(output).is_none() && !primals.contains(&output) {
            primals.push(output);
        }
    }
    for tag in seed_tags(trace) {
        if !primals.contains(&tag.primal) {
            primals.push(tag.primal);
        }
    }
    primals
}

fn seed_tags(trace: &Trace) -> impl Iterator<Item = &DerivativeTag> {
    trace.tags.iter().filter(|t| {
        t.kind == DerivativeKind::Cotangent && trace.graph.value(t.value).is_leaf()
    })
}

/// Values of the primal computation: everything a tag's primal or a bound
/// value is computed from.
fn primal_closure(trace: &Trace, names: &NameTable) -> Vec<bool> {
    let graph = &trace.graph;
    let mut marked = vec![false; graph.len()];
    let mut stack: Vec<ValueId> = trace
        .tags
        .iter()
        .map(|t| t.primal)
        .chain(names.bound().iter().map(|b| b.value))
        .collect();
    while let Some(id) = stack.pop() {
        if marked[id.index()] {
            continue;
        }
        marked[id.index()] = true;
        if let Some(op) = graph.value(id).op() {
            stack.extend(op.operands.iter().copied());
        }
    }
    marked
}

// ── Accumulation ────────────────────────────────────────────────────────────

/// Flatten the `add_any` chain rooted at `root` into its contributions, in
/// the order they were produced. Named intermediate accumulations are kept
/// as single terms.
pub fn accumulation_terms(graph: &Graph, root: ValueId, names: &NameTable) -> Vec<ValueId> {
    let mut terms = Vec::new();
    if is_accumulation(graph, root) {
        collect_terms(graph, root, names, &mut terms);
    } else {
        terms.push(root);
    }
    terms
}

fn is_accumulation(graph: &Graph, id: ValueId) -> bool {
    matches!(graph.value(id).op(), Some(op) if op.kind == OpKind::AddAny)
}

fn collect_terms(graph: &Graph, id: ValueId, names: &NameTable, out: &mut Vec<ValueId>) {
    let Some(op) = graph.value(id).op() else {
        return;
    };
    for &operand in &op.operands {
        if is_accumulation(graph, operand) && !names.has_symbol(operand) {
            collect_terms(graph, operand, names, out);
        } else {
            out.push(operand);
        }
    }
}
