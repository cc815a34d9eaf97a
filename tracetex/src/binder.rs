// binder.rs — User-declared names and their display symbols
//
// Records bindings (name, target value, declared dependencies) while a
// function is traced, and resolves them into display symbols once the trace is
// complete.
//
// Preconditions: binding targets and dependencies exist in the graph.
// Postconditions: every argument and every bound value has a symbol.
// Failure modes: `TraceCaptureError` for an empty name, a missing value, or a
//   dependency that is neither an argument nor an earlier named value.
// Side effects: `debug!` for each binding and each ambiguous base name (the
//   ambiguity itself is reported as a `W0100` diagnostic).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::diag::{codes, Diagnostic, TraceCaptureError};
use crate::expr::Symbol;
use crate::id::{BindingId, IdAllocator, ValueId};
use crate::ir::Graph;

// ── Bindings ────────────────────────────────────────────────────────────────

/// A user-declared name for a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub id: BindingId,
    pub name: String,
    pub value: ValueId,
    /// Declared dependency values, in declaration order. `None` means the
    /// author did not say what the value depends on.
    pub depends_on: Option<Vec<ValueId>>,
}

/// A function input and its formal parameter name, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Argument {
    pub value: ValueId,
    pub name: Option<String>,
    /// Tangent or cotangent input added by a differentiation transform.
    /// These are named after their primal, not positionally.
    #[serde(default, skip_serializing_if = "is_false")]
    pub derivative: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Collects bindings in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Binder {
    bindings: Vec<Binding>,
    bound: HashSet<ValueId>,
    ids: IdAllocator,
}

impl Binder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a binding after checking it against `graph`.
    pub fn bind(
        &mut self,
        graph: &Graph,
        value: ValueId,
        name: &str,
        depends_on: Option<Vec<ValueId>>,
    ) -> Result<BindingId, TraceCaptureError> {
        if name.trim().is_empty() {
            return Err(TraceCaptureError::new("binding name must not be empty"));
        }
        if graph.get(value).is_none() {
            return Err(TraceCaptureError::new(format!(
                "binding `{name}` refers to unknown value {value}"
            )));
        }
        for &dep in depends_on.iter().flatten() {
            let Some(dep_value) = graph.get(dep) else {
                return Err(TraceCaptureError::new(format!(
                    "binding `{name}` depends on unknown value {dep}"
                )));
            };
            if !dep_value.is_leaf() && !self.bound.contains(&dep) {
                return Err(TraceCaptureError::new(format!(
                    "binding `{name}` depends on {dep}, which is neither an argument nor a named value"
                )));
            }
        }
        let id = self.ids.alloc_binding();
        self.bound.insert(value);
        self.bindings.push(Binding {
            id,
            name: name.to_string(),
            value,
            depends_on,
        });
        Ok(id)
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn into_bindings(self) -> Vec<Binding> {
        self.bindings
    }

    /// Rebuild a binder by replaying `bindings` against `graph`, revalidating
    /// each one. Ids are reassigned in order.
    pub fn replay(graph: &Graph, bindings: &[Binding]) -> Result<Self, TraceCaptureError> {
        let mut binder = Binder::new();
        for b in bindings {
            binder.bind(graph, b.value, &b.name, b.depends_on.clone())?;
        }
        Ok(binder)
    }
}

// ── Name resolution ─────────────────────────────────────────────────────────

/// How a binding renders.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundName {
    pub binding: BindingId,
    pub value: ValueId,
    pub symbol: Symbol,
    /// The first binding of a value owns its symbol; later bindings of the
    /// same value render as aliases.
    pub owns_value: bool,
}

/// Display symbols for values.
#[derive(Debug, Clone, Default)]
pub struct NameTable {
    symbols: HashMap<ValueId, Symbol>,
    bound: Vec<BoundName>,
    function: Symbol,
}

impl NameTable {
    pub fn symbol(&self, value: ValueId) -> Option<&Symbol> {
        self.symbols.get(&value)
    }

    pub fn has_symbol(&self, value: ValueId) -> bool {
        self.symbols.contains_key(&value)
    }

    /// Assign a symbol unless the value already has one. Returns whether the
    /// symbol was assigned.
    pub fn assign(&mut self, value: ValueId, symbol: Symbol) -> bool {
        if self.symbols.contains_key(&value) {
            return false;
        }
        self.symbols.insert(value, symbol);
        true
    }

    /// Bindings in declaration order.
    pub fn bound(&self) -> &[BoundName] {
        &self.bound
    }

    /// Whether `value` is the target of an owning binding.
    pub fn is_bound(&self, value: ValueId) -> bool {
        self.bound.iter().any(|b| b.owns_value && b.value == value)
    }

    /// The symbol for the function itself (used for output equations).
    pub fn function(&self) -> &Symbol {
        &self.function
    }
}

/// Result of name resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub names: NameTable,
    pub diagnostics: Vec<Diagnostic>,
}

/// Placeholder for the argument at `position` when no formal name is known:
/// `a`, `b`, …, `z`, then `a'`, `b'`, ….
pub fn placeholder(position: usize) -> String {
    let letter = (b'a' + (position % 26) as u8) as char;
    let mut name = letter.to_string();
    for _ in 0..position / 26 {
        name.push('\'');
    }
    name
}

/// Resolve display symbols for arguments and bindings.
///
/// Bindings are grouped by base name. A group renders in function notation
/// `name(dep, …)` when every member declares a non-empty dependency set and
/// no two members declare the same set; otherwise every member renders as the
/// bare name and a `W0100` warning is emitted for groups of two or more.
pub fn resolve(function: &str, arguments: &[Argument], bindings: &[Binding]) -> Resolution {
    let mut names = NameTable {
        function: Symbol::plain(function),
        ..NameTable::default()
    };
    let mut diagnostics = Vec::new();

    let primal_arguments = arguments.iter().filter(|a| !a.derivative);
    for (position, arg) in primal_arguments.enumerate() {
        let name = arg.name.clone().unwrap_or_else(|| placeholder(position));
        names.assign(arg.value, Symbol::plain(name));
    }
    for arg in arguments.iter().filter(|a| a.derivative) {
        if let Some(name) = &arg.name {
            names.assign(arg.value, Symbol::plain(name.clone()));
        }
    }

    // Groups in order of first appearance.
    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, Vec<&Binding>> = HashMap::new();
    for b in bindings {
        let members = groups.entry(b.name.as_str()).or_default();
        if members.is_empty() {
            order.push(b.name.as_str());
        }
        members.push(b);
    }

    let mut functional: HashMap<&str, bool> = HashMap::new();
    for name in &order {
        let members = &groups[name];
        let distinct = is_distinguishable(members);
        if !distinct && members.len() > 1 {
            let mut diag = Diagnostic::warning(format!(
                "{} bindings share the name `{}` without distinct dependencies",
                members.len(),
                name
            ))
            .with_code(codes::W0100)
            .with_hint("pass `depends_on` to each binding to render them as functions");
            for m in members.iter() {
                diag = diag.with_value(m.value);
            }
            debug!(name = %name, count = members.len(), "ambiguous binding name");
            diagnostics.push(diag);
        }
        functional.insert(*name, distinct);
    }

    for b in bindings {
        let symbol = if functional.get(b.name.as_str()).copied().unwrap_or(false) {
            let deps = b
                .depends_on
                .iter()
                .flatten()
                .map(|dep| {
                    names
                        .symbol(*dep)
                        .map(|s| s.name.clone())
                        .unwrap_or_else(|| dep.to_string())
                })
                .collect();
            Symbol::with_deps(b.name.clone(), deps)
        } else {
            Symbol::plain(b.name.clone())
        };
        let owns_value = names.assign(b.value, symbol.clone());
        debug!(binding = b.id.0, value = %b.value, owns_value, "bound `{}`", b.name);
        names.bound.push(BoundName {
            binding: b.id,
            value: b.value,
            symbol,
            owns_value,
        });
    }

    Resolution { names, diagnostics }
}

fn is_distinguishable(members: &[&Binding]) -> bool {
    let mut seen: Vec<Vec<ValueId>> = Vec::with_capacity(members.len());
    for m in members {
        let Some(deps) = &m.depends_on else {
            return false;
        };
        if deps.is_empty() {
            return false;
        }
        let mut set = deps.clone();
        set.sort();
        set.dedup();
        if seen.contains(&set) {
            return false;
        }
        seen.push(set);
    }
    true
}
