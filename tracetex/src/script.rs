// script.rs — Trace scripts: loading `.tts` source into traceable functions
//
// A script is a list of `fn` definitions. Each becomes a `ScriptFunction`
// whose capture evaluates the body against a fresh `Tracer`: operators map
// to the tracer's arithmetic, `expr as z(x, y)` to a named binding, calls to
// other script functions are inlined, builtins map to tensor methods and any
// other call is recorded through the primitive name table.
//
// Preconditions: none.
// Postconditions: `load` returns a script only when it parsed without errors
//   and defines each function and parameter once.
// Failure modes: syntax errors (E0200) and duplicate definitions (E0201) are
//   diagnostics from `load`; undefined names, arity mismatches and recursion
//   are `TraceCaptureError`s at capture time.
// Side effects: none.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::ast::{BinOp, Expr, ExprKind, FnDef, Span, StmtKind};
use crate::diag::{codes, Diagnostic, TraceCaptureError};
use crate::id::ValueId;
use crate::ir::Shape;
use crate::parser::parse;
use crate::trace::{Traceable, Traced, Tracer};

// ── Script ──────────────────────────────────────────────────────────────────

/// The functions defined by one script, in definition order.
#[derive(Debug, Clone)]
pub struct Script {
    functions: Vec<ScriptFunction>,
}

impl Script {
    pub fn functions(&self) -> &[ScriptFunction] {
        &self.functions
    }

    pub fn function(&self, name: &str) -> Option<&ScriptFunction> {
        self.functions.iter().find(|f| f.name() == name)
    }

    /// The last function defined: helpers come first, the function to
    /// transcribe last.
    pub fn entry(&self) -> Option<&ScriptFunction> {
        self.functions.last()
    }
}

/// One `fn` definition of a script, traceable on its own.
#[derive(Debug, Clone)]
pub struct ScriptFunction {
    defs: Rc<[FnDef]>,
    index: usize,
}

impl ScriptFunction {
    fn def(&self) -> &FnDef {
        &self.defs[self.index]
    }

    pub fn param_names(&self) -> Vec<&str> {
        self.def()
            .params
            .iter()
            .map(|p| p.name.name.as_str())
            .collect()
    }

    /// Shapes declared in the signature (`x: [3, 4]`), scalars otherwise.
    pub fn example_shapes(&self) -> Vec<Shape> {
        self.def()
            .params
            .iter()
            .map(|p| Shape::new(p.shape.clone()))
            .collect()
    }

    pub fn argument_position(&self, name: &str) -> Option<usize> {
        self.def().params.iter().position(|p| p.name.name == name)
    }
}

impl Traceable for ScriptFunction {
    fn name(&self) -> &str {
        &self.def().name.name
    }

    fn capture(&self, example: &[Shape]) -> Result<crate::trace::Trace, TraceCaptureError> {
        let def = self.def();
        if example.len() != def.params.len() {
            return Err(TraceCaptureError::new(format!(
                "function `{}` takes {} argument(s) but was traced with {}",
                def.name.name,
                def.params.len(),
                example.len()
            )));
        }
        let tracer = Tracer::new();
        let outputs: Vec<ValueId> = {
            let args: Vec<Traced<'_>> = def
                .params
                .iter()
                .zip(example)
                .map(|(p, shape)| tracer.argument(shape.clone(), Some(&p.name.name)))
                .collect();
            let mut eval = Evaluator {
                tracer: &tracer,
                defs: &self.defs,
                stack: vec![def.name.name.clone()],
            };
            eval.call_body(def, &args)?
                .into_iter()
                .map(|v| v.id())
                .collect()
        };
        tracer.finish(&def.name.name, outputs)
    }
}

// ── Loading ─────────────────────────────────────────────────────────────────

/// Parse a script and check its definitions.
pub fn load(source: &str) -> Result<Script, Vec<Diagnostic>> {
    let result = parse(source);
    let mut diagnostics: Vec<Diagnostic> = result
        .errors
        .iter()
        .map(|e| {
            Diagnostic::error(e.to_string())
                .with_code(codes::E0200)
                .with_span(*e.span())
        })
        .collect();
    let Some(file) = result.file else {
        return Err(diagnostics);
    };

    let mut seen: HashMap<&str, Span> = HashMap::new();
    for def in &file.functions {
        check_unique(&mut seen, &def.name.name, def.name.span, "function", &mut diagnostics);
        let mut params: HashMap<&str, Span> = HashMap::new();
        for p in &def.params {
            check_unique(&mut params, &p.name.name, p.name.span, "parameter", &mut diagnostics);
        }
    }
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(diagnostics);
    }

    debug!(functions = file.functions.len(), "script loaded");
    let defs: Rc<[FnDef]> = file.functions.into();
    let functions = (0..defs.len())
        .map(|index| ScriptFunction {
            defs: Rc::clone(&defs),
            index,
        })
        .collect();
    Ok(Script { functions })
}

fn check_unique<'a>(
    seen: &mut HashMap<&'a str, Span>,
    name: &'a str,
    span: Span,
    what: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match seen.entry(name) {
        Entry::Occupied(first) => {
            let first = *first.get();
            diagnostics.push(
                Diagnostic::error(format!("{what} `{name}` is defined more than once"))
                    .with_code(codes::E0201)
                    .with_span(span)
                    .with_hint(format!("first defined at {}..{}", first.start, first.end)),
            );
        }
        Entry::Vacant(slot) => {
            slot.insert(span);
        }
    }
}

// ── Evaluation ──────────────────────────────────────────────────────────────

fn error_at(span: Span, message: impl std::fmt::Display) -> TraceCaptureError {
    TraceCaptureError::new(format!("{message} (at {}..{})", span.start, span.end))
}

type Scope<'t> = HashMap<String, Traced<'t>>;

struct Evaluator<'a, 't> {
    tracer: &'t Tracer,
    defs: &'a [FnDef],
    /// Script functions currently being inlined, outermost first.
    stack: Vec<String>,
}

impl<'a, 't> Evaluator<'a, 't> {
    /// Run a function body with `args` bound to its parameters and return
    /// the values of its `return` statement.
    fn call_body(
        &mut self,
        def: &FnDef,
        args: &[Traced<'t>],
    ) -> Result<Vec<Traced<'t>>, TraceCaptureError> {
        let mut scope: Scope<'t> = def
            .params
            .iter()
            .zip(args)
            .map(|(p, v)| (p.name.name.clone(), *v))
            .collect();
        for stmt in &def.body {
            match &stmt.kind {
                StmtKind::Let { name, value } => {
                    let v = self.eval(value, &scope)?;
                    scope.insert(name.name.clone(), v);
                }
                StmtKind::Return(values) => {
                    return values.iter().map(|e| self.eval(e, &scope)).collect();
                }
            }
        }
        Err(error_at(
            def.span,
            format!("function `{}` has no return statement", def.name.name),
        ))
    }

    fn eval(&mut self, expr: &Expr, scope: &Scope<'t>) -> Result<Traced<'t>, TraceCaptureError> {
        match &expr.kind {
            ExprKind::Number(v) => Ok(self.tracer.literal(*v)),
            ExprKind::Dims(_) => Err(error_at(
                expr.span,
                "a dimension list is only valid as a shape or permutation argument",
            )),
            ExprKind::Var(id) => scope
                .get(&id.name)
                .copied()
                .ok_or_else(|| error_at(id.span, format!("undefined name `{}`", id.name))),
            ExprKind::Neg(operand) => Ok(-self.eval(operand, scope)?),
            ExprKind::Binary(op, lhs, rhs) => {
                let a = self.eval(lhs, scope)?;
                let b = self.eval(rhs, scope)?;
                Ok(match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    BinOp::MatMul => a.matmul(b),
                    BinOp::Pow => a.pow(b),
                    BinOp::Lt => a.lt(b),
                    BinOp::Le => a.le(b),
                    BinOp::Gt => a.gt(b),
                    BinOp::Ge => a.ge(b),
                    BinOp::Eq => a.eq(b),
                    BinOp::Ne => a.ne(b),
                })
            }
            ExprKind::Call(name, args) => self.call(&name.name, name.span, args, scope),
            ExprKind::Named {
                value,
                name,
                depends_on,
            } => {
                let v = self.eval(value, scope)?;
                let deps = match depends_on {
                    Some(ids) => Some(
                        ids.iter()
                            .map(|id| {
                                scope.get(&id.name).copied().ok_or_else(|| {
                                    error_at(id.span, format!("undefined name `{}`", id.name))
                                })
                            })
                            .collect::<Result<Vec<_>, _>>()?,
                    ),
                    None => None,
                };
                Ok(v.named(&name.name, deps.as_deref()))
            }
        }
    }

    fn call(
        &mut self,
        name: &str,
        span: Span,
        args: &[Expr],
        scope: &Scope<'t>,
    ) -> Result<Traced<'t>, TraceCaptureError> {
        let defs = self.defs;
        if let Some(def) = defs.iter().find(|d| d.name.name == name) {
            return self.inline(def, span, args, scope);
        }
        match name {
            "relu" | "exp" | "log" | "sin" | "cos" | "tanh" | "sqrt" | "cast" => {
                let [arg] = args else {
                    return Err(error_at(span, format!("`{name}` takes 1 argument")));
                };
                let v = self.eval(arg, scope)?;
                Ok(match name {
                    "relu" => v.relu(),
                    "exp" => v.exp(),
                    "log" => v.log(),
                    "sin" => v.sin(),
                    "cos" => v.cos(),
                    "tanh" => v.tanh(),
                    "sqrt" => v.sqrt(),
                    _ => v.cast("float32"),
                })
            }
            "sum" => {
                let Some((first, axes)) = args.split_first() else {
                    return Err(error_at(span, "`sum` takes a value and optional axes"));
                };
                let v = self.eval(first, scope)?;
                if axes.is_empty() {
                    return Ok(v.sum_all());
                }
                let axes = axes.iter().map(axis).collect::<Result<Vec<_>, _>>()?;
                Ok(v.sum(&axes))
            }
            "transpose" => match args {
                [arg] => {
                    let v = self.eval(arg, scope)?;
                    let reversed: Vec<usize> = (0..v.shape().rank()).rev().collect();
                    Ok(v.transpose(&reversed))
                }
                [arg, perm] => {
                    let v = self.eval(arg, scope)?;
                    Ok(v.transpose(&dims(perm)?))
                }
                _ => Err(error_at(span, "`transpose` takes a value and an optional permutation")),
            },
            "reshape" | "broadcast" => {
                let [arg, target] = args else {
                    return Err(error_at(span, format!("`{name}` takes a value and a shape")));
                };
                let v = self.eval(arg, scope)?;
                let target = Shape::new(dims(target)?);
                Ok(if name == "reshape" {
                    v.reshape(target)
                } else {
                    v.broadcast_to(target)
                })
            }
            _ => {
                let values = args
                    .iter()
                    .map(|a| self.eval(a, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.tracer.primitive(name, &values))
            }
        }
    }

    /// Inline a call to another script function.
    fn inline(
        &mut self,
        def: &FnDef,
        span: Span,
        args: &[Expr],
        scope: &Scope<'t>,
    ) -> Result<Traced<'t>, TraceCaptureError> {
        let name = &def.name.name;
        if self.stack.contains(name) {
            return Err(error_at(span, format!("recursive call to `{name}`")));
        }
        if args.len() != def.params.len() {
            return Err(error_at(
                span,
                format!(
                    "`{name}` takes {} argument(s), got {}",
                    def.params.len(),
                    args.len()
                ),
            ));
        }
        let values = args
            .iter()
            .map(|a| self.eval(a, scope))
            .collect::<Result<Vec<_>, _>>()?;
        self.stack.push(name.clone());
        let results = self.call_body(def, &values);
        self.stack.pop();
        match results?.as_slice() {
            [single] => Ok(*single),
            many => Err(error_at(
                span,
                format!(
                    "`{name}` returns {} values; only single-valued functions can be called",
                    many.len()
                ),
            )),
        }
    }
}

/// A non-negative integer literal used as an axis.
fn axis(expr: &Expr) -> Result<usize, TraceCaptureError> {
    match expr.kind {
        ExprKind::Number(v) if v >= 0.0 && v.fract() == 0.0 => Ok(v as usize),
        _ => Err(error_at(expr.span, "expected an axis number")),
    }
}

fn dims(expr: &Expr) -> Result<Vec<usize>, TraceCaptureError> {
    match &expr.kind {
        ExprKind::Dims(d) => Ok(d.clone()),
        _ => Err(error_at(expr.span, "expected a dimension list like `[2, 3]`")),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
