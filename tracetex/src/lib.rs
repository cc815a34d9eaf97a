// tracetex — trace-to-equation transcription
//
// Library root. A function is captured into an operation graph (`trace`,
// optionally differentiated by `autodiff`), then the pass pipeline binds
// names, threads derivative quantities, builds indexed expressions and
// renders them as LaTeX equations.

pub mod ast;
pub mod autodiff;
pub mod binder;
pub mod build;
pub mod diag;
pub mod expr;
pub mod id;
pub mod index;
pub mod ir;
pub mod lexer;
pub mod options;
pub mod parser;
pub mod pass;
pub mod pipeline;
pub mod primitives;
pub mod render;
pub mod script;
pub mod threader;
pub mod trace;

pub use autodiff::{grad, jvp, vjp};
pub use diag::{Diagnostic, TraceCaptureError, TranscribeError, UnsupportedPrimitiveError};
pub use ir::Shape;
pub use options::TranscribeOptions;
pub use trace::{capture, named, with_argument_names, Function, Trace, Traceable, Traced, Tracer};

use crate::expr::Program;
use crate::pass::PassId;
use crate::pipeline::{run_pipeline, TranscriptionState};

/// The result of a successful transcription.
#[derive(Debug, Clone)]
pub struct Transcription {
    /// Rendered equations joined by the line separator.
    pub text: String,
    pub program: Program,
    /// Non-fatal findings (e.g. ambiguous binding names).
    pub diagnostics: Vec<Diagnostic>,
}

/// Trace `function` on arguments of the given shapes and render it with the
/// default notation.
pub fn transcribe<F: Traceable + ?Sized>(
    function: &F,
    example: &[Shape],
) -> Result<String, TranscribeError> {
    transcribe_with(function, example, &TranscribeOptions::default()).map(|t| t.text)
}

/// Like [`transcribe`], with explicit options and the full result.
pub fn transcribe_with<F: Traceable + ?Sized>(
    function: &F,
    example: &[Shape],
    options: &TranscribeOptions,
) -> Result<Transcription, TranscribeError> {
    let trace = capture(function, example)?;
    transcribe_trace(trace, options)
}

/// Transcribe an already captured (or imported) trace.
pub fn transcribe_trace(
    trace: Trace,
    options: &TranscribeOptions,
) -> Result<Transcription, TranscribeError> {
    let mut state = TranscriptionState::new(trace, options.clone());
    run_pipeline(&mut state, PassId::Render, |_, _| {})?;
    Ok(Transcription {
        text: state.text.unwrap_or_default(),
        program: state.program.unwrap_or_default(),
        diagnostics: state.diagnostics,
    })
}
