// pipeline.rs — Transcription state and pass orchestration
//
// Holds all pass artifacts and runs the minimal set of passes for a given
// terminal PassId.
//
// Preconditions: the trace is set before calling run_pipeline.
// Postconditions: all artifacts for required passes are populated, or the
//   failing pass is reported.
// Failure modes: the build pass rejecting an unsupported primitive.
// Side effects: calls on_pass_complete after each pass; logs per-pass timing.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::binder::{resolve, NameTable};
use crate::build::build_program;
use crate::diag::{DiagLevel, Diagnostic, TranscribeError, UnsupportedPrimitiveError};
use crate::expr::Program;
use crate::options::TranscribeOptions;
use crate::pass::{descriptor, required_passes, PassId};
use crate::render::render;
use crate::threader::{thread, Threading};
use crate::trace::Trace;

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for reproducible output, printed by
/// `--emit build-info`. Digests are lowercase hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provenance {
    /// Digest of the canonical compact trace JSON.
    pub trace_hash: String,
    /// Digest of the compact options JSON.
    pub options_fingerprint: String,
    /// Crate version from `Cargo.toml`.
    pub tracetex_version: &'static str,
}

impl Provenance {
    /// Pretty-printed JSON with a trailing newline.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self).map(|json| json + "\n")
    }
}

fn sha256_hex(text: &str) -> String {
    use sha2::{Digest, Sha256};

    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Compute provenance from a trace and the options it is rendered with.
///
/// Hashes `Trace::canonical_json()` (compact JSON, values in id order) so the
/// hash is independent of how the trace was produced.
pub fn compute_provenance(
    trace: &Trace,
    options: &TranscribeOptions,
) -> Result<Provenance, serde_json::Error> {
    let canonical = trace.canonical_json()?;
    let options_json = serde_json::to_string(options)?;
    Ok(Provenance {
        trace_hash: sha256_hex(&canonical),
        options_fingerprint: sha256_hex(&options_json),
        tracetex_version: env!("CARGO_PKG_VERSION"),
    })
}

// ── Transcription state ────────────────────────────────────────────────────

/// Holds all transcription artifacts and accumulated diagnostics.
pub struct TranscriptionState {
    pub trace: Trace,
    pub options: TranscribeOptions,
    pub names: Option<NameTable>,
    pub threading: Option<Threading>,
    pub program: Option<Program>,
    pub text: Option<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
}

impl TranscriptionState {
    pub fn new(trace: Trace, options: TranscribeOptions) -> Self {
        Self {
            trace,
            options,
            names: None,
            threading: None,
            program: None,
            text: None,
            diagnostics: Vec::new(),
            has_error: false,
        }
    }

    /// Symbol used for the function on output equations.
    fn function_name(&self) -> &str {
        self.options
            .function_name
            .as_deref()
            .unwrap_or(&self.trace.name)
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution failed in a pass.
#[derive(Debug)]
pub struct PipelineError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
    pub error: UnsupportedPrimitiveError,
}

impl From<PipelineError> for TranscribeError {
    fn from(e: PipelineError) -> Self {
        TranscribeError::UnsupportedPrimitive(e.error)
    }
}

// ── Per-pass bookkeeping ───────────────────────────────────────────────────

/// Per-pass post-processing: callback, accumulate, timing log.
fn finish_pass(
    state: &mut TranscriptionState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: Duration,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) {
    on_pass_complete(pass_id, &diags);
    if diags.iter().any(|d| d.level == DiagLevel::Error) {
        state.has_error = true;
    }
    state.diagnostics.extend(diags);
    let ms = elapsed.as_secs_f64() * 1000.0;
    if state.options.verbose {
        info!(pass = descriptor(pass_id).name, elapsed_ms = ms, "pass complete");
    } else {
        debug!(pass = descriptor(pass_id).name, elapsed_ms = ms, "pass complete");
    }
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → on_pass_complete(callback) → timing log.
///
/// Preconditions: `state.trace` is a complete trace.
/// Postconditions: artifacts for all passes in `required_passes(terminal)`
///   are populated.
/// Failure modes: `PipelineError` when the build pass meets an unsupported
///   primitive; the error is also recorded as a diagnostic.
/// Side effects: calls `on_pass_complete` after each pass.
pub fn run_pipeline(
    state: &mut TranscriptionState,
    terminal: PassId,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    for pass_id in required_passes(terminal) {
        let t = Instant::now();
        match pass_id {
            PassId::Bind => {
                let result = resolve(
                    state.function_name(),
                    &state.trace.arguments,
                    &state.trace.bindings,
                );
                state.names = Some(result.names);
                finish_pass(state, pass_id, result.diagnostics, t.elapsed(), &mut on_pass_complete);
            }
            PassId::Thread => {
                let Some(names) = state.names.as_mut() else {
                    continue;
                };
                let threading = thread(&state.trace, names, &state.options);
                state.threading = Some(threading);
                finish_pass(state, pass_id, Vec::new(), t.elapsed(), &mut on_pass_complete);
            }
            PassId::Build => {
                let (Some(names), Some(threading)) = (&state.names, &state.threading) else {
                    continue;
                };
                match build_program(&state.trace, names, threading, &state.options) {
                    Ok(program) => {
                        state.program = Some(program);
                        finish_pass(state, pass_id, Vec::new(), t.elapsed(), &mut on_pass_complete);
                    }
                    Err(error) => {
                        let diag = TranscribeError::UnsupportedPrimitive(error.clone()).to_diagnostic();
                        finish_pass(state, pass_id, vec![diag], t.elapsed(), &mut on_pass_complete);
                        return Err(PipelineError {
                            failing_pass: pass_id,
                            error,
                        });
                    }
                }
            }
            PassId::Render => {
                let Some(program) = &state.program else {
                    continue;
                };
                state.text = Some(render(&program.equations, &state.options));
                finish_pass(state, pass_id, Vec::new(), t.elapsed(), &mut on_pass_complete);
            }
        }
    }
    Ok(())
}
