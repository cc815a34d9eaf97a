// diag.rs — Error types and the unified diagnostics model
//
// Hard failures (`TraceCaptureError`, `UnsupportedPrimitiveError`) abort a
// transcription; `Diagnostic` carries non-fatal findings (naming ambiguity)
// and script front-end errors with source spans.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::ast::Span;
use crate::id::ValueId;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0001`, `W0100`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    /// The tracer could not produce a graph.
    pub const E0001: DiagCode = DiagCode("E0001");
    /// An operation kind has no rendering rule.
    pub const E0100: DiagCode = DiagCode("E0100");
    /// Script syntax error.
    pub const E0200: DiagCode = DiagCode("E0200");
    /// Script defines a function or parameter twice.
    pub const E0201: DiagCode = DiagCode("E0201");
    /// Bindings share a base name without distinguishing dependencies.
    pub const W0100: DiagCode = DiagCode("W0100");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted by any phase.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub message: String,
    pub hint: Option<String>,
    /// Script source location, when the diagnostic comes from the front-end.
    pub span: Option<Span>,
    /// Graph values the diagnostic refers to.
    pub values: Vec<ValueId>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, span, or values.
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            message: message.into(),
            hint: None,
            span: None,
            values: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, message)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a script source span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Attach a graph value the diagnostic refers to.
    pub fn with_value(mut self, value: ValueId) -> Self {
        self.values.push(value);
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(span) = &self.span {
            write!(f, " (at {}..{})", span.start, span.end)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

// ── Hard failures ────────────────────────────────────────────────────────

/// The tracer could not produce an operation graph.
///
/// Carries the tracer's own message verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TraceCaptureError {
    pub message: String,
}

impl TraceCaptureError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The graph contains an operation with no rendering rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported primitive `{primitive}`{}", detail_suffix(.detail))]
pub struct UnsupportedPrimitiveError {
    pub primitive: String,
    pub value: Option<ValueId>,
    pub detail: Option<String>,
}

impl UnsupportedPrimitiveError {
    pub fn new(primitive: impl Into<String>) -> Self {
        Self {
            primitive: primitive.into(),
            value: None,
            detail: None,
        }
    }

    pub fn at(mut self, value: ValueId) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default()
}

/// Any failure of a `transcribe` call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscribeError {
    #[error("trace capture failed: {0}")]
    TraceCapture(#[from] TraceCaptureError),
    #[error(transparent)]
    UnsupportedPrimitive(#[from] UnsupportedPrimitiveError),
}

impl TranscribeError {
    /// Stable diagnostic code for this failure.
    pub fn code(&self) -> DiagCode {
        match self {
            TranscribeError::TraceCapture(_) => codes::E0001,
            TranscribeError::UnsupportedPrimitive(_) => codes::E0100,
        }
    }

    /// Convert into an error-level diagnostic for uniform reporting.
    pub fn to_diagnostic(&self) -> Diagnostic {
        let mut diag = Diagnostic::error(self.to_string()).with_code(self.code());
        if let TranscribeError::UnsupportedPrimitive(err) = self {
            if let Some(value) = err.value {
                diag = diag.with_value(value);
            }
            diag = diag.with_hint("only primitives with a rendering rule can be transcribed");
        }
        diag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_code() {
        let d = Diagnostic::error("something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code() {
        let d = Diagnostic::warning("ambiguous name `z`").with_code(codes::W0100);
        assert_eq!(format!("{d}"), "warning[W0100]: ambiguous name `z`");
    }

    #[test]
    fn builder_chain() {
        let d = Diagnostic::error("unknown name")
            .with_code(codes::E0200)
            .with_hint("declare it as a parameter")
            .with_value(ValueId(3));

        assert_eq!(d.code, Some(codes::E0200));
        assert_eq!(d.hint.as_deref(), Some("declare it as a parameter"));
        assert_eq!(d.values, vec![ValueId(3)]);
        assert!(d.is_error());
    }

    #[test]
    fn unsupported_primitive_names_the_kind() {
        let err = UnsupportedPrimitiveError::new("sort").at(ValueId(4));
        assert_eq!(err.to_string(), "unsupported primitive `sort`");
        let err = UnsupportedPrimitiveError::new("reshape").with_detail("merges axes 3 and 4");
        assert_eq!(
            err.to_string(),
            "unsupported primitive `reshape`: merges axes 3 and 4"
        );
    }

    #[test]
    fn transcribe_error_codes() {
        let capture: TranscribeError = TraceCaptureError::new("shape mismatch").into();
        assert_eq!(capture.code(), codes::E0001);
        assert_eq!(capture.to_string(), "trace capture failed: shape mismatch");

        let unsupported: TranscribeError = UnsupportedPrimitiveError::new("cumsum").into();
        assert_eq!(unsupported.code(), codes::E0100);
        assert!(unsupported.to_diagnostic().hint.is_some());
    }
}
