// options.rs — Transcription options
//
// Everything about the output text that a caller may reasonably want to
// change. Loaded from JSON (`--config`) with every field optional; command
// line flags override individual fields afterwards.
//
// Preconditions: none.
// Postconditions: `TranscribeOptions::default()` reproduces the standard
//   notation (` \\` line breaks, `d`/`\delta ` prefixes, `i j k …` indices).
// Failure modes: `load_options` reports unreadable or malformed files.
// Side effects: `load_options` reads one file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::index::DEFAULT_ALPHABET;

/// Output settings for a transcription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TranscribeOptions {
    /// Placed between consecutive equations.
    pub line_separator: String,
    /// Prefix for tangent (forward-mode) quantities.
    pub tangent_prefix: String,
    /// Prefix for cotangent (reverse-mode) quantities.
    pub cotangent_prefix: String,
    /// Ordered letters used for index symbols.
    pub index_alphabet: String,
    /// Symbol used for output equations instead of the function's own name.
    pub function_name: Option<String>,
    /// Log per-pass timing at INFO level.
    pub verbose: bool,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        TranscribeOptions {
            line_separator: " \\\\\n".to_string(),
            tangent_prefix: "d".to_string(),
            cotangent_prefix: "\\delta ".to_string(),
            index_alphabet: DEFAULT_ALPHABET.to_string(),
            function_name: None,
            verbose: false,
        }
    }
}

impl TranscribeOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Read options from a JSON file.
pub fn load_options(path: &Path) -> Result<TranscribeOptions, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read config {}: {e}", path.display()))?;
    TranscribeOptions::from_json(&text)
        .map_err(|e| format!("invalid config {}: {e}", path.display()))
}
