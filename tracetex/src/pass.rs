// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the transcription passes (trace capture is outside the runner),
// their dependency edges, and the artifacts they produce. Used by the
// pipeline runner to compute minimal pass subsets for each --emit target.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each transcription pass. Capture happens before the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Bind,
    Thread,
    Build,
    Render,
}

/// Machine-readable artifact identifiers. Each maps to a concrete type
/// in the transcription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Names,     // NameTable
    Threading, // Threading
    Program,   // Program
    Text,      // String
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a transcription pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// Postconditions (documentation only).
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Bind => PassDescriptor {
            name: "bind",
            inputs: &[],
            outputs: &[ArtifactId::Names],
            invariants: "every primal argument and bound value has a symbol",
        },
        PassId::Thread => PassDescriptor {
            name: "thread",
            inputs: &[PassId::Bind],
            outputs: &[ArtifactId::Names, ArtifactId::Threading],
            invariants: "derivative quantities named, derivative equations collected",
        },
        PassId::Build => PassDescriptor {
            name: "build",
            inputs: &[PassId::Thread],
            outputs: &[ArtifactId::Program],
            invariants: "every output and bound value has an equation",
        },
        PassId::Render => PassDescriptor {
            name: "render",
            inputs: &[PassId::Build],
            outputs: &[ArtifactId::Text],
            invariants: "one line per equation, brackets balanced",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 4] = [PassId::Bind, PassId::Thread, PassId::Build, PassId::Render];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────
