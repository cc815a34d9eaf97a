// id.rs — Stable identifiers for trace values and bindings
//
// Values are numbered in creation order, which is also a topological order of
// the operation graph: every operand id is strictly smaller than the id of the
// node consuming it. Bindings are numbered in declaration order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a value (leaf, literal, or operation) in a trace graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Identifier of a user-declared binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindingId(pub u32);

/// Allocator for binding IDs. Produces monotonically increasing IDs in
/// declaration order, ensuring deterministic assignment.
///
/// Value ids need no allocator: a value's id is its position in the graph.
#[derive(Debug, Default, Clone)]
pub struct IdAllocator {
    next_binding: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume allocation after `bindings` bindings already exist.
    pub fn starting_at(bindings: usize) -> Self {
        Self {
            next_binding: bindings as u32,
        }
    }

    pub fn alloc_binding(&mut self) -> BindingId {
        let id = BindingId(self.next_binding);
        self.next_binding += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_monotonic() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.alloc_binding(), BindingId(0));
        assert_eq!(ids.alloc_binding(), BindingId(1));
    }

    #[test]
    fn resumes_after_existing_bindings() {
        let mut ids = IdAllocator::starting_at(2);
        assert_eq!(ids.alloc_binding(), BindingId(2));
    }

    #[test]
    fn value_ids_display_as_registers() {
        assert_eq!(ValueId(7).to_string(), "%7");
        assert_eq!(ValueId(7).index(), 7);
    }
}
