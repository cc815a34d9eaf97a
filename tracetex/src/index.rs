// index.rs — Index symbol allocation with lexical scoping
//
// Symbols come from an ordered alphabet (`i j k l m n p q r s t u v w` by
// default), then the same letters primed once, twice, and so on. A symbol is
// never handed out while it is in scope; scopes are released in stack order
// with `mark`/`release`, so sibling summations may reuse a symbol once the
// first has closed.
//
// Preconditions: none.
// Postconditions: no two live symbols are equal.
// Failure modes: none (the primed sequence is unbounded).
// Side effects: none.

use crate::expr::Index;

/// The default index alphabet (`o` is skipped to avoid confusion with `0`).
pub const DEFAULT_ALPHABET: &str = "ijklmnpqrstuvw";

/// A scope marker returned by [`IndexAllocator::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeMark(usize);

#[derive(Debug, Clone)]
pub struct IndexAllocator {
    alphabet: Vec<char>,
    live: Vec<Index>,
}

impl Default for IndexAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHABET)
    }
}

impl IndexAllocator {
    /// An allocator over the letters of `alphabet`, in order. Duplicate and
    /// whitespace characters are ignored; an empty alphabet falls back to the
    /// default one.
    pub fn new(alphabet: &str) -> Self {
        let mut letters: Vec<char> = Vec::new();
        for c in alphabet.chars().filter(|c| !c.is_whitespace()) {
            if !letters.contains(&c) {
                letters.push(c);
            }
        }
        if letters.is_empty() {
            letters = DEFAULT_ALPHABET.chars().collect();
        }
        IndexAllocator {
            alphabet: letters,
            live: Vec::new(),
        }
    }

    /// Bring the first symbol not currently in scope into scope.
    pub fn fresh(&mut self) -> Index {
        let mut primes = 0u8;
        loop {
            for &letter in &self.alphabet {
                let candidate = Index { letter, primes };
                if !self.live.contains(&candidate) {
                    self.live.push(candidate);
                    return candidate;
                }
            }
            primes = primes.saturating_add(1);
        }
    }

    pub fn fresh_n(&mut self, n: usize) -> Vec<Index> {
        (0..n).map(|_| self.fresh()).collect()
    }

    pub fn mark(&self) -> ScopeMark {
        ScopeMark(self.live.len())
    }

    /// Close every scope opened since `mark`.
    pub fn release(&mut self, mark: ScopeMark) {
        self.live.truncate(mark.0);
    }

    pub fn in_scope(&self) -> &[Index] {
        &self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letters(indices: &[Index]) -> String {
        indices.iter().map(|i| i.to_string()).collect()
    }

    #[test]
    fn allocates_in_alphabet_order() {
        let mut alloc = IndexAllocator::default();
        let got = alloc.fresh_n(5);
        assert_eq!(letters(&got), "ijklm");
    }

    #[test]
    fn sibling_scopes_reuse_symbols() {
        let mut alloc = IndexAllocator::default();
        let free = alloc.fresh();
        let mark = alloc.mark();
        let first = alloc.fresh();
        alloc.release(mark);
        let second = alloc.fresh();
        assert_eq!(free.to_string(), "i");
        assert_eq!(first, second);
        assert_eq!(second.to_string(), "j");
    }

    #[test]
    fn nested_scopes_get_fresh_symbols() {
        let mut alloc = IndexAllocator::default();
        let outer = alloc.fresh();
        let inner = alloc.fresh();
        assert_ne!(outer, inner);
        assert_eq!(alloc.in_scope().len(), 2);
    }

    #[test]
    fn exhausted_alphabet_continues_primed() {
        let mut alloc = IndexAllocator::new("ij");
        let got = alloc.fresh_n(5);
        assert_eq!(letters(&got), "iji'j'i''");
    }

    #[test]
    fn custom_alphabet_ignores_duplicates_and_blanks() {
        let mut alloc = IndexAllocator::new("a b a c");
        assert_eq!(letters(&alloc.fresh_n(3)), "abc");
        let mut fallback = IndexAllocator::new("");
        assert_eq!(fallback.fresh().to_string(), "i");
    }
}
