//! Symbol interning.
//!
//! Symbols are interned once and referenced by `SymbolId` everywhere else, so
//! identifier comparison during analysis and compilation is an integer
//! comparison rather than a string comparison. The interner is owned by the
//! `Runtime` and lives for the life of the process.

use ahash::AHashMap;

/// Index into the symbol interner's storage.
///
/// Uses `u32` to save space (4 bytes vs 8 bytes for `usize`). This limits us
/// to ~4 billion unique symbols, which is more than sufficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SymbolId(u32);

impl SymbolId {
    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Storage for interned symbols.
#[derive(Debug, Default)]
pub(crate) struct Interns {
    names: Vec<String>,
    ids: AHashMap<String, SymbolId>,
}

impl Interns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a symbol name, returning the existing id if already present.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = SymbolId(u32::try_from(self.names.len()).expect("symbol table exceeds u32 range"));
        self.names.push(name.to_owned());
        self.ids.insert(name.to_owned(), id);
        id
    }

    /// Returns the name for an interned symbol.
    pub fn resolve(&self, id: SymbolId) -> &str {
        &self.names[id.index()]
    }

    /// Number of interned symbols.
    pub fn len(&self) -> usize {
        self.names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let mut interns = Interns::new();
        let a = interns.intern("lambda");
        let b = interns.intern("lambda");
        let c = interns.intern("lambda*");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interns.resolve(a), "lambda");
        assert_eq!(interns.resolve(c), "lambda*");
        assert_eq!(interns.len(), 2);
    }
}
