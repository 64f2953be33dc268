//! Interned identifiers.
//!
//! Every identifier the compiler embeds in an instruction stream (variable,
//! function, namespace and field names) is interned here. Lookups are
//! case-insensitive; the first spelling seen is the one kept for display.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;

/// Handle to an interned identifier.
///
/// Never zero: a zero word in the instruction stream means "no symbol".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(NonZeroU32);

impl SymbolId {
    /// Raw word as stored in the instruction stream.
    pub fn to_word(self) -> u32 {
        self.0.get()
    }

    /// Decode an optional symbol from an instruction word.
    pub fn from_word(word: u32) -> Option<SymbolId> {
        NonZeroU32::new(word).map(SymbolId)
    }

    /// Encode an optional symbol as an instruction word.
    pub fn encode(sym: Option<SymbolId>) -> u32 {
        sym.map_or(0, SymbolId::to_word)
    }
}

impl fmt::Debug for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Case-insensitive string interner.
#[derive(Debug, Default)]
pub struct SymbolTable {
    /// Slot 0 is unused so that ids are never zero.
    names: Vec<String>,
    index: HashMap<String, SymbolId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            names: vec![String::new()],
            index: HashMap::new(),
        }
    }

    /// Intern `name`, returning the existing id for any case variant.
    pub fn insert(&mut self, name: &str) -> SymbolId {
        let key = name.to_ascii_lowercase();
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        if self.names.is_empty() {
            self.names.push(String::new());
        }
        let raw = u32::try_from(self.names.len()).unwrap_or(u32::MAX);
        let id = SymbolId(NonZeroU32::new(raw).unwrap_or(NonZeroU32::MIN));
        self.names.push(name.to_string());
        self.index.insert(key, id);
        id
    }

    /// Find an already interned name without inserting it.
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.index.get(&name.to_ascii_lowercase()).copied()
    }

    /// Spelling of an interned symbol.
    pub fn resolve(&self, id: SymbolId) -> &str {
        self.names
            .get(id.0.get() as usize)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Whether `word` names a symbol of this table.
    pub fn contains_word(&self, word: u32) -> bool {
        word != 0 && (word as usize) < self.names.len()
    }

    pub fn len(&self) -> usize {
        self.names.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_case_insensitive() {
        let mut table = SymbolTable::new();
        let a = table.insert("%Player");
        let b = table.insert("%player");
        assert_eq!(a, b);
        assert_eq!(table.resolve(a), "%Player");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_ids_are_never_zero() {
        let mut table = SymbolTable::new();
        let id = table.insert("");
        assert_ne!(id.to_word(), 0);
        assert_eq!(SymbolId::from_word(0), None);
        assert_eq!(SymbolId::from_word(id.to_word()), Some(id));
    }

    #[test]
    fn test_lookup_does_not_insert() {
        let mut table = SymbolTable::new();
        assert!(table.lookup("echo").is_none());
        let id = table.insert("Echo");
        assert_eq!(table.lookup("ECHO"), Some(id));
        assert!(table.contains_word(id.to_word()));
        assert!(!table.contains_word(0));
    }
}
