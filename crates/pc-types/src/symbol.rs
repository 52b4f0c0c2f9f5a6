use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// String interning service. Equal strings interned through the same table
/// share one allocation; the table is passed explicitly, never global.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Mutex<HashSet<Arc<str>>>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, text: &str) -> Arc<str> {
        let mut symbols = self.symbols.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = symbols.get(text) {
            return Arc::clone(existing);
        }
        let symbol: Arc<str> = Arc::from(text);
        symbols.insert(Arc::clone(&symbol));
        symbol
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
