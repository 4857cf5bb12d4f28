use super::{Expr, Type};
use std::collections::HashMap;

//
// Public Interface
//

#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    pub typ: Type,
    pub static_lifetime: bool,
}

/// Receives every symbol the generators create. A single materialization
/// call only ever adds uniquely named symbols; concurrent callers need
/// external serialization.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    index: HashMap<String, usize>,
    string_literals: HashMap<String, String>,
    counter: u64,
}

//
// Private Implementation
//

impl Symbol {
    pub fn expr(&self) -> Expr {
        Expr::Symbol {
            name: self.name.clone(),
            typ: self.typ.clone(),
        }
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: Symbol) {
        debug_assert!(
            !self.index.contains_key(&symbol.name),
            "symbol `{}` already exists",
            symbol.name
        );
        self.index.insert(symbol.name.clone(), self.symbols.len());
        self.symbols.push(symbol);
    }

    /// Introduces a freshly named auxiliary symbol scoped to `function_id`.
    pub fn fresh(
        &mut self,
        function_id: &str,
        base_name: &str,
        typ: Type,
        static_lifetime: bool,
    ) -> Symbol {
        self.counter += 1;
        let symbol = Symbol {
            name: format!("{}::{}${}", function_id, base_name, self.counter),
            typ,
            static_lifetime,
        };
        self.insert(symbol.clone());
        symbol
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.index.get(name).map(|i| &self.symbols[*i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<Symbol> {
        self.symbols.iter()
    }

    /// Returns the deduplicated literal constant for `content`: all
    /// occurrences of one string value share a single static symbol.
    pub fn string_literal(&mut self, content: &str, typ: Type) -> Expr {
        if let Some(name) = self.string_literals.get(content) {
            return self.lookup(name).expect("literal symbol exists").expr();
        }
        self.counter += 1;
        let symbol = Symbol {
            name: format!("string_literal${}", self.counter),
            typ,
            static_lifetime: true,
        };
        self.string_literals
            .insert(content.to_string(), symbol.name.clone());
        self.insert(symbol.clone());
        symbol.expr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_names_are_unique_and_deterministic() {
        let mut table = SymbolTable::new();
        let a = table.fresh("main", "tmp_object", Type::int(), false);
        let b = table.fresh("main", "tmp_object", Type::int(), false);
        assert_eq!(a.name, "main::tmp_object$1");
        assert_eq!(b.name, "main::tmp_object$2");
        assert!(table.contains(&a.name));

        let mut second = SymbolTable::new();
        let again = second.fresh("main", "tmp_object", Type::int(), false);
        assert_eq!(again.name, a.name);
    }

    #[test]
    fn string_literals_are_deduplicated() {
        let mut table = SymbolTable::new();
        let typ = Type::struct_tag("String");
        let first = table.string_literal("hello", typ.clone());
        let second = table.string_literal("hello", typ.clone());
        let other = table.string_literal("world", typ);
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(table.len(), 2);
    }
}
