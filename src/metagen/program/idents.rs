// Copyright (c) 2025 knix
// All rights reserved.

use string_interner::{StringInterner, backend::StringBackend, symbol::SymbolU32};

/// An interned declaration name. Ordering follows interning order, not spelling.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Ident(SymbolU32);

pub struct IdentPool {
    names: StringInterner<StringBackend>,
}

impl IdentPool {
    pub fn make() -> Self {
        IdentPool { names: StringInterner::with_capacity(256) }
    }

    pub fn intern(&mut self, s: impl AsRef<str>) -> Ident {
        Ident(self.names.get_or_intern(s))
    }

    pub fn get_name(&self, id: Ident) -> &str {
        match self.names.resolve(id.0) {
            None => panic!("get_name called on an identifier from another pool: {:?}", id),
            Some(name) => name,
        }
    }
}
