//! Module-level symbol table for functions.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::ops::FuncId;

/// Maps function names to function ids and guarantees names are unique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolTable {
    names: FxHashMap<String, FuncId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` under `name`, renaming it with a `_<n>` suffix when the
    /// name is already taken. Returns the name actually registered.
    pub fn insert(&mut self, name: &str, id: FuncId) -> String {
        if !self.names.contains_key(name) {
            self.names.insert(name.to_string(), id);
            return name.to_string();
        }
        let mut n = 0usize;
        loop {
            let candidate = format!("{name}_{n}");
            if !self.names.contains_key(&candidate) {
                self.names.insert(candidate.clone(), id);
                return candidate;
            }
            n += 1;
        }
    }

    pub fn lookup(&self, name: &str) -> Option<FuncId> {
        self.names.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
