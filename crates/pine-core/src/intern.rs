//! A process- or VM-wide interning table mapping structural identity to a
//! single shared [`Value`] instance.
//!
//! Readers and occasional writers only; contents are immutable once
//! inserted, so the critical section is a short insert-if-absent. This is
//! the `ValueStore` external interface from spec §6.

use crate::hash::ContentHash;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Insert-if-absent table from structural hash to canonical `Value`.
pub struct Interner {
    table: Mutex<HashMap<ContentHash, Value>>,
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

impl Interner {
    pub fn new() -> Self {
        Interner { table: Mutex::new(HashMap::new()) }
    }

    /// Return the canonical shared instance for `value`, inserting it if
    /// this is the first time this content has been seen.
    pub fn intern(&self, value: Value) -> Value {
        let hash = value.structural_hash();
        let mut table = self.table.lock().expect("interner mutex poisoned");
        table.entry(hash).or_insert(value).clone()
    }

    /// Look up a previously interned value by its structural hash.
    pub fn lookup_by_hash(&self, hash: ContentHash) -> Option<Value> {
        self.table.lock().expect("interner mutex poisoned").get(&hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.lock().expect("interner mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
