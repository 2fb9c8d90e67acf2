//! Blackboard - shared key/value store for state machines
//!
//! The board is the only data shared across concurrently running states.
//! All access is serialized behind a lock, and reads hand out independent
//! clones of the stored value, so no two states ever alias the same data.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

/// Shared blackboard passed through the whole active state tree.
///
/// Cloning a `Board` is cheap and yields a handle to the same underlying
/// store. Values are weakly typed (`serde_json::Value`); `get` returns an
/// owned clone, so mutations on the caller side never leak back into the
/// board without an explicit `set`.
#[derive(Debug, Clone, Default)]
pub struct Board {
    entries: Arc<RwLock<HashMap<String, Value>>>,
}

impl Board {
    /// Create a new empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an independent copy of the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    /// Check whether `key` has an entry on the board.
    pub fn exists(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Bulk-insert a collection of key/value pairs.
    pub fn load<I, K>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut map = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for (key, value) in entries {
            map.insert(key.into(), value);
        }
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true when the board holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
