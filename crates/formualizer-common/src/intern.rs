//! Interned string pool shared by the cell store and the formula token stream.
//!
//! Ids are monotonic: once a string is interned its id is stable for the
//! lifetime of the pool and is never reassigned to a different string. Id 0
//! is reserved and denotes "no string".
//!
//! Reads (the common case once a workbook has warmed up) only need the
//! shared half of an `RwLock`; only the rare new-string path takes the
//! exclusive half, so lookups of already-interned strings don't serialize
//! against each other.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, RwLock};

/// Stable, non-zero id for an interned string. `0` is reserved for "no string".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StringId(NonZeroU32);

impl StringId {
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

struct Inner {
    strings: Vec<Arc<str>>, // index 0 is an unused placeholder so ids start at 1
    ids: HashMap<Arc<str>, StringId>,
}

/// Many-reader / rare-writer interner. Concurrent interning during a
/// calculation run is permitted (e.g. formula string results); it never
/// invalidates an id handed out earlier.
pub struct StringPool {
    inner: RwLock<Inner>,
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StringPool {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                strings: vec![Arc::from("")],
                ids: HashMap::new(),
            }),
        }
    }

    /// Intern `s`, returning its stable id. Idempotent for equal strings.
    pub fn intern(&self, s: &str) -> StringId {
        if let Some(id) = self.inner.read().unwrap().ids.get(s) {
            return *id;
        }
        let mut inner = self.inner.write().unwrap();
        // Re-check: another writer may have interned the same string while
        // we were waiting for the exclusive lock.
        if let Some(id) = inner.ids.get(s) {
            return *id;
        }
        let id = StringId(NonZeroU32::new(inner.strings.len() as u32).unwrap());
        let arc: Arc<str> = Arc::from(s);
        inner.strings.push(arc.clone());
        inner.ids.insert(arc, id);
        id
    }

    /// Resolve a previously interned id back to its string.
    ///
    /// Panics if `id` was not produced by this pool — ids never dangle
    /// within the pool that minted them.
    pub fn resolve(&self, id: StringId) -> Arc<str> {
        let inner = self.inner.read().unwrap();
        inner.strings[id.get() as usize].clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().strings.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
