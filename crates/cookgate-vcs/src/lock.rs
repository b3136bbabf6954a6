use std::collections::HashSet;
use std::sync::{Condvar, Mutex, PoisonError};

/// Keyed mutual exclusion: at most one holder per key, unrelated keys never wait on each other.
#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Holds a key of a [`LockTable`]; the key is released on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    table: &'a LockTable,
    key: String,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `key` is free, then holds it until the guard is dropped.
    pub fn acquire(&self, key: &str) -> LockGuard<'_> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(key) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(key.to_string());
        LockGuard {
            table: self,
            key: key.to_string(),
        }
    }

    #[cfg(test)]
    fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .table
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.key);
        drop(held);
        self.table.released.notify_all();
    }
}
