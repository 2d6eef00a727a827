//! Per-stage settings storage.
//!
//! Each stage owns one [`SettingsStore`] mapping page (or image) identity
//! to that stage's `Params`. The store is the only mutable state shared
//! between the interactive context and background workers, so every
//! operation takes the lock for its full duration: readers see either the
//! state before a mutation or after it, never a partial write.
//!
//! Absence of an entry means "use defaults, recompute on demand" — there is
//! never more than one entry per key.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

/// Thread-safe map from page/image identity to one stage's parameters.
#[derive(Debug, Default)]
pub struct SettingsStore<K, P> {
    entries: Mutex<HashMap<K, P>>,
}

impl<K, P> SettingsStore<K, P>
where
    K: Eq + Hash + Clone,
    P: Clone,
{
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, P>> {
        // Mutations are single map operations; a poisoned lock still
        // guards a whole value.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The stored parameters for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<P> {
        self.lock().get(key).cloned()
    }

    /// Whether `key` has stored parameters.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    /// Store `params` for `key`, replacing any previous entry.
    pub fn set(&self, key: K, params: P) {
        self.lock().insert(key, params);
    }

    /// Store `params` for `key` only if no entry exists yet.
    ///
    /// Returns `true` if the entry was inserted. This is the backing for
    /// "load defaults": explicit or previously computed settings are never
    /// overwritten.
    pub fn set_if_absent(&self, key: K, params: P) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            false
        } else {
            entries.insert(key, params);
            true
        }
    }

    /// Remove and return the entry for `key`.
    pub fn remove(&self, key: &K) -> Option<P> {
        self.lock().remove(key)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Rewrite every key through `mapper` in one atomic step.
    ///
    /// Entries whose key maps to `None` are dropped — the page was removed.
    /// All other entries move to their new key with their value unchanged.
    pub fn remap(&self, mapper: impl Fn(&K) -> Option<K>) {
        let mut entries = self.lock();
        let remapped = entries
            .drain()
            .filter_map(|(key, params)| mapper(&key).map(|new_key| (new_key, params)))
            .collect();
        *entries = remapped;
    }

    /// Snapshot of all entries, in unspecified order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(K, P)> {
        self.lock()
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect()
    }
}
