//! Executor-entry cache keyed by an opaque input-shape hash, plus the sticky
//! disable-cache flag for fusions whose output shape depends on non-tensor
//! inputs (SPEC_FULL §4.6).
//!
//! Grounded on `gpu/automation/binding_manager.rs`'s "hashmap behind a
//! handful of accessor methods" shape, swapped to `rustc_hash::FxHashMap`
//! for the same reason the rest of this crate prefers it over the stdlib
//! hasher on hot lookup paths.

use rustc_hash::FxHashMap;

use super::types::ExecutorEntry;

/// Opaque cache key derived from an argument holder's shapes and dtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(pub u64);

impl CacheKey {
    pub fn from_shapes<'a>(shapes: impl IntoIterator<Item = &'a [i64]>) -> Self {
        use std::hash::{Hash, Hasher};
        let mut hasher = rustc_hash::FxHasher::default();
        for shape in shapes {
            shape.hash(&mut hasher);
        }
        CacheKey(hasher.finish())
    }
}

/// Per-executor-instance cache of [`ExecutorEntry`] by [`CacheKey`], with the
/// sticky "always transient" escape hatch for shape-dependent fusions.
#[derive(Debug, Default)]
pub struct EntryCache {
    entries: FxHashMap<CacheKey, ExecutorEntry>,
    disabled: bool,
}

impl EntryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set once at compile time: true when an output's logical extent
    /// transitively depends on a non-tensor fusion input.
    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Looks up or lazily creates the entry for `key`. When the cache is
    /// disabled, a fresh transient entry is handed back instead and never
    /// persisted (SPEC_FULL §4.6's disable-cache trigger).
    pub fn entry_or_transient(&mut self, key: CacheKey) -> ExecutorEntry {
        if self.disabled {
            log::debug!("[EntryCache] cache disabled, using transient entry");
            return ExecutorEntry::default();
        }
        self.entries.entry(key).or_insert_with(|| {
            log::debug!("[EntryCache] miss for cache key {:?}, creating entry", key);
            ExecutorEntry::default()
        });
        self.entries.get(&key).cloned().expect("just inserted")
    }

    /// Writes back an entry mutated by the caller (shape infos, launch
    /// params) after a run. No-op when the cache is disabled.
    pub fn store(&mut self, key: CacheKey, entry: ExecutorEntry) {
        if self.disabled {
            return;
        }
        self.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_shapes_hash_to_the_same_key() {
        let a = CacheKey::from_shapes(vec![&[2i64, 3][..]]);
        let b = CacheKey::from_shapes(vec![&[2i64, 3][..]]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_shapes_hash_differently() {
        let a = CacheKey::from_shapes(vec![&[2i64, 3][..]]);
        let b = CacheKey::from_shapes(vec![&[2i64, 4][..]]);
        assert_ne!(a, b);
    }

    #[test]
    fn disabled_cache_never_grows() {
        let mut cache = EntryCache::new();
        cache.set_disabled(true);
        let key = CacheKey(1);
        let entry = cache.entry_or_transient(key);
        cache.store(key, entry);
        assert!(cache.is_empty());
    }

    #[test]
    fn enabled_cache_persists_across_lookups() {
        let mut cache = EntryCache::new();
        let key = CacheKey(1);
        let mut entry = cache.entry_or_transient(key);
        entry.initialized = true;
        cache.store(key, entry);

        let reloaded = cache.entry_or_transient(key);
        assert!(reloaded.initialized);
        assert_eq!(cache.len(), 1);
    }
}
