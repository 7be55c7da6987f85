//! Process-local caches for the blob store: an LRU of reconstructed
//! artifact contents plus the availability/missing memo sets.
//!
//! All of this state is confined to one [`crate::repo::Repository`] and may
//! be cleared at any time without correctness impact.

use std::collections::HashSet;

use lru_mem::LruCache;

/// Hard cap on cached entries.
const MAX_ENTRIES: usize = 500;
/// Hard cap on total cached bytes.
const MAX_BYTES: usize = 50_000_000;

/// The artifact retrieval cache.
///
/// Artifacts in `missing` cannot be retrieved, either because they are
/// phantoms or because they are deltas that depend on a phantom. Artifacts
/// in `available` are known to reconstruct. An artifact in neither set has
/// unknown availability.
pub struct ContentCache {
    lru: LruCache<i64, Vec<u8>>,
    pub(crate) available: HashSet<i64>,
    pub(crate) missing: HashSet<i64>,
}

impl Default for ContentCache {
    fn default() -> Self {
        Self {
            lru: LruCache::new(MAX_BYTES),
            available: HashSet::new(),
            missing: HashSet::new(),
        }
    }
}

impl ContentCache {
    /// Hand a reconstructed artifact over to the cache. Oversized entries
    /// are silently skipped; eviction runs until both caps are satisfied.
    pub fn insert(&mut self, rid: i64, content: Vec<u8>) {
        if self.lru.insert(rid, content).is_err() {
            tracing::debug!(rid, "artifact too large for content cache");
            return;
        }
        while self.lru.len() > MAX_ENTRIES {
            self.lru.remove_lru();
        }
    }

    /// Fetch a cached artifact, refreshing its age.
    pub fn get(&mut self, rid: i64) -> Option<Vec<u8>> {
        self.lru.get(&rid).cloned()
    }

    pub fn contains(&self, rid: i64) -> bool {
        self.lru.peek(&rid).is_some()
    }

    /// Drop everything, including the availability memos.
    pub fn clear(&mut self) {
        self.lru.clear();
        self.available.clear();
        self.missing.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut cache = ContentCache::default();
        cache.insert(1, b"hello".to_vec());
        assert_eq!(cache.get(1), Some(b"hello".to_vec()));
        assert_eq!(cache.get(2), None);
    }

    /// The entry cap evicts the least recently used artifact first.
    #[test]
    fn entry_cap_evicts_lru() {
        let mut cache = ContentCache::default();
        for rid in 0..(MAX_ENTRIES as i64 + 10) {
            cache.insert(rid, vec![0u8; 8]);
        }
        assert!(cache.lru.len() <= MAX_ENTRIES);
        assert!(!cache.contains(0));
        assert!(cache.contains(MAX_ENTRIES as i64 + 9));
    }

    #[test]
    fn clear_resets_memos() {
        let mut cache = ContentCache::default();
        cache.insert(1, vec![1]);
        cache.available.insert(1);
        cache.missing.insert(2);
        cache.clear();
        assert!(cache.get(1).is_none());
        assert!(cache.available.is_empty() && cache.missing.is_empty());
    }
}
