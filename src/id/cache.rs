use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;

/// Bounded bidirectional mapping between logical names and their hash
/// segments.
///
/// Both directions are LRU-capped at the same capacity. Evicting an
/// entry on one side also drops its counterpart on the other, so a
/// name resolvable forward is always resolvable in reverse.
pub struct BidiCache {
    forward: LruCache<String, String>,
    reverse: LruCache<String, String>,
}

impl BidiCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            forward: LruCache::new(cap),
            reverse: LruCache::new(cap),
        }
    }

    /// Insert a name ↔ hash pair, keeping both sides consistent under
    /// eviction.
    pub fn insert(&mut self, name: &str, hash: &str) {
        if let Some((evicted_name, evicted_hash)) =
            self.forward.push(name.to_string(), hash.to_string())
        {
            if evicted_name != name {
                self.reverse.pop(&evicted_hash);
            }
        }
        if let Some((evicted_hash, evicted_name)) =
            self.reverse.push(hash.to_string(), name.to_string())
        {
            if evicted_hash != hash {
                self.forward.pop(&evicted_name);
            }
        }
    }

    /// Resolve a hash segment back to its name, refreshing recency.
    pub fn name_for(&mut self, hash: &str) -> Option<String> {
        self.reverse.get(hash).cloned()
    }

    /// Resolve a name to its hash segment, refreshing recency.
    pub fn hash_for(&mut self, name: &str) -> Option<String> {
        self.forward.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn reverse_len(&self) -> usize {
        self.reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.forward.cap().get()
    }
}

/// Cache occupancy snapshot, exposed for observability.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub shard_cache_size: usize,
    pub type_cache_size: usize,
    pub reverse_shard_cache_size: usize,
    pub reverse_type_cache_size: usize,
    pub max_cache_size: usize,
}
