//! Bounded key/value cache
//!
//! Holds dimension-sampling indices and fitted projections between requests.
//! Eviction is first-in-first-out by insertion order: lookups go through
//! `peek` and never promote an entry.

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of cached entries.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Fixed-capacity FIFO cache
pub struct BoundedCache<K: Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, V>>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl<K: Hash + Eq, V: Clone> BoundedCache<K, V> {
    /// Creates a cache; a zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }

    /// Looks up `key` without touching its eviction position.
    pub fn get(&self, key: &K) -> Option<V> {
        let cache = self.inner.lock();
        if let Some(value) = cache.peek(key) {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            Some(value.clone())
        } else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Inserts or replaces; returns the entry evicted to make room.
    ///
    /// Replacing an existing key keeps its original insertion position.
    pub fn insert(&self, key: K, value: V) -> Option<(K, V)> {
        let mut cache = self.inner.lock();
        if let Some(slot) = cache.peek_mut(&key) {
            *slot = value;
            return None;
        }
        cache.push(key, value)
    }

    /// Returns the cached value or computes, stores and returns it.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let value = make();
        self.insert(key, value.clone());
        value
    }

    pub fn invalidate(&self, key: &K) -> Option<V> {
        self.inner.lock().pop(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }

    /// Returns cache hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hit_count.load(Ordering::Relaxed);
        let misses = self.miss_count.load(Ordering::Relaxed);
        let total = hits + misses;

        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hit_count.load(Ordering::Relaxed),
            misses: self.miss_count.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
        self.hit_count.store(0, Ordering::Relaxed);
        self.miss_count.store(0, Ordering::Relaxed);
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_basic() {
        let cache: BoundedCache<String, i32> = BoundedCache::new(3);
        cache.insert("a".into(), 1);
        cache.insert("b".into(), 2);

        assert_eq!(cache.get(&"a".into()), Some(1));
        assert_eq!(cache.get(&"c".into()), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_fifo_eviction() {
        let cache = BoundedCache::new(2);
        cache.insert(1, "one");
        cache.insert(2, "two");

        // 조회해도 순서는 바뀌지 않는다
        assert_eq!(cache.get(&1), Some("one"));
        let evicted = cache.insert(3, "three");

        assert_eq!(evicted, Some((1, "one")));
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some("two"));
        assert_eq!(cache.get(&3), Some("three"));
    }

    #[test]
    fn test_cache_replace_keeps_position() {
        let cache = BoundedCache::new(2);
        cache.insert(1, 10);
        cache.insert(2, 20);
        assert_eq!(cache.insert(1, 11), None);
        cache.insert(3, 30);

        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(20));
    }

    #[test]
    fn test_get_or_insert_with() {
        let cache = BoundedCache::new(4);
        let mut calls = 0;
        let first = cache.get_or_insert_with("k", || {
            calls += 1;
            vec![1, 2, 3]
        });
        let second = cache.get_or_insert_with("k", || {
            calls += 1;
            vec![]
        });
        assert_eq!(first, second);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_cache_hit_ratio() {
        let cache = BoundedCache::new(3);
        cache.insert("key1", 1);

        cache.get(&"key1"); // hit
        cache.get(&"key1"); // hit
        cache.get(&"key2"); // miss

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let cache = BoundedCache::new(0);
        cache.insert(1, 1);
        cache.insert(2, 2);
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.get(&2), Some(2));
    }
}
