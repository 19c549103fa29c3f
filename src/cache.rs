//! A memoizing cache layered on [`ConcurrentMap`], ported in spirit from
//! `atomic_dict/atomic_cache.py`: `get_or_compute` looks up a key and, on a
//! miss, computes and installs it exactly once per key even under
//! concurrent callers racing on the same miss.

use std::hash::{BuildHasher, Hash};

use crate::map::ConcurrentMap;

/// Wraps a [`ConcurrentMap`] to provide compute-on-miss memoization.
/// Concurrent misses on the same key may race to compute the value more
/// than once (the compute function should be pure/idempotent, as with any
/// racy memoizer); only one computed value is ever installed and returned
/// to every racing caller — the loser's computation is discarded, not
/// published, following `try_insert`'s insert-only semantics.
pub struct AtomicCache<K, V, S = std::collections::hash_map::RandomState> {
    map: ConcurrentMap<K, V, S>,
}

impl<K, V> AtomicCache<K, V, std::collections::hash_map::RandomState>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create an empty cache.
    pub fn new() -> Self {
        Self { map: ConcurrentMap::new(None) }
    }
}

impl<K, V> Default for AtomicCache<K, V, std::collections::hash_map::RandomState>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> AtomicCache<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    /// Return the cached value for `key`, computing and memoizing it via
    /// `compute` on a miss. `compute` may run more than once under
    /// concurrent misses on the same key; exactly one result is kept.
    pub fn get_or_compute(&self, key: &K, compute: impl FnOnce() -> V) -> V {
        if let Some(value) = self.map.get(key) {
            return value;
        }
        let computed = compute();
        self.map.try_insert(key.clone(), computed.clone());
        // Whether our `try_insert` won or lost the race, re-read so every
        // caller returns the one value that was actually installed.
        self.map.get(key).unwrap_or(computed)
    }

    /// Explicitly seed or overwrite a cached value.
    pub fn set(&self, key: K, value: V) {
        self.map.set(key, value);
    }

    /// Drop a cached value, if present.
    pub fn invalidate(&self, key: &K) {
        let _ = self.map.delete(key);
    }

    /// Number of cached entries.
    pub fn len(&self) -> u64 {
        self.map.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn computes_once_on_first_access() {
        let cache: AtomicCache<String, u32> = AtomicCache::new();
        let calls = AtomicU32::new(0);
        let v = cache.get_or_compute(&"k".to_string(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            42
        });
        assert_eq!(v, 42);
        let v2 = cache.get_or_compute(&"k".to_string(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            99
        });
        assert_eq!(v2, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_forces_recompute() {
        let cache: AtomicCache<&str, u32> = AtomicCache::new();
        cache.get_or_compute(&"k", || 1);
        cache.invalidate(&"k");
        let v = cache.get_or_compute(&"k", || 2);
        assert_eq!(v, 2);
    }

    #[test]
    fn concurrent_misses_converge_on_one_value() {
        let cache: Arc<AtomicCache<&str, u32>> = Arc::new(AtomicCache::new());
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                thread::spawn(move || cache.get_or_compute(&"shared", || i))
            })
            .collect();
        let results: Vec<u32> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        let first = results[0];
        assert!(results.iter().all(|&r| r == first));
    }
}
