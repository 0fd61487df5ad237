//src/cache.rs

use ahash::AHashMap;
use parking_lot::Mutex;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Whole-response cache with a time-to-live and an entry cap.
///
/// Keys are hashes of every input that affects a response. When full, the
/// oldest entry is evicted. A capacity of 0 disables caching.
pub struct ResponseCache<V> {
    entries: Mutex<AHashMap<u64, (Instant, Arc<V>)>>,
    ttl: Duration,
    capacity: usize,
}

impl<V> ResponseCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self { entries: Mutex::new(AHashMap::with_capacity(capacity)), ttl, capacity }
    }

    /// Stable key for any hashable request.
    pub fn key<K: Hash + ?Sized>(request: &K) -> u64 {
        // fixed seeds: keys must not change between cache instances
        let mut hasher = ahash::RandomState::with_seeds(1, 2, 3, 4).build_hasher();
        request.hash(&mut hasher);
        hasher.finish()
    }

    pub fn get(&self, key: u64) -> Option<Arc<V>> {
        let mut entries = self.entries.lock();
        let found = entries
            .get(&key)
            .map(|(stored, value)| (stored.elapsed() <= self.ttl, Arc::clone(value)));
        match found {
            Some((true, value)) => Some(value),
            Some((false, _)) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: u64, value: V) -> Arc<V> {
        let value = Arc::new(value);
        if self.capacity == 0 {
            return value;
        }
        let mut entries = self.entries.lock();
        let ttl = self.ttl;
        entries.retain(|_, (stored, _)| stored.elapsed() <= ttl);
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            if let Some(oldest) = entries.iter().min_by_key(|(_, (stored, _))| *stored).map(|(k, _)| *k) {
                entries.remove(&oldest);
            }
        }
        entries.insert(key, (Instant::now(), Arc::clone(&value)));
        value
    }

    /// Returns the cached value or computes, stores and returns a fresh one.
    /// Errors are never cached.
    pub fn get_or_try_insert<E, F>(&self, key: u64, compute: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(hit) = self.get(key) {
            log::debug!("response cache hit {key:016x}");
            return Ok(hit);
        }
        // computed outside the lock so slow requests do not serialize
        let value = compute()?;
        Ok(self.insert(key, value))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
