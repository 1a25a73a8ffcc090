//! Result Cache
//!
//! Strict LRU cache of completed task results, keyed by task id.
//! Never holds more than its capacity; inserting into a full cache evicts the
//! least recently used entry.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate_percent: f64,
}

struct CachedResult<T> {
    value: T,
    stored_at: Instant,
}

/// Bounded LRU cache of task results
pub struct ResultCache<T> {
    inner: Mutex<LruCache<String, CachedResult<T>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<T: Clone> ResultCache<T> {
    /// Capacity zero is treated as one
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Store a result, making it the most recently used entry
    pub fn insert(&self, task_id: &str, value: T) {
        let mut cache = self.inner.lock();

        // Re-inserting an existing id refreshes it rather than evicting
        cache.pop(task_id);
        let entry = CachedResult {
            value,
            stored_at: Instant::now(),
        };
        if let Some((evicted, _)) = cache.push(task_id.to_string(), entry) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Result cache evicted {}", evicted);
        }
    }

    /// Look up a result, counting the hit or miss
    pub fn get(&self, task_id: &str) -> Option<T> {
        let found = self.inner.lock().get(task_id).map(|e| e.value.clone());
        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Look up without touching recency or stats
    pub fn peek(&self, task_id: &str) -> Option<T> {
        self.inner.lock().peek(task_id).map(|e| e.value.clone())
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.inner.lock().contains(task_id)
    }

    pub fn remove(&self, task_id: &str) -> Option<T> {
        self.inner.lock().pop(task_id).map(|e| e.value)
    }

    /// Drop entries stored longer than `max_age` ago; returns how many went
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let mut cache = self.inner.lock();
        let stale: Vec<String> = cache
            .iter()
            .filter(|(_, e)| e.stored_at.elapsed() > max_age)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &stale {
            cache.pop(key);
        }
        stale.len()
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

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let (entries, capacity) = {
            let cache = self.inner.lock();
            (cache.len(), cache.cap().get())
        };

        CacheStats {
            entries,
            capacity,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate_percent: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }
}
