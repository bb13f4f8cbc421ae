//! # Memory Cache
//!
//! Capacity-bounded cache of recent results with TTL expiry and LRU eviction.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Deterministic key for a search request
#[must_use]
pub fn cache_key(query: &str, max_results: u32, days_back: u32, sort: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(max_results.to_string().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(days_back.to_string().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(sort.as_bytes());

    format!("{:x}", hasher.finalize())
}

/// A cache entry with expiration support
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    /// Logical clock value of the last read or write
    last_access: u64,
}

/// Cache statistics for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    /// Entries dropped to make room for new ones
    pub evictions: u64,
    /// Entries dropped because their TTL ran out
    pub expirations: u64,
    pub current_size: usize,
    pub max_size: usize,
    pub ttl_secs: u64,
}

impl MemoryCacheStats {
    /// Calculate hit rate as a percentage
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    clock: u64,
    stats: MemoryCacheStats,
}

impl<V> CacheState<V> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// In-memory cache keyed by string
#[derive(Debug)]
pub struct MemoryCache<V> {
    state: Mutex<CacheState<V>>,
    max_entries: usize,
    ttl: Duration,
}

impl<V: Clone> MemoryCache<V> {
    /// Create a cache holding at most `max_entries` values for `ttl` each
    #[must_use]
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                clock: 0,
                stats: MemoryCacheStats::default(),
            }),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        now.duration_since(entry.stored_at) > self.ttl
    }

    /// Look up a value, dropping it if its TTL has run out
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.state();
        let tick = state.tick();

        let lookup = state.entries.get_mut(key).map(|entry| {
            if self.is_expired(entry, now) {
                None
            } else {
                entry.last_access = tick;
                Some(entry.value.clone())
            }
        });

        match lookup {
            Some(Some(value)) => {
                state.stats.hits += 1;
                debug!("Cache hit for key: {}", key);
                Some(value)
            }
            Some(None) => {
                state.entries.remove(key);
                state.stats.expirations += 1;
                state.stats.misses += 1;
                debug!("Cache entry expired and removed: {}", key);
                None
            }
            None => {
                state.stats.misses += 1;
                debug!("Cache miss for key: {}", key);
                None
            }
        }
    }

    /// Store a value, evicting the least recently used entry when full
    pub fn set(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let now = Instant::now();
        let mut state = self.state();
        let tick = state.tick();

        if !state.entries.contains_key(&key) && state.entries.len() >= self.max_entries {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                state.entries.remove(&oldest);
                state.stats.evictions += 1;
                debug!("Evicted cache entry: {}", oldest);
            }
        }

        state.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: now,
                last_access: tick,
            },
        );
        state.stats.sets += 1;
    }

    /// Remove all expired entries and return how many were dropped
    pub fn clean_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state();
        let before = state.entries.len();
        state.entries.retain(|_, entry| now.duration_since(entry.stored_at) <= self.ttl);
        let removed = before - state.entries.len();
        state.stats.expirations += removed as u64;
        if removed > 0 {
            debug!("Cleaned up {} expired cache entries", removed);
        }
        removed
    }

    /// Remove every entry and return how many were dropped
    pub fn clear(&self) -> usize {
        let mut state = self.state();
        let removed = state.entries.len();
        state.entries.clear();
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> MemoryCacheStats {
        let state = self.state();
        MemoryCacheStats {
            current_size: state.entries.len(),
            max_size: self.max_entries,
            ttl_secs: self.ttl.as_secs(),
            ..state.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_cache_operations() {
        let cache = MemoryCache::new(10, Duration::from_secs(60));

        cache.set("key1", "value1".to_string());
        assert_eq!(cache.get("key1"), Some("value1".to_string()));
        assert_eq!(cache.get("nonexistent"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert!((stats.hit_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_size_limit_evicts_least_recently_used() {
        let cache = MemoryCache::new(2, Duration::from_secs(60));
        cache.set("key1", 1);
        cache.set("key2", 2);

        // touch key1 so key2 becomes the LRU entry
        assert_eq!(cache.get("key1"), Some(1));
        cache.set("key3", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.get("key2"), None);
        assert_eq!(cache.get("key1"), Some(1));
        assert_eq!(cache.get("key3"), Some(3));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = MemoryCache::new(2, Duration::from_secs(60));
        cache.set("key1", 1);
        cache.set("key2", 2);
        cache.set("key1", 10);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("key1"), Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiration_is_a_miss_and_removes() {
        let cache = MemoryCache::new(10, Duration::from_secs(60));
        cache.set("short_lived", "value".to_string());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cache.get("short_lived").is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get("short_lived").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired() {
        let cache = MemoryCache::new(10, Duration::from_secs(60));
        cache.set("expire1", 1);
        cache.set("expire2", 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        cache.set("keep", 3);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.clean_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("keep"), Some(3));
    }

    #[test]
    fn test_clear_returns_count() {
        let cache = MemoryCache::new(10, Duration::from_secs(60));
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_key_is_deterministic_and_parameter_sensitive() {
        let key = cache_key("cancer", 5, 0, "relevance");
        assert_eq!(key, cache_key("cancer", 5, 0, "relevance"));
        assert_eq!(key.len(), 64);
        assert_ne!(key, cache_key("cancer", 5, 1, "relevance"));
        assert_ne!(key, cache_key("cancer", 50, 0, "relevance"));
        assert_ne!(key, cache_key("cancer", 5, 0, "pub_date"));
    }

    #[test]
    fn test_cache_key_is_lowercase_sha256_hex() {
        assert_eq!(
            cache_key("cancer", 5, 0, "relevance"),
            "210afaf6fcb26412e439ebcd6715b06cca09170152079cd8c74fea832b73d798"
        );
    }
}
