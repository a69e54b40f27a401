//! In-memory TTL cache for Loki/Cortex query results.
//!
//! Two independent caches (logs and metrics) with per-cache statistics.
//! Entries expire lazily on read; when a cache is full the oldest entries by
//! creation time are evicted first.

use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use utoipa::ToSchema;

const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    created_at: Instant,
    ttl: Duration,
    hit_count: u64,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// Statistics for one cache side.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub hit_rate: f64,
}

impl CacheStats {
    fn update_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

/// Combined stats for both caches.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QueryCacheStats {
    pub loki: CacheStats,
    pub cortex: CacheStats,
}

pub struct QueryCache {
    max_entries: usize,
    default_ttl: Duration,
    loki: HashMap<u64, CacheEntry>,
    cortex: HashMap<u64, CacheEntry>,
    loki_stats: CacheStats,
    cortex_stats: CacheStats,
}

impl QueryCache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            max_entries,
            default_ttl,
            loki: HashMap::new(),
            cortex: HashMap::new(),
            loki_stats: CacheStats::default(),
            cortex_stats: CacheStats::default(),
        }
    }

    fn cache_key(query: &str, start: &str, end: &str, extra: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        query.hash(&mut hasher);
        start.hash(&mut hasher);
        end.hash(&mut hasher);
        extra.hash(&mut hasher);
        hasher.finish()
    }

    fn cleanup_expired(cache: &mut HashMap<u64, CacheEntry>, stats: &mut CacheStats) {
        let expired: Vec<u64> = cache
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            cache.remove(&key);
            stats.evictions += 1;
        }
        stats.size = cache.len();
    }

    fn evict_if_needed(
        cache: &mut HashMap<u64, CacheEntry>,
        stats: &mut CacheStats,
        max_entries: usize,
    ) {
        if cache.len() >= max_entries {
            let mut by_age: Vec<(u64, Instant)> =
                cache.iter().map(|(k, e)| (*k, e.created_at)).collect();
            by_age.sort_by_key(|(_, created)| *created);
            let to_remove = cache.len() - max_entries + 1;
            for (key, _) in by_age.into_iter().take(to_remove) {
                cache.remove(&key);
                stats.evictions += 1;
            }
        }
        stats.size = cache.len();
    }

    fn get_from(
        cache: &mut HashMap<u64, CacheEntry>,
        stats: &mut CacheStats,
        key: u64,
    ) -> Option<Value> {
        Self::cleanup_expired(cache, stats);
        match cache.get_mut(&key) {
            Some(entry) if !entry.is_expired() => {
                entry.hit_count += 1;
                stats.hits += 1;
                stats.update_hit_rate();
                Some(entry.value.clone())
            }
            _ => {
                stats.misses += 1;
                stats.update_hit_rate();
                None
            }
        }
    }

    pub fn get_loki(&mut self, query: &str, start: &str, end: &str, extra: &str) -> Option<Value> {
        let key = Self::cache_key(query, start, end, extra);
        Self::get_from(&mut self.loki, &mut self.loki_stats, key)
    }

    pub fn set_loki(
        &mut self,
        query: &str,
        start: &str,
        end: &str,
        extra: &str,
        value: Value,
        ttl: Option<Duration>,
    ) {
        Self::evict_if_needed(&mut self.loki, &mut self.loki_stats, self.max_entries);
        let key = Self::cache_key(query, start, end, extra);
        self.loki.insert(
            key,
            CacheEntry {
                value,
                created_at: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
                hit_count: 0,
            },
        );
        self.loki_stats.size = self.loki.len();
    }

    pub fn get_cortex(&mut self, query: &str, start: &str, end: &str, extra: &str) -> Option<Value> {
        let key = Self::cache_key(query, start, end, extra);
        Self::get_from(&mut self.cortex, &mut self.cortex_stats, key)
    }

    pub fn set_cortex(
        &mut self,
        query: &str,
        start: &str,
        end: &str,
        extra: &str,
        value: Value,
        ttl: Option<Duration>,
    ) {
        Self::evict_if_needed(&mut self.cortex, &mut self.cortex_stats, self.max_entries);
        let key = Self::cache_key(query, start, end, extra);
        self.cortex.insert(
            key,
            CacheEntry {
                value,
                created_at: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
                hit_count: 0,
            },
        );
        self.cortex_stats.size = self.cortex.len();
    }

    pub fn stats(&self) -> QueryCacheStats {
        QueryCacheStats {
            loki: self.loki_stats.clone(),
            cortex: self.cortex_stats.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.loki.clear();
        self.cortex.clear();
        self.loki_stats = CacheStats::default();
        self.cortex_stats = CacheStats::default();
        tracing::info!("Query cache cleared");
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL)
    }
}

/// Process-wide cache instance.
static CACHE: Lazy<Mutex<QueryCache>> = Lazy::new(|| Mutex::new(QueryCache::default()));

pub fn global() -> &'static Mutex<QueryCache> {
    &CACHE
}

/// Reset the global cache (for tests).
pub fn reset() {
    if let Ok(mut cache) = CACHE.lock() {
        cache.clear();
    }
}
