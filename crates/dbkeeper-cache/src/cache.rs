//! Statement result cache with TTL expiration and hit-weighted eviction.
//!
//! The cache is internally synchronized with a `std::sync::Mutex`; every
//! operation holds the lock only for map bookkeeping, so it can be shared
//! behind an `Arc` by request handlers and the metrics monitor alike.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dbkeeper_core::CacheConfig;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache exclusion pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    /// Estimated memory held by keys and serialized values.
    pub total_size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    /// Hits as a percentage of lookups (0.0 before the first lookup).
    pub hit_rate: f64,
    pub evictions: u64,
}

/// Build the cache key for a statement and its parameters.
///
/// The statement is lower-cased and its whitespace runs collapsed, so
/// formatting differences do not split entries. Returns `None` when the
/// parameters cannot be serialized.
pub fn cache_key<P: Serialize + ?Sized>(sql: &str, params: &P) -> Option<String> {
    let params = serde_json::to_string(params).ok()?;
    let statement = sql
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    Some(format!("{statement}|{params}"))
}

struct CacheEntry<V> {
    value: V,
    /// Milliseconds since the cache epoch when the entry was stored.
    created_ms: u64,
    expires_at: Instant,
    hits: u64,
    size_bytes: usize,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn eviction_score(&self, hit_weight_ms: u64) -> i128 {
        self.created_ms as i128 - self.hits as i128 * hit_weight_ms as i128
    }
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Bounded, TTL-based cache of statement results.
pub struct QueryCache<V = serde_json::Value> {
    config: CacheConfig,
    /// All exclusion patterns joined into one case-insensitive whole-word match.
    exclude: Option<Regex>,
    epoch: Instant,
    state: Mutex<CacheState<V>>,
}

impl<V: Clone + Serialize> QueryCache<V> {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        for pattern in &config.exclude_patterns {
            Regex::new(pattern).map_err(|source| CacheError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
        }
        let exclude = if config.exclude_patterns.is_empty() {
            None
        } else {
            let joined = config.exclude_patterns.join("|");
            let combined = format!(r"(?i)\b(?:{joined})\b");
            Some(
                Regex::new(&combined).map_err(|source| CacheError::InvalidPattern {
                    pattern: joined,
                    source,
                })?,
            )
        };

        Ok(Self {
            config,
            exclude,
            epoch: Instant::now(),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether results of `sql` may be stored: the cache is enabled and no
    /// exclusion pattern matches.
    pub fn is_cacheable(&self, sql: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        match &self.exclude {
            Some(exclude) => !exclude.is_match(sql),
            None => true,
        }
    }

    /// Look up a cached result. Expired entries are removed and count as misses.
    pub fn get<P: Serialize + ?Sized>(&self, sql: &str, params: &P) -> Option<V> {
        let key = cache_key(sql, params)?;
        let mut state = self.lock();
        let now = Instant::now();

        match state.entries.get(&key).map(|e| e.is_expired(now)) {
            Some(false) => {
                state.hits += 1;
                let entry = state.entries.get_mut(&key)?;
                entry.hits += 1;
                tracing::debug!(key = %key, entry_hits = entry.hits, "query cache hit");
                Some(entry.value.clone())
            }
            Some(true) => {
                state.entries.remove(&key);
                state.misses += 1;
                tracing::debug!(key = %key, "query cache miss (expired)");
                None
            }
            None => {
                state.misses += 1;
                tracing::debug!(key = %key, "query cache miss");
                None
            }
        }
    }

    /// Store a result. Does nothing for statements that are not cacheable.
    ///
    /// An existing entry for the same key is replaced in place; otherwise one
    /// entry is evicted first when the cache is full. `ttl` defaults to the
    /// configured `default_ttl_secs`.
    pub fn set<P: Serialize + ?Sized>(
        &self,
        sql: &str,
        params: &P,
        value: V,
        ttl: Option<Duration>,
    ) {
        if !self.is_cacheable(sql) {
            return;
        }
        let Some(key) = cache_key(sql, params) else {
            return;
        };
        let size_bytes = key.len()
            + serde_json::to_vec(&value)
                .map(|bytes| bytes.len())
                .unwrap_or_default();
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            created_ms: now.duration_since(self.epoch).as_millis() as u64,
            expires_at: now + ttl.unwrap_or_else(|| self.config.default_ttl()),
            hits: 0,
            size_bytes,
        };

        let mut state = self.lock();
        if !state.entries.contains_key(&key) && state.entries.len() >= self.config.max_size {
            self.evict_one(&mut state);
        }
        state.entries.insert(key, entry);
    }

    /// Drop every entry whose key mentions `table` (case-insensitive substring
    /// match). Returns the number of entries removed.
    pub fn invalidate_table(&self, table: &str) -> usize {
        let needle = table.to_lowercase();
        let mut state = self.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|key, _| !key.to_lowercase().contains(&needle));
        let removed = before - state.entries.len();
        if removed > 0 {
            tracing::info!(table = %table, removed, "invalidated cached results");
        }
        removed
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(now));
        before - state.entries.len()
    }

    /// Drop all entries. Counters are kept.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let lookups = state.hits + state.misses;
        let hit_rate = if lookups > 0 {
            state.hits as f64 / lookups as f64 * 100.0
        } else {
            0.0
        };
        CacheStats {
            entries: state.entries.len(),
            total_size_bytes: state.entries.values().map(|e| e.size_bytes).sum(),
            hits: state.hits,
            misses: state.misses,
            hit_rate,
            evictions: state.evictions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict_one(&self, state: &mut CacheState<V>) {
        let victim = state
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.eviction_score(self.config.hit_weight_ms))
            .map(|(key, _)| key.clone());

        if let Some(key) = victim {
            state.entries.remove(&key);
            state.evictions += 1;
            tracing::debug!(
                evicted = %key,
                evictions = state.evictions,
                "query cache eviction"
            );
        }
    }
}
