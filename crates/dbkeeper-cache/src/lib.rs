//! dbkeeper-cache: in-memory cache of statement results.
//!
//! Entries are keyed by the normalized statement text plus its serialized
//! parameters and expire after a per-entry TTL. When full, the entry with
//! the lowest `created_ms - hits * hit_weight_ms` score is evicted. Each hit
//! counts as `hit_weight_ms` of extra age, so this is a recency heuristic
//! rather than strict LRU.

pub mod cache;

pub use cache::{CacheError, CacheStats, QueryCache, cache_key};
