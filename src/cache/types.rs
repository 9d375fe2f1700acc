//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cached payload: the fetch result encoded as JSON so a single cache can
/// hold queries of different types
pub type CacheValue = serde_json::Value;

/// Statistics and metrics for cache performance monitoring
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from fresh data without fetching
    pub hits: u64,

    /// Reads that found the entry absent, stale or invalidated
    pub misses: u64,

    /// Fetch cycles started (one per logical fetch, retries excluded)
    pub fetches: u64,

    /// Requests that attached to an in-flight fetch instead of starting one
    pub deduplicated: u64,

    /// Extra attempts made after transient failures
    pub retries: u64,

    /// Fetch cycles that ended in a terminal error
    pub failures: u64,

    /// Explicit invalidations
    pub invalidations: u64,

    /// Entries removed after sitting idle
    pub evictions: u64,

    /// Number of entries currently in cache
    pub entries: usize,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }

    /// Share of fetch cycles that failed terminally, as a percentage
    pub fn failure_rate(&self) -> f64 {
        if self.fetches == 0 {
            0.0
        } else {
            (self.failures as f64 / self.fetches as f64) * 100.0
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, fetches: {}, deduplicated: {}, retries: {}, failures: {}, entries: {}, evictions: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.fetches,
            self.deduplicated,
            self.retries,
            self.failures,
            self.entries,
            self.evictions
        )
    }
}
