//! Staleness and eviction predicates
//!
//! Pure functions of an entry, its resolved tier windows and the current
//! instant. The store and the scheduler both decide through these.

use crate::cache::config::TierPolicy;
use crate::cache::entry::{CacheEntry, QueryStatus};
use tokio::time::Instant;

/// Data older than `stale_after`, or never fetched at all
pub fn is_stale(entry: &CacheEntry, policy: &TierPolicy, now: Instant) -> bool {
    match entry.fetched_at {
        Some(fetched_at) => now.saturating_duration_since(fetched_at) > policy.stale_after,
        None => true,
    }
}

/// No readers, and the idle window since the last release has elapsed
///
/// The eviction timer wakes exactly at the deadline, so the boundary itself
/// counts as elapsed.
pub fn is_evictable(entry: &CacheEntry, policy: &TierPolicy, now: Instant) -> bool {
    if entry.active_readers > 0 {
        return false;
    }
    match entry.last_release_at {
        Some(released) => now.saturating_duration_since(released) >= policy.evict_after,
        None => false,
    }
}

/// A terminal error waits for an explicit refetch or invalidation
pub fn blocks_auto_fetch(entry: &CacheEntry) -> bool {
    entry.status == QueryStatus::Error && !entry.invalidated
}
