//! # Ouroboros Query (ouroboros-query)
//!
//! A tiered, in-process cache for remote query results.
//!
//! ## Features
//!
//! - Structured query keys normalized to one canonical string
//! - At most one fetch in flight per key, shared by every reader
//! - Three freshness tiers (default, slow, realtime) with per-query overrides
//! - Stale data served while a background refresh runs
//! - Failure classification: auth (401/403) and validation (400/422) failures
//!   surface immediately, transient ones are retried with backoff
//! - Idle eviction driven by reader counts
//! - Periodic refresh for realtime entries, no refetch on window focus
//! - Lifecycle events on a broadcast channel
//!
//! ## Reading a Query
//!
//! ```no_run
//! use ouroboros_query::{query_key, CacheConfig, FetchError, QueryCache, Tier};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = QueryCache::new(CacheConfig::default());
//!
//!     let mut stats = cache.use_query(query_key!["dashboard", "stats"], Tier::Realtime, || async {
//!         Ok::<_, FetchError>(vec![1u64, 2, 3])
//!     });
//!
//!     let snapshot = stats.settled().await?;
//!     println!("Status: {}, data: {:?}", snapshot.status, snapshot.data);
//!     Ok(())
//! }
//! ```
//!
//! ## Handling Failures
//!
//! Fetch functions report failures as [`FetchError`]. Typed variants and HTTP
//! statuses drive the retry decision:
//!
//! ```no_run
//! use ouroboros_query::{query_key, CacheConfig, FetchError, QueryCache, QueryStatus, Tier};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = QueryCache::new(CacheConfig::default());
//!
//!     let mut me = cache.use_query(query_key!["me"], Tier::Default, || async {
//!         Err::<String, _>(FetchError::from_status(401, "session expired"))
//!     });
//!
//!     // Not retried: a single attempt, then the error is visible
//!     let snapshot = me.settled().await?;
//!     assert_eq!(snapshot.status, QueryStatus::Error);
//!
//!     // After re-authenticating, retry explicitly
//!     let _ = me.refetch_now().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! Tier windows and retry behaviour come from [`CacheConfig`], built in code
//! or loaded from `QUERY_CACHE_*` environment variables (a `.env` file is
//! read if present):
//!
//! ```no_run
//! use ouroboros_query::{CacheConfig, QueryCache};
//!
//! # fn main() -> anyhow::Result<()> {
//! let cache = QueryCache::try_new(CacheConfig::from_env()?)?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod logging;

// Re-export main types for convenience
pub use cache::{
    Backoff, CacheConfig, CacheConfigBuilder, CacheEntry, CacheEvent, CacheEventKind, CacheKey,
    CacheStats, CacheValue, EntrySnapshot, FailureKind, FetchTrigger, Query, QueryCache, QueryKey,
    QueryOptions, QuerySnapshot, QueryStatus, RetryClassifier, RetryPolicy, Subscription, Tier,
    TierPolicy,
};
pub use error::{CacheError, FetchError, Result};
