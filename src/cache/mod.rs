//! # Tiered Query Cache
//!
//! An in-process cache of remote query results, keyed by structured query
//! descriptors and governed by per-tier freshness rules.
//!
//! ## Features
//!
//! - **Key Normalization**: Structurally equal descriptors share one entry
//! - **In-Flight Deduplication**: At most one fetch per key at any time
//! - **Stale-While-Revalidate**: Stale data is served while a refresh runs
//! - **Retry Classification**: Auth and validation failures surface at once;
//!   transient failures are retried with backoff up to three attempts
//! - **Idle Eviction**: Entries go once unread for their tier's window
//! - **Realtime Refresh**: Entries in use on the realtime tier are refetched
//!   on a fixed interval regardless of staleness
//!
//! ## Tiers
//!
//! | Tier     | Stale after | Evicted after | Refresh interval |
//! |----------|-------------|---------------|------------------|
//! | default  | 5 min       | 15 min        | none             |
//! | slow     | 10 min      | 30 min        | none             |
//! | realtime | 30 s        | 2 min         | 30 s             |
//!
//! ## Example
//!
//! ```rust,no_run
//! use ouroboros_query::cache::{CacheConfig, QueryCache, Tier};
//! use ouroboros_query::{query_key, FetchError};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = QueryCache::new(CacheConfig::default());
//!
//! // First reader fetches; later readers within 5 minutes are served from cache
//! let mut sub = cache.ensure(query_key!["projects", 42], Tier::Default, || async {
//!     Ok::<_, FetchError>(json!({ "id": 42, "name": "ouroboros" }))
//! });
//!
//! let snapshot = sub.settled().await?;
//! println!("{}: {:?}", snapshot.status, snapshot.data);
//!
//! // Force the next read to refetch
//! cache.invalidate(query_key!["projects", 42]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod events;
pub mod key;
pub mod policy;
pub mod query;
pub mod retry;
pub(crate) mod scheduler;
pub mod store;
pub mod types;

pub use config::{CacheConfig, CacheConfigBuilder, QueryOptions, Tier, TierPolicy};
pub use entry::{CacheEntry, EntrySnapshot, QueryStatus};
pub use events::{CacheEvent, CacheEventKind, FetchTrigger};
pub use key::{CacheKey, QueryKey};
pub use query::{Query, QuerySnapshot};
pub use retry::{Backoff, DefaultRetryClassifier, FailureKind, RetryClassifier, RetryPolicy};
pub use store::{start_auto_cleanup, FetchFn, FetchFuture, QueryCache, Subscription};
pub use types::{CacheStats, CacheValue};
