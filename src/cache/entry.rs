//! Cache entry state and the snapshots published to subscribers

use crate::cache::key::{CacheKey, QueryKey};
use crate::cache::types::CacheValue;
use crate::error::FetchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Lifecycle status of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// Created, nothing fetched yet
    Empty,

    /// First fetch in flight, no data to serve
    Loading,

    /// Data available
    Success,

    /// Last fetch cycle failed terminally
    Error,

    /// Data available and a refresh is in flight
    Refreshing,
}

impl QueryStatus {
    /// A fetch is in flight
    pub fn is_fetching(&self) -> bool {
        matches!(self, QueryStatus::Loading | QueryStatus::Refreshing)
    }

    /// The entry holds the outcome of a completed fetch cycle
    pub fn is_settled(&self) -> bool {
        matches!(self, QueryStatus::Success | QueryStatus::Error)
    }

    /// Data can be served
    pub fn has_data(&self) -> bool {
        matches!(self, QueryStatus::Success | QueryStatus::Refreshing)
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Empty => write!(f, "empty"),
            QueryStatus::Loading => write!(f, "loading"),
            QueryStatus::Success => write!(f, "success"),
            QueryStatus::Error => write!(f, "error"),
            QueryStatus::Refreshing => write!(f, "refreshing"),
        }
    }
}

/// A cache entry as seen through [`QueryCache::get`](crate::cache::QueryCache::get)
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Normalized key
    pub key: CacheKey,

    /// The descriptor the entry was created with
    pub query_key: QueryKey,

    pub status: QueryStatus,

    /// Present iff status is success or refreshing
    pub data: Option<CacheValue>,

    /// Present iff status is error
    pub last_error: Option<FetchError>,

    /// Monotonic time of the last successful fetch
    pub fetched_at: Option<Instant>,

    /// Wall-clock time of the last settled fetch
    pub updated_at: Option<DateTime<Utc>>,

    /// Failed attempts since the last success
    pub retry_count: u32,

    /// Live subscribers
    pub active_readers: usize,

    /// When the reader count last dropped to zero
    pub last_release_at: Option<Instant>,

    /// An eviction timer is armed
    pub eviction_pending: bool,

    /// Marked stale by an explicit invalidation
    pub invalidated: bool,

    /// Incremented every time a fetch settles
    pub version: u64,
}

impl CacheEntry {
    /// Create an empty entry for a key
    pub fn new(query_key: QueryKey) -> Self {
        Self {
            key: query_key.cache_key(),
            query_key,
            status: QueryStatus::Empty,
            data: None,
            last_error: None,
            fetched_at: None,
            updated_at: None,
            retry_count: 0,
            active_readers: 0,
            last_release_at: None,
            eviction_pending: false,
            invalidated: false,
            version: 0,
        }
    }

    /// Move into the fetching state matching the data on hand
    pub fn begin_fetch(&mut self) {
        self.status = if self.data.is_some() {
            QueryStatus::Refreshing
        } else {
            QueryStatus::Loading
        };
        self.last_error = None;
    }

    /// Record a successful fetch
    pub fn complete_success(&mut self, value: CacheValue, now: Instant) {
        self.status = QueryStatus::Success;
        self.data = Some(value);
        self.last_error = None;
        self.fetched_at = Some(now);
        self.updated_at = Some(Utc::now());
        self.retry_count = 0;
        self.version += 1;
    }

    /// Record a terminal failure after `attempts` failed attempts
    pub fn complete_failure(&mut self, failure: FetchError, attempts: u32) {
        self.status = QueryStatus::Error;
        self.data = None;
        self.last_error = Some(failure);
        self.updated_at = Some(Utc::now());
        self.retry_count = attempts;
        self.version += 1;
    }

    /// Age of the data, if any was ever fetched
    pub fn age(&self, now: Instant) -> Option<std::time::Duration> {
        self.fetched_at.map(|fetched| now.saturating_duration_since(fetched))
    }

    /// The view published to subscribers
    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            key: self.key.clone(),
            status: self.status,
            data: self.data.clone(),
            error: self.last_error.clone(),
            updated_at: self.updated_at,
            retry_count: self.retry_count,
            version: self.version,
        }
    }
}

/// Consistent `{data, error, status}` view of an entry at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub key: CacheKey,
    pub status: QueryStatus,
    pub data: Option<CacheValue>,
    pub error: Option<FetchError>,
    pub updated_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub version: u64,
}

impl EntrySnapshot {
    pub fn is_fetching(&self) -> bool {
        self.status.is_fetching()
    }
}
