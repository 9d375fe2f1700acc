//! Cache lifecycle events
//!
//! Every transition the store makes is also published on a broadcast
//! channel, so dashboards and tests can watch fetches, retries, invalidations
//! and evictions without polling.

use crate::cache::key::CacheKey;
use crate::cache::retry::FailureKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happened to an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheEventKind {
    /// First reader created the entry
    Created,

    /// A fetch cycle started
    FetchStarted { trigger: FetchTrigger },

    /// A fetch cycle completed with data
    FetchSucceeded,

    /// An attempt failed and another one is scheduled
    RetryScheduled { attempt: u32, delay: Duration },

    /// A fetch cycle ended in a terminal error
    FetchFailed { kind: FailureKind, attempts: u32 },

    /// Marked stale by the caller
    Invalidated,

    /// Removed after sitting idle
    Evicted,

    /// Removed explicitly
    Removed,
}

/// Why a fetch cycle started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchTrigger {
    /// A reader found the entry absent
    Initial,

    /// A reader found the entry stale
    Stale,

    /// The entry was invalidated while in use
    Invalidated,

    /// A realtime refresh interval elapsed
    Interval,

    /// The caller asked for a refetch
    Manual,

    /// The application regained focus
    Focus,
}

impl std::fmt::Display for FetchTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchTrigger::Initial => write!(f, "initial"),
            FetchTrigger::Stale => write!(f, "stale"),
            FetchTrigger::Invalidated => write!(f, "invalidated"),
            FetchTrigger::Interval => write!(f, "interval"),
            FetchTrigger::Manual => write!(f, "manual"),
            FetchTrigger::Focus => write!(f, "focus"),
        }
    }
}

/// One entry transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEvent {
    pub kind: CacheEventKind,

    pub key: CacheKey,

    /// When the transition occurred
    pub timestamp: DateTime<Utc>,
}

impl CacheEvent {
    /// Create a new event stamped now
    pub fn new(kind: CacheEventKind, key: CacheKey) -> Self {
        Self {
            kind,
            key,
            timestamp: Utc::now(),
        }
    }
}
