//! Walkthrough of the three cache tiers against a simulated backend
//!
//! Usage:
//!   cargo run --example tiered_queries
//!
//! Environment variables:
//!   RUST_LOG                   - log filter (default: ouroboros_query=info; try
//!                                ouroboros_query=debug to see hits and misses)
//!   QUERY_CACHE_BACKOFF        - immediate | fixed | exponential (default: exponential)
//!   QUERY_CACHE_BACKOFF_MS     - base backoff delay in milliseconds (default: 1000)
//!   QUERY_CACHE_RETRY_ATTEMPTS - attempts per fetch, including the first (default: 3)

use anyhow::Result;
use ouroboros_query::{
    logging, query_key, CacheConfig, CacheEventKind, FetchError, Query, QueryCache, QueryStatus,
    Tier,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Project {
    id: u64,
    name: String,
    open_reviews: u32,
}

/// Stand-in for a remote API with a little latency and a flaky endpoint
#[derive(Clone, Default)]
struct Backend {
    requests: Arc<AtomicU32>,
}

impl Backend {
    async fn project(&self, id: u64) -> Result<Project, FetchError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(Project {
            id,
            name: format!("project-{}", id),
            open_reviews: n,
        })
    }

    async fn queue_depth(&self) -> Result<u32, FetchError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        // Every other call times out
        if n % 2 == 1 {
            return Err(FetchError::Timeout { timeout_ms: 2000 });
        }
        Ok(n * 3)
    }

    async fn admin_settings(&self) -> Result<String, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Err(FetchError::from_status(403, "admin role required"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();

    let cache = QueryCache::try_new(CacheConfig::from_env()?)?;
    let backend = Backend::default();

    let mut events = cache.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let CacheEventKind::FetchFailed { kind, attempts } = event.kind {
                info!("event: {} failed ({}, {} attempts)", event.key, kind, attempts);
            }
        }
    });

    info!("=== Default tier: concurrent readers share one fetch ===");
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let backend = backend.clone();
            cache.use_query(query_key!["projects", 7], Tier::Default, move || {
                let backend = backend.clone();
                async move { backend.project(7).await }
            })
        })
        .collect();

    for mut reader in readers {
        let snapshot = reader.settled().await?;
        info!("reader sees {:?}", snapshot.data);
    }
    info!("backend requests so far: {}", backend.requests.load(Ordering::SeqCst));

    info!("=== Realtime tier: transient failures are retried ===");
    let depth_backend = backend.clone();
    let mut depth = cache.use_query(query_key!["queue", "depth"], Tier::Realtime, move || {
        let backend = depth_backend.clone();
        async move { backend.queue_depth().await }
    });
    let snapshot = depth.settled().await?;
    info!(
        "queue depth {:?} (retries so far: {})",
        snapshot.data,
        cache.stats().retries
    );

    info!("=== Slow tier: authorization failures are not retried ===");
    let admin_backend = backend.clone();
    let mut settings = cache.use_query(query_key!["admin", "settings"], Tier::Slow, move || {
        let backend = admin_backend.clone();
        async move { backend.admin_settings().await }
    });
    let snapshot = settings.settled().await?;
    if snapshot.status == QueryStatus::Error {
        info!("settings unavailable: {:?}", snapshot.error);
    }

    info!("=== Invalidation ===");
    cache.invalidate(query_key!["projects", 7]);
    let refetch_backend = backend.clone();
    let mut refreshed: Query<Project> =
        cache.use_query(query_key!["projects", 7], Tier::Default, move || {
            let backend = refetch_backend.clone();
            async move { backend.project(7).await }
        });
    let project = refreshed.settled().await?;
    info!("refetched after invalidation: {:?}", project.data);

    info!("{}", cache.stats());
    Ok(())
}
