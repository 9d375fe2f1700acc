//! Main cache store: normalized key → entry, reader tracking and invalidation

use crate::cache::{
    config::{CacheConfig, QueryOptions, TierPolicy},
    entry::{CacheEntry, EntrySnapshot},
    events::{CacheEvent, CacheEventKind, FetchTrigger},
    key::{CacheKey, QueryKey},
    policy::{blocks_auto_fetch, is_evictable, is_stale},
    retry::RetryClassifier,
    scheduler,
    types::{CacheStats, CacheValue},
};
use crate::error::{CacheError, FetchError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Future produced by a fetch function
pub type FetchFuture = BoxFuture<'static, std::result::Result<CacheValue, FetchError>>;

/// Type-erased fetch function registered for a key
pub type FetchFn = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Outcome of one fetch cycle, observable by any number of waiters
pub(crate) type SharedFetch = Shared<FetchFuture>;

/// The fetch cycle currently owning a key
pub(crate) struct InFlight {
    pub(crate) id: u64,
    pub(crate) shared: SharedFetch,
}

/// Everything the store keeps per key
pub(crate) struct Slot {
    /// Distinguishes this slot from any later one created under the same key
    pub(crate) id: u64,
    pub(crate) entry: CacheEntry,
    pub(crate) policy: TierPolicy,
    /// Most recently registered fetch function
    pub(crate) fetcher: Option<FetchFn>,
    pub(crate) in_flight: Option<InFlight>,
    /// Bumped by every invalidation; a fetch started under an older
    /// generation does not clear the invalidated flag
    pub(crate) generation: u64,
    pub(crate) eviction_task: Option<JoinHandle<()>>,
    pub(crate) refresh_task: Option<JoinHandle<()>>,
    /// Period of the running refresh loop
    pub(crate) refresh_period: Option<Duration>,
    pub(crate) updates: watch::Sender<EntrySnapshot>,
}

impl Slot {
    fn new(id: u64, query_key: QueryKey, policy: TierPolicy) -> Self {
        let entry = CacheEntry::new(query_key);
        let (updates, _) = watch::channel(entry.snapshot());
        Self {
            id,
            entry,
            policy,
            fetcher: None,
            in_flight: None,
            generation: 0,
            eviction_task: None,
            refresh_task: None,
            refresh_period: None,
            updates,
        }
    }

    /// Push the current entry state to every subscriber
    pub(crate) fn publish(&self) {
        self.updates.send_replace(self.entry.snapshot());
    }

    pub(crate) fn disarm_eviction(&mut self) {
        if let Some(task) = self.eviction_task.take() {
            task.abort();
        }
        self.entry.eviction_pending = false;
    }

    pub(crate) fn stop_refresh(&mut self) {
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        self.refresh_period = None;
    }

    fn cancel_tasks(&mut self) {
        self.disarm_eviction();
        self.stop_refresh();
    }
}

/// Internal cache storage
pub(crate) struct StoreState {
    pub(crate) slots: HashMap<CacheKey, Slot>,
    pub(crate) stats: CacheStats,
}

/// Shared state behind every [`QueryCache`] handle
pub(crate) struct CacheInner {
    pub(crate) config: CacheConfig,
    pub(crate) classifier: Arc<dyn RetryClassifier>,
    /// Never held across an await
    pub(crate) state: Mutex<StoreState>,
    pub(crate) events: broadcast::Sender<CacheEvent>,
    next_id: AtomicU64,
}

impl CacheInner {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn emit(&self, kind: CacheEventKind, key: &CacheKey) {
        // No receivers is fine
        let _ = self.events.send(CacheEvent::new(kind, key.clone()));
    }
}

/// Tiered, key-addressed query cache
///
/// This implementation provides:
/// - One in-flight fetch per key; concurrent readers share its outcome
/// - Background refresh of stale entries while old data is still served
/// - Retry of transient failures, immediate surfacing of auth/validation ones
/// - Eviction of entries nobody has read for the tier's idle window
/// - Unconditional periodic refresh for realtime entries in use
///
/// `QueryCache` is a cheap handle; clone it to share one cache across the
/// application. Operations that start fetches or timers spawn Tokio tasks and
/// must run inside a Tokio runtime.
#[derive(Clone)]
pub struct QueryCache {
    pub(crate) inner: Arc<CacheInner>,
}

impl QueryCache {
    /// Create a new cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        let classifier = Arc::new(config.retry.classifier());
        Self::with_classifier(config, classifier)
    }

    /// Create a cache after validating its configuration
    pub fn try_new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Create a cache with a custom retry classifier
    ///
    /// The classifier decides whether an attempt is retried; the delay before
    /// the next attempt still comes from `config.retry.backoff`.
    pub fn with_classifier(config: CacheConfig, classifier: Arc<dyn RetryClassifier>) -> Self {
        info!("Initializing query cache with config: {:?}", config);

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = CacheInner {
            config,
            classifier,
            state: Mutex::new(StoreState {
                slots: HashMap::new(),
                stats: CacheStats::default(),
            }),
            events,
            next_id: AtomicU64::new(1),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// The configuration this cache was built with
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Look up an entry without registering a reader or fetching
    pub fn get(&self, key: impl Into<QueryKey>) -> Option<CacheEntry> {
        let key = key.into().cache_key();
        let state = self.inner.state.lock();
        state.slots.get(&key).map(|slot| slot.entry.clone())
    }

    /// True if an entry exists for the key
    pub fn contains_key(&self, key: impl Into<QueryKey>) -> bool {
        let key = key.into().cache_key();
        self.inner.state.lock().slots.contains_key(&key)
    }

    /// Register a reader for `key`, fetching if the entry is absent or stale
    ///
    /// A fetch already in flight for the key is joined rather than repeated.
    /// The returned [`Subscription`] streams snapshots until it is dropped.
    pub fn ensure<F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        options: impl Into<QueryOptions>,
        fetch: F,
    ) -> Subscription
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<CacheValue, FetchError>> + Send + 'static,
    {
        let fetcher: FetchFn = Arc::new(move || fetch().boxed());
        self.ensure_with(key.into(), options.into(), fetcher)
    }

    /// [`ensure`](Self::ensure) with an already type-erased fetch function
    pub fn ensure_with(&self, query_key: QueryKey, options: QueryOptions, fetcher: FetchFn) -> Subscription {
        let key = query_key.cache_key();
        let policy = options.resolve(&self.inner.config);
        let now = Instant::now();

        let mut state = self.inner.state.lock();
        let StoreState { slots, stats } = &mut *state;

        let mut created = false;
        let slot = slots.entry(key.clone()).or_insert_with(|| {
            created = true;
            Slot::new(self.inner.next_id(), query_key.clone(), policy)
        });
        if created {
            debug!("Creating cache entry: {}", key);
            self.inner.emit(CacheEventKind::Created, &key);
        }

        slot.policy = policy;
        slot.fetcher = Some(fetcher);
        slot.entry.active_readers += 1;
        if slot.entry.eviction_pending {
            debug!("Reader returned, eviction disarmed: {}", key);
        }
        slot.disarm_eviction();

        let trigger = if slot.in_flight.is_some() {
            debug!("Joining in-flight fetch: {}", key);
            stats.deduplicated += 1;
            None
        } else if blocks_auto_fetch(&slot.entry) {
            debug!("Entry in terminal error, not refetching: {}", key);
            None
        } else if slot.entry.invalidated {
            Some(FetchTrigger::Invalidated)
        } else if slot.entry.fetched_at.is_none() {
            Some(FetchTrigger::Initial)
        } else if is_stale(&slot.entry, &slot.policy, now) {
            Some(FetchTrigger::Stale)
        } else {
            debug!("Cache hit: {}", key);
            stats.hits += 1;
            None
        };

        if let Some(trigger) = trigger {
            debug!("Cache miss ({}): {}", trigger, key);
            stats.misses += 1;
            scheduler::start_fetch_locked(&self.inner, stats, &key, slot, trigger);
        }

        // The latest registration decides whether and how often to refresh
        let period = slot.policy.refresh_interval.filter(|interval| !interval.is_zero());
        if slot.refresh_task.is_some() && slot.refresh_period != period {
            debug!("Refresh interval changed for {}: {:?}", key, period);
            slot.stop_refresh();
        }
        if let Some(interval) = period {
            if slot.refresh_task.is_none() {
                slot.refresh_task = Some(scheduler::spawn_refresh_loop(&self.inner, key.clone(), interval));
                slot.refresh_period = Some(interval);
            }
        }

        // Subscribe last so the reader starts from the post-decision state
        let receiver = slot.updates.subscribe();
        let slot_id = slot.id;

        stats.entries = slots.len();
        drop(state);

        Subscription {
            id: self.inner.next_id(),
            slot_id,
            key,
            query_key,
            receiver,
            cache: Arc::downgrade(&self.inner),
        }
    }

    /// Detach a reader; the entry's eviction timer starts when none remain
    pub fn release(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Mark an entry stale regardless of its age
    ///
    /// With readers attached the entry is refetched immediately; otherwise
    /// the next reader triggers the fetch. A terminal error is cleared.
    /// Returns false when no entry exists for the key.
    pub fn invalidate(&self, key: impl Into<QueryKey>) -> bool {
        let key = key.into().cache_key();
        let mut state = self.inner.state.lock();
        let StoreState { slots, stats } = &mut *state;

        match slots.get_mut(&key) {
            Some(slot) => {
                self.invalidate_locked(stats, &key, slot);
                true
            }
            None => false,
        }
    }

    /// Invalidate every entry whose key starts with `prefix`
    pub fn invalidate_matching(&self, prefix: impl Into<QueryKey>) -> usize {
        let prefix = prefix.into();
        let mut state = self.inner.state.lock();
        let StoreState { slots, stats } = &mut *state;

        let mut count = 0;
        for (key, slot) in slots.iter_mut() {
            if slot.entry.query_key.starts_with(&prefix) {
                self.invalidate_locked(stats, key, slot);
                count += 1;
            }
        }

        info!("Invalidated {} entries matching prefix: {}", count, prefix);
        count
    }

    fn invalidate_locked(&self, stats: &mut CacheStats, key: &CacheKey, slot: &mut Slot) {
        slot.generation += 1;
        slot.entry.invalidated = true;
        stats.invalidations += 1;
        self.inner.emit(CacheEventKind::Invalidated, key);
        debug!("Invalidated cache entry: {}", key);

        // An in-flight fetch gets a follow-up once it settles
        if slot.entry.active_readers > 0 && slot.in_flight.is_none() {
            stats.misses += 1;
            scheduler::start_fetch_locked(&self.inner, stats, key, slot, FetchTrigger::Invalidated);
        }
    }

    /// Fetch now, bypassing the staleness check, and wait for the outcome
    ///
    /// Joins the in-flight fetch if there is one. After a terminal error this
    /// resets the retry count and starts a fresh classification cycle. Fails
    /// with [`CacheError::UnknownKey`] when the key has never been ensured.
    pub async fn refetch_now(&self, key: impl Into<QueryKey>) -> Result<CacheValue> {
        let key = key.into().cache_key();

        let pending = {
            let mut state = self.inner.state.lock();
            let StoreState { slots, stats } = &mut *state;
            let slot = slots
                .get_mut(&key)
                .ok_or_else(|| CacheError::UnknownKey(key.to_string()))?;

            match &slot.in_flight {
                Some(in_flight) => {
                    stats.deduplicated += 1;
                    in_flight.shared.clone()
                }
                None => {
                    slot.entry.retry_count = 0;
                    scheduler::start_fetch_locked(&self.inner, stats, &key, slot, FetchTrigger::Manual)
                        .ok_or_else(|| CacheError::UnknownKey(key.to_string()))?
                }
            }
        };

        pending.await.map_err(CacheError::Fetch)
    }

    /// Refresh stale in-use entries after the application regains focus
    ///
    /// Does nothing unless `refetch_on_focus` is enabled. Returns the number
    /// of fetches started.
    pub fn focus_regained(&self) -> usize {
        if !self.inner.config.refetch_on_focus {
            debug!("Focus regained; refetch on focus disabled");
            return 0;
        }

        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let StoreState { slots, stats } = &mut *state;

        let mut started = 0;
        for (key, slot) in slots.iter_mut() {
            let eligible = slot.entry.active_readers > 0
                && slot.in_flight.is_none()
                && !blocks_auto_fetch(&slot.entry)
                && (slot.entry.invalidated || is_stale(&slot.entry, &slot.policy, now));
            if eligible {
                stats.misses += 1;
                scheduler::start_fetch_locked(&self.inner, stats, key, slot, FetchTrigger::Focus);
                started += 1;
            }
        }

        debug!("Focus regained; refreshed {} entries", started);
        started
    }

    /// Remove a specific entry, cancelling its timers
    ///
    /// A fetch in flight still completes for its waiters but is no longer
    /// recorded. Live subscriptions see [`CacheError::EntryRemoved`].
    pub fn remove(&self, key: impl Into<QueryKey>) -> bool {
        let key = key.into().cache_key();
        let mut state = self.inner.state.lock();

        match state.slots.remove(&key) {
            Some(mut slot) => {
                slot.cancel_tasks();
                state.stats.entries = state.slots.len();
                self.inner.emit(CacheEventKind::Removed, &key);
                debug!("Removed cache entry: {}", key);
                true
            }
            None => false,
        }
    }

    /// Clear all entries from the cache
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();

        let count = state.slots.len();
        for (key, mut slot) in state.slots.drain() {
            slot.cancel_tasks();
            self.inner.emit(CacheEventKind::Removed, &key);
        }
        state.stats.entries = 0;

        info!("Cleared {} entries from cache", count);
    }

    /// Evict every idle entry whose window has elapsed
    ///
    /// Timers normally handle this; the sweep catches entries released where
    /// no timer could be armed.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let mut state = self.inner.state.lock();

        let idle: Vec<CacheKey> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.in_flight.is_none() && is_evictable(&slot.entry, &slot.policy, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &idle {
            if let Some(mut slot) = state.slots.remove(key) {
                slot.cancel_tasks();
                state.stats.evictions += 1;
                self.inner.emit(CacheEventKind::Evicted, key);
            }
        }
        state.stats.entries = state.slots.len();

        if !idle.is_empty() {
            debug!("Swept {} idle entries", idle.len());
        }
        idle.len()
    }

    /// Receive a copy of every cache event from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.entries = state.slots.len();
        stats
    }

    /// Get number of entries in cache
    pub fn len(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().slots.is_empty()
    }
}

/// A live reader of one entry
///
/// Dropping the subscription releases the reader.
pub struct Subscription {
    id: u64,
    slot_id: u64,
    key: CacheKey,
    query_key: QueryKey,
    receiver: watch::Receiver<EntrySnapshot>,
    cache: Weak<CacheInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn query_key(&self) -> &QueryKey {
        &self.query_key
    }

    /// Current `{data, error, status}` of the entry
    pub fn snapshot(&self) -> EntrySnapshot {
        self.receiver.borrow().clone()
    }

    /// Wait for the next update
    pub async fn changed(&mut self) -> Result<EntrySnapshot> {
        self.receiver
            .changed()
            .await
            .map_err(|_| CacheError::EntryRemoved(self.key.to_string()))?;
        Ok(self.receiver.borrow_and_update().clone())
    }

    /// Wait until no fetch is in flight and return the settled snapshot
    pub async fn settled(&mut self) -> Result<EntrySnapshot> {
        loop {
            {
                let snapshot = self.receiver.borrow_and_update();
                if snapshot.status.is_settled() {
                    return Ok(snapshot.clone());
                }
            }
            self.receiver
                .changed()
                .await
                .map_err(|_| CacheError::EntryRemoved(self.key.to_string()))?;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.cache.upgrade() {
            scheduler::release(&inner, &self.key, self.slot_id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

/// Background task for periodic idle-entry sweeps
pub async fn start_auto_cleanup(cache: QueryCache) {
    let interval = cache.inner.config.cleanup_interval;
    if interval == Duration::ZERO {
        warn!("Cleanup interval is zero; auto cleanup not started");
        return;
    }

    info!("Starting automatic cache cleanup task (interval: {:?})", interval);

    loop {
        tokio::time::sleep(interval).await;

        let swept = cache.sweep_idle();
        if swept > 0 {
            debug!("Auto cleanup: {} entries evicted", swept);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::Tier;
    use crate::cache::entry::QueryStatus;
    use crate::cache::retry::Backoff;
    use crate::query_key;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn test_cache() -> QueryCache {
        QueryCache::new(CacheConfig::builder().backoff(Backoff::Immediate).build())
    }

    fn counting_fetch(
        calls: &Arc<AtomicUsize>,
    ) -> impl Fn() -> BoxFuture<'static, std::result::Result<CacheValue, FetchError>> + Send + Sync + 'static {
        let calls = calls.clone();
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(json!({ "call": n })) }.boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_read_fetches_and_settles() {
        let cache = test_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut sub = cache.ensure(query_key!["todos"], Tier::Default, counting_fetch(&calls));
        assert_eq!(sub.snapshot().status, QueryStatus::Loading);

        let snapshot = sub.settled().await.unwrap();
        assert_eq!(snapshot.status, QueryStatus::Success);
        assert_eq!(snapshot.data, Some(json!({ "call": 1 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.fetches, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_read_is_a_hit() {
        let cache = test_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut first = cache.ensure(query_key!["todos"], Tier::Default, counting_fetch(&calls));
        first.settled().await.unwrap();

        let second = cache.ensure(query_key!["todos"], Tier::Default, counting_fetch(&calls));
        assert_eq!(second.snapshot().status, QueryStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.get(query_key!["todos"]).unwrap().active_readers, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_read_serves_old_data_while_refreshing() {
        let cache = test_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut first = cache.ensure(query_key!["feed"], Tier::Default, counting_fetch(&calls));
        first.settled().await.unwrap();

        tokio::time::sleep(Duration::from_secs(301)).await;

        let mut second = cache.ensure(query_key!["feed"], Tier::Default, counting_fetch(&calls));
        let snapshot = second.snapshot();
        assert_eq!(snapshot.status, QueryStatus::Refreshing);
        assert_eq!(snapshot.data, Some(json!({ "call": 1 })));

        let snapshot = second.settled().await.unwrap();
        assert_eq!(snapshot.data, Some(json!({ "call": 2 })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_arms_and_reader_disarms_eviction() {
        let cache = test_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut sub = cache.ensure(query_key!["x"], Tier::Realtime, counting_fetch(&calls));
        sub.settled().await.unwrap();
        cache.release(sub);

        let entry = cache.get(query_key!["x"]).unwrap();
        assert_eq!(entry.active_readers, 0);
        assert!(entry.eviction_pending);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let _sub = cache.ensure(query_key!["x"], Tier::Realtime, counting_fetch(&calls));
        assert!(!cache.get(query_key!["x"]).unwrap().eviction_pending);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(cache.contains_key(query_key!["x"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_without_readers_defers_fetch() {
        let cache = test_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut sub = cache.ensure(query_key!["p"], Tier::Slow, counting_fetch(&calls));
        sub.settled().await.unwrap();
        drop(sub);

        assert!(cache.invalidate(query_key!["p"]));
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut sub = cache.ensure(query_key!["p"], Tier::Slow, counting_fetch(&calls));
        sub.settled().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cache.get(query_key!["p"]).unwrap().invalidated);
        assert!(!cache.invalidate(query_key!["missing"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_matching_prefix() {
        let cache = test_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let _a = cache.ensure(query_key!["projects", 1], Tier::Default, counting_fetch(&calls));
        let _b = cache.ensure(query_key!["projects", 2], Tier::Default, counting_fetch(&calls));
        let _c = cache.ensure(query_key!["users", 1], Tier::Default, counting_fetch(&calls));

        assert_eq!(cache.invalidate_matching(query_key!["projects"]), 2);
        assert_eq!(cache.stats().invalidations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_now_unknown_key() {
        let cache = test_cache();
        let result = cache.refetch_now(query_key!["nothing"]).await;
        assert!(matches!(result, Err(CacheError::UnknownKey(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_focus_regained_is_noop_by_default() {
        let cache = test_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut sub = cache.ensure(query_key!["f"], Tier::Default, counting_fetch(&calls));
        sub.settled().await.unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(cache.focus_regained(), 0);
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_focus_regained_when_enabled() {
        let cache = QueryCache::new(CacheConfig::builder().refetch_on_focus(true).build());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut sub = cache.ensure(query_key!["f"], Tier::Default, counting_fetch(&calls));
        sub.settled().await.unwrap();
        assert_eq!(cache.focus_regained(), 0);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(cache.focus_regained(), 1);
        sub.settled().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_clear() {
        let cache = test_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut sub = cache.ensure(query_key!["r"], Tier::Default, counting_fetch(&calls));
        sub.settled().await.unwrap();
        let _other = cache.ensure(query_key!["s"], Tier::Default, counting_fetch(&calls));

        assert!(cache.remove(query_key!["r"]));
        assert!(matches!(sub.changed().await, Err(CacheError::EntryRemoved(_))));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_idle() {
        let cache = test_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut sub = cache.ensure(query_key!["idle"], Tier::Default, counting_fetch(&calls));
        sub.settled().await.unwrap();
        drop(sub);

        assert_eq!(cache.sweep_idle(), 0);
        assert!(cache.contains_key(query_key!["idle"]));

        // Whichever of the timer and the sweep gets there first evicts it
        tokio::time::advance(Duration::from_secs(15 * 60)).await;
        cache.sweep_idle();
        assert!(!cache.contains_key(query_key!["idle"]));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_are_broadcast() {
        let cache = test_cache();
        let mut events = cache.subscribe_events();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut sub = cache.ensure(query_key!["e"], Tier::Default, counting_fetch(&calls));
        sub.settled().await.unwrap();

        assert!(matches!(events.recv().await.unwrap().kind, CacheEventKind::Created));
        assert!(matches!(
            events.recv().await.unwrap().kind,
            CacheEventKind::FetchStarted { trigger: FetchTrigger::Initial }
        ));
        assert!(matches!(events.recv().await.unwrap().kind, CacheEventKind::FetchSucceeded));
    }
}
