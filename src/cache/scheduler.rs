//! Fetch cycles and per-entry timers
//!
//! A fetch cycle runs as its own Tokio task, so a reader that detaches never
//! cancels it; the cycle's outcome is a shared future that any number of
//! waiters can join. Eviction timers and realtime refresh loops are plain
//! spawned tasks whose handles live in the entry's slot and are aborted when
//! they no longer apply. All bookkeeping happens under the store lock, which
//! is never held across an await.

use crate::cache::{
    events::{CacheEventKind, FetchTrigger},
    key::CacheKey,
    policy::{blocks_auto_fetch, is_evictable},
    retry::FailureKind,
    store::{CacheInner, FetchFn, InFlight, SharedFetch, Slot, StoreState},
    types::{CacheStats, CacheValue},
};
use crate::error::FetchError;
use futures::future::FutureExt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

type FetchResult = Result<CacheValue, FetchError>;

fn owned_by(slot: &Slot, fetch_id: u64) -> bool {
    slot.in_flight.as_ref().map(|in_flight| in_flight.id) == Some(fetch_id)
}

/// Start a fetch cycle for a slot, or join the one already running
///
/// Returns `None` when no fetch function has been registered for the key.
pub(crate) fn start_fetch_locked(
    inner: &Arc<CacheInner>,
    stats: &mut CacheStats,
    key: &CacheKey,
    slot: &mut Slot,
    trigger: FetchTrigger,
) -> Option<SharedFetch> {
    if let Some(in_flight) = &slot.in_flight {
        return Some(in_flight.shared.clone());
    }

    let fetcher = match &slot.fetcher {
        Some(fetcher) => fetcher.clone(),
        None => {
            warn!("No fetch function registered for {}", key);
            return None;
        }
    };

    let fetch_id = inner.next_id();
    let shared = run_fetch(Arc::downgrade(inner), key.clone(), fetcher, fetch_id, slot.generation)
        .boxed()
        .shared();

    slot.in_flight = Some(InFlight {
        id: fetch_id,
        shared: shared.clone(),
    });
    slot.disarm_eviction();
    slot.entry.begin_fetch();
    slot.publish();

    stats.fetches += 1;
    inner.emit(CacheEventKind::FetchStarted { trigger }, key);
    debug!("Fetch started ({}): {}", trigger, key);

    // Drive the cycle to completion whether or not anyone awaits it
    tokio::spawn(shared.clone());

    Some(shared)
}

/// One fetch cycle: attempts until success or until the classifier gives up
async fn run_fetch(
    cache: Weak<CacheInner>,
    key: CacheKey,
    fetcher: FetchFn,
    fetch_id: u64,
    generation: u64,
) -> FetchResult {
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let failure = match fetcher().await {
            Ok(value) => {
                if let Some(inner) = cache.upgrade() {
                    settle(&inner, &key, fetch_id, generation, Ok(value.clone()), attempt);
                }
                return Ok(value);
            }
            Err(failure) => failure,
        };

        let Some(inner) = cache.upgrade() else {
            return Err(failure);
        };

        if !inner.classifier.should_retry(attempt, &failure) {
            settle(&inner, &key, fetch_id, generation, Err(failure.clone()), attempt);
            return Err(failure);
        }

        let delay = inner.config.retry.backoff.delay_for(attempt);
        if !record_retry(&inner, &key, fetch_id, attempt, &failure, delay) {
            // Entry was removed; nobody is tracking this cycle any more
            return Err(failure);
        }
        drop(inner);

        tokio::time::sleep(delay).await;
    }
}

fn record_retry(
    inner: &Arc<CacheInner>,
    key: &CacheKey,
    fetch_id: u64,
    attempt: u32,
    failure: &FetchError,
    delay: Duration,
) -> bool {
    let mut state = inner.state.lock();
    let StoreState { slots, stats } = &mut *state;

    let Some(slot) = slots.get_mut(key).filter(|slot| owned_by(slot, fetch_id)) else {
        return false;
    };

    slot.entry.retry_count = attempt;
    slot.publish();
    stats.retries += 1;
    inner.emit(CacheEventKind::RetryScheduled { attempt, delay }, key);
    warn!(
        "Attempt {} for {} failed ({}), retrying in {:?}",
        attempt, key, failure, delay
    );

    true
}

/// Record the outcome of a fetch cycle and decide what happens next
fn settle(
    inner: &Arc<CacheInner>,
    key: &CacheKey,
    fetch_id: u64,
    generation: u64,
    outcome: FetchResult,
    attempts: u32,
) {
    let mut state = inner.state.lock();
    let StoreState { slots, stats } = &mut *state;

    let Some(slot) = slots.get_mut(key).filter(|slot| owned_by(slot, fetch_id)) else {
        debug!("Discarding fetch result for removed entry: {}", key);
        return;
    };

    slot.in_flight = None;
    match outcome {
        Ok(value) => {
            slot.entry.complete_success(value, Instant::now());
            inner.emit(CacheEventKind::FetchSucceeded, key);
            debug!("Fetch succeeded: {}", key);
        }
        Err(failure) => {
            let kind = FailureKind::classify(&failure);
            warn!(
                "Fetch failed for {} after {} attempt(s) ({}): {}",
                key, attempts, kind, failure
            );
            slot.entry.complete_failure(failure, attempts);
            stats.failures += 1;
            inner.emit(CacheEventKind::FetchFailed { kind, attempts }, key);
        }
    }

    let superseded = slot.generation != generation;
    if !superseded {
        slot.entry.invalidated = false;
    }
    slot.publish();

    if slot.entry.active_readers == 0 {
        arm_eviction_locked(inner, key, slot);
    } else if superseded {
        // Invalidated mid-flight: the data just stored is already stale
        stats.misses += 1;
        start_fetch_locked(inner, stats, key, slot, FetchTrigger::Invalidated);
    }
}

/// Detach one reader; at zero readers stop refreshing and arm eviction
///
/// A reader of a slot that has since been removed and re-created under the
/// same key holds no count on the new slot.
pub(crate) fn release(inner: &Arc<CacheInner>, key: &CacheKey, slot_id: u64) {
    let mut state = inner.state.lock();
    let Some(slot) = state.slots.get_mut(key).filter(|slot| slot.id == slot_id) else {
        debug!("Release of a reader from a removed entry: {}", key);
        return;
    };

    slot.entry.active_readers = slot.entry.active_readers.saturating_sub(1);
    if slot.entry.active_readers > 0 {
        return;
    }

    debug!("Last reader released: {}", key);
    slot.entry.last_release_at = Some(Instant::now());
    slot.stop_refresh();

    // A fetch in flight arms the timer when it settles
    if slot.in_flight.is_none() {
        arm_eviction_locked(inner, key, slot);
    }
}

/// (Re)start the idle timer for an entry without readers
pub(crate) fn arm_eviction_locked(inner: &Arc<CacheInner>, key: &CacheKey, slot: &mut Slot) {
    slot.disarm_eviction();

    // Release from a drop outside any runtime: leave it to sweep_idle
    let Ok(handle) = Handle::try_current() else {
        debug!("No runtime to arm eviction timer for {}", key);
        return;
    };

    let evict_after = slot.policy.evict_after;
    let cache = Arc::downgrade(inner);
    let timer_key = key.clone();

    slot.eviction_task = Some(handle.spawn(async move {
        tokio::time::sleep(evict_after).await;
        if let Some(inner) = cache.upgrade() {
            evict_if_idle(&inner, &timer_key);
        }
    }));
    slot.entry.eviction_pending = true;

    debug!("Eviction armed for {} in {:?}", key, evict_after);
}

/// Remove an entry if it is still idle past its window
pub(crate) fn evict_if_idle(inner: &CacheInner, key: &CacheKey) -> bool {
    let mut state = inner.state.lock();
    let now = Instant::now();

    let idle = state
        .slots
        .get(key)
        .map(|slot| slot.in_flight.is_none() && is_evictable(&slot.entry, &slot.policy, now))
        .unwrap_or(false);
    if !idle {
        return false;
    }

    if let Some(mut slot) = state.slots.remove(key) {
        // This may be the timer task itself; detach rather than abort
        slot.eviction_task = None;
        slot.stop_refresh();
    }
    state.stats.evictions += 1;
    state.stats.entries = state.slots.len();
    inner.emit(CacheEventKind::Evicted, key);

    debug!("Evicted idle entry: {}", key);
    true
}

/// Spawn the unconditional refresh loop of a realtime entry
///
/// The first tick fires one full period after the loop starts.
pub(crate) fn spawn_refresh_loop(inner: &Arc<CacheInner>, key: CacheKey, period: Duration) -> JoinHandle<()> {
    let cache = Arc::downgrade(inner);
    debug!("Refresh loop started for {} every {:?}", key, period);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Some(inner) = cache.upgrade() else {
                break;
            };
            if !refresh_tick(&inner, &key) {
                break;
            }
        }

        debug!("Refresh loop stopped: {}", key);
    })
}

/// Returns false once the loop should stop
fn refresh_tick(inner: &Arc<CacheInner>, key: &CacheKey) -> bool {
    let mut state = inner.state.lock();
    let StoreState { slots, stats } = &mut *state;

    let Some(slot) = slots.get_mut(key) else {
        return false;
    };

    if slot.entry.active_readers == 0 || slot.policy.refresh_interval.is_none() {
        slot.refresh_task = None;
        slot.refresh_period = None;
        return false;
    }

    if slot.in_flight.is_some() {
        stats.deduplicated += 1;
        return true;
    }

    if blocks_auto_fetch(&slot.entry) {
        debug!("Skipping interval refresh of failed entry: {}", key);
        return true;
    }

    start_fetch_locked(inner, stats, key, slot, FetchTrigger::Interval);
    true
}

#[cfg(test)]
mod tests {
    use crate::cache::config::{CacheConfig, Tier};
    use crate::cache::entry::QueryStatus;
    use crate::cache::events::{CacheEventKind, FetchTrigger};
    use crate::cache::retry::{Backoff, FailureKind};
    use crate::cache::store::QueryCache;
    use crate::cache::types::CacheValue;
    use crate::error::FetchError;
    use crate::query_key;
    use futures::future::{BoxFuture, FutureExt};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    type Outcome = Result<CacheValue, FetchError>;

    /// Plays back `outcomes` in order, repeating the last one forever
    fn scripted(
        calls: &Arc<AtomicUsize>,
        outcomes: Vec<Outcome>,
    ) -> impl Fn() -> BoxFuture<'static, Outcome> + Send + Sync + 'static {
        let calls = calls.clone();
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let outcome = outcomes.get(n).or(outcomes.last()).cloned().unwrap();
            async move { outcome }.boxed()
        }
    }

    /// Succeeds with the call number after `latency`
    fn slow(
        calls: &Arc<AtomicUsize>,
        latency: Duration,
    ) -> impl Fn() -> BoxFuture<'static, Outcome> + Send + Sync + 'static {
        let calls = calls.clone();
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                tokio::time::sleep(latency).await;
                Ok(json!(n))
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_readers_share_one_fetch() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut subs: Vec<_> = (0..5)
            .map(|_| cache.ensure(query_key!["shared"], Tier::Default, slow(&calls, Duration::from_millis(100))))
            .collect();

        for sub in subs.iter_mut() {
            let snapshot = sub.settled().await.unwrap();
            assert_eq!(snapshot.data, Some(json!(1)));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().deduplicated, 4);
        assert_eq!(cache.get(query_key!["shared"]).unwrap().active_readers, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_after_three_attempts() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let fetch = scripted(&calls, vec![Err(FetchError::Network("connection reset".into()))]);
        let mut sub = cache.ensure(query_key!["flaky"], Tier::Default, fetch);

        let snapshot = sub.settled().await.unwrap();
        assert_eq!(snapshot.status, QueryStatus::Error);
        assert_eq!(snapshot.retry_count, 3);
        assert!(snapshot.data.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // 1s after the first failure, 2s after the second
        assert_eq!(start.elapsed(), Duration::from_secs(3));

        let stats = cache.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.failures, 1);

        // No fourth attempt, neither later nor for a new reader
        tokio::time::sleep(Duration::from_secs(600)).await;
        let again = cache.ensure(
            query_key!["flaky"],
            Tier::Default,
            scripted(&calls, vec![Ok(json!("unused"))]),
        );
        assert_eq!(again.snapshot().status, QueryStatus::Error);
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_not_retried() {
        let cache = QueryCache::new(CacheConfig::default());
        let mut events = cache.subscribe_events();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = scripted(&calls, vec![Err(FetchError::from_status(401, "token expired"))]);
        let mut sub = cache.ensure(query_key!["me"], Tier::Default, fetch);

        let snapshot = sub.settled().await.unwrap();
        assert_eq!(snapshot.status, QueryStatus::Error);
        assert_eq!(snapshot.retry_count, 1);
        assert!(matches!(snapshot.error, Some(FetchError::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut failed = None;
        while let Ok(event) = events.try_recv() {
            if let CacheEventKind::FetchFailed { kind, attempts } = event.kind {
                failed = Some((kind, attempts));
            }
        }
        assert_eq!(failed, Some((FailureKind::Auth, 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_is_not_retried() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = scripted(&calls, vec![Err(FetchError::from_status(422, "bad filter"))]);
        let mut sub = cache.ensure(query_key!["search", "??"], Tier::Slow, fetch);

        assert_eq!(sub.settled().await.unwrap().status, QueryStatus::Error);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success_resets_count() {
        let backoff = Backoff::Fixed(Duration::from_secs(1));
        let cache = QueryCache::new(CacheConfig::builder().backoff(backoff).build());
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = scripted(
            &calls,
            vec![Err(FetchError::Http { status: 503, message: "unavailable".into() }), Ok(json!("ok"))],
        );
        let mut sub = cache.ensure(query_key!["recover"], Tier::Default, fetch);
        assert_eq!(sub.snapshot().status, QueryStatus::Loading);

        let retrying = sub.changed().await.unwrap();
        assert_eq!(retrying.status, QueryStatus::Loading);
        assert_eq!(retrying.retry_count, 1);

        let snapshot = sub.settled().await.unwrap();
        assert_eq!(snapshot.status, QueryStatus::Success);
        assert_eq!(snapshot.data, Some(json!("ok")));
        assert_eq!(snapshot.retry_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_now_clears_terminal_error() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = scripted(&calls, vec![Err(FetchError::Forbidden("no access".into())), Ok(json!({"ok": true}))]);
        let mut sub = cache.ensure(query_key!["admin"], Tier::Default, fetch);
        assert_eq!(sub.settled().await.unwrap().status, QueryStatus::Error);

        let value = cache.refetch_now(query_key!["admin"]).await.unwrap();
        assert_eq!(value, json!({"ok": true}));

        let snapshot = sub.snapshot();
        assert_eq!(snapshot.status, QueryStatus::Success);
        assert_eq!(snapshot.retry_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_during_fetch_schedules_follow_up() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut sub = cache.ensure(query_key!["orders"], Tier::Default, slow(&calls, Duration::from_millis(100)));
        assert!(cache.invalidate(query_key!["orders"]));

        // Still a single fetch in flight
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let snapshot = sub.settled().await.unwrap();
        assert_eq!(snapshot.data, Some(json!(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cache.get(query_key!["orders"]).unwrap().invalidated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_with_reader_refetches_immediately() {
        let cache = QueryCache::new(CacheConfig::default());
        let mut events = cache.subscribe_events();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut sub = cache.ensure(query_key!["cart"], Tier::Default, slow(&calls, Duration::ZERO));
        sub.settled().await.unwrap();

        cache.invalidate(query_key!["cart"]);
        assert_eq!(sub.snapshot().status, QueryStatus::Refreshing);
        assert_eq!(sub.snapshot().data, Some(json!(1)));

        assert_eq!(sub.settled().await.unwrap().data, Some(json!(2)));

        let triggers: Vec<FetchTrigger> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event.kind {
                CacheEventKind::FetchStarted { trigger } => Some(trigger),
                _ => None,
            })
            .collect();
        assert_eq!(triggers, vec![FetchTrigger::Initial, FetchTrigger::Invalidated]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_realtime_refreshes_every_interval() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let start = Instant::now();
        let _sub = cache.ensure(query_key!["ticker"], Tier::Realtime, slow(&calls, Duration::ZERO));

        // One fetch at 0s, then one each at 30s, 60s and 90s
        for (at, expected) in [(29, 1), (31, 2), (59, 2), (61, 3), (89, 3), (91, 4)] {
            tokio::time::sleep_until(start + Duration::from_secs(at)).await;
            assert_eq!(calls.load(Ordering::SeqCst), expected, "fetches after {}s", at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_stops_without_readers() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut sub = cache.ensure(query_key!["ticker"], Tier::Realtime, slow(&calls, Duration::ZERO));
        sub.settled().await.unwrap();
        drop(sub);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.contains_key(query_key!["ticker"]));

        // Realtime entries go 2 minutes after the last release
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(!cache.contains_key(query_key!["ticker"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistering_without_interval_stops_refresh() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut realtime = cache.ensure(query_key!["feed"], Tier::Realtime, slow(&calls, Duration::ZERO));
        realtime.settled().await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Still fresh under the default tier, so no fetch here either
        let _default = cache.ensure(query_key!["feed"], Tier::Default, slow(&calls, Duration::ZERO));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Back on the realtime tier the loop restarts
        let mut again = cache.ensure(query_key!["feed"], Tier::Realtime, slow(&calls, Duration::ZERO));
        again.settled().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_tier_eviction_window() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut sub = cache.ensure(query_key!["report"], Tier::Default, slow(&calls, Duration::ZERO));
        sub.settled().await.unwrap();
        cache.release(sub);

        tokio::time::sleep(Duration::from_secs(14 * 60)).await;
        assert!(cache.contains_key(query_key!["report"]));

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        assert!(!cache.contains_key(query_key!["report"]));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_during_fetch_arms_eviction_on_settle() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let sub = cache.ensure(query_key!["slow"], Tier::Realtime, slow(&calls, Duration::from_secs(5)));
        drop(sub);
        assert!(!cache.get(query_key!["slow"]).unwrap().eviction_pending);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let entry = cache.get(query_key!["slow"]).unwrap();
        assert_eq!(entry.status, QueryStatus::Success);
        assert!(entry.eviction_pending);

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        assert!(!cache.contains_key(query_key!["slow"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_for_removed_entry_is_discarded() {
        let cache = QueryCache::new(CacheConfig::default());
        let old_calls = Arc::new(AtomicUsize::new(0));
        let new_calls = Arc::new(AtomicUsize::new(0));

        let old = cache.ensure(query_key!["k"], Tier::Default, slow(&old_calls, Duration::from_secs(1)));
        assert!(cache.remove(query_key!["k"]));
        drop(old);

        let new_fetch = scripted(&new_calls, vec![Ok(json!("new"))]);
        let mut sub = cache.ensure(query_key!["k"], Tier::Default, new_fetch);
        assert_eq!(sub.settled().await.unwrap().data, Some(json!("new")));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(old_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(query_key!["k"]).unwrap().data, Some(json!("new")));
    }
}
