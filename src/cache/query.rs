//! Typed query facade
//!
//! Callers work with their own types; the store keeps JSON. `use_query`
//! wraps the caller's fetch function so its result is serialized on the way
//! in, and [`Query`] deserializes snapshots on the way out.

use crate::cache::{
    config::QueryOptions,
    entry::{EntrySnapshot, QueryStatus},
    key::{CacheKey, QueryKey},
    store::{FetchFn, QueryCache, Subscription},
};
use crate::error::{FetchError, Result};
use chrono::{DateTime, Utc};
use futures::future::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Typed `{data, error, status}` view of an entry
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot<T> {
    pub status: QueryStatus,
    pub data: Option<T>,
    pub error: Option<FetchError>,
    pub updated_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl<T> QuerySnapshot<T> {
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_refreshing(&self) -> bool {
        self.status == QueryStatus::Refreshing
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}

impl<T: DeserializeOwned> QuerySnapshot<T> {
    fn decode(snapshot: EntrySnapshot) -> Result<Self> {
        let data = snapshot.data.map(serde_json::from_value).transpose()?;

        Ok(Self {
            status: snapshot.status,
            data,
            error: snapshot.error,
            updated_at: snapshot.updated_at,
            retry_count: snapshot.retry_count,
        })
    }
}

/// A typed reader of one cache entry
///
/// Holds a reader on the entry for as long as it lives.
pub struct Query<T> {
    subscription: Subscription,
    cache: QueryCache,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Query<T> {
    pub fn key(&self) -> &CacheKey {
        self.subscription.key()
    }

    pub fn query_key(&self) -> &QueryKey {
        self.subscription.query_key()
    }

    pub fn status(&self) -> QueryStatus {
        self.subscription.snapshot().status
    }

    /// Current state, decoded
    pub fn snapshot(&self) -> Result<QuerySnapshot<T>> {
        QuerySnapshot::decode(self.subscription.snapshot())
    }

    /// Current data, if any
    pub fn data(&self) -> Result<Option<T>> {
        Ok(self.snapshot()?.data)
    }

    /// Wait for the next update
    pub async fn changed(&mut self) -> Result<QuerySnapshot<T>> {
        QuerySnapshot::decode(self.subscription.changed().await?)
    }

    /// Wait until the entry holds the outcome of a completed fetch
    pub async fn settled(&mut self) -> Result<QuerySnapshot<T>> {
        QuerySnapshot::decode(self.subscription.settled().await?)
    }

    /// Mark this entry stale; it is refetched right away since this reader
    /// is attached
    pub fn invalidate(&self) -> bool {
        self.cache.invalidate(self.query_key())
    }

    /// Fetch now regardless of freshness and return the new data
    pub async fn refetch_now(&self) -> Result<T> {
        let value = self.cache.refetch_now(self.query_key()).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl<T> std::fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("key", self.subscription.key())
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl QueryCache {
    /// Read a typed query, fetching according to its tier
    ///
    /// Equivalent to [`ensure`](QueryCache::ensure) with a fetch function
    /// returning `T` instead of JSON. A result that cannot be serialized is
    /// reported as [`FetchError::Decode`] and is not retried.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use ouroboros_query::{query_key, CacheConfig, FetchError, QueryCache, Tier};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let cache = QueryCache::new(CacheConfig::default());
    ///
    /// let mut reviews = cache.use_query(query_key!["reviews", 7], Tier::Slow, || async {
    ///     Ok::<_, FetchError>(vec!["looks good".to_string()])
    /// });
    ///
    /// let snapshot = reviews.settled().await?;
    /// println!("{:?}", snapshot.data);
    /// # Ok(())
    /// # }
    /// ```
    pub fn use_query<T, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        options: impl Into<QueryOptions>,
        fetch: F,
    ) -> Query<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, FetchError>> + Send + 'static,
    {
        let fetcher: FetchFn = Arc::new(move || {
            let pending = fetch();
            async move {
                let value = pending.await?;
                serde_json::to_value(value).map_err(|e| FetchError::Decode(e.to_string()))
            }
            .boxed()
        });

        Query {
            subscription: self.ensure_with(key.into(), options.into(), fetcher),
            cache: self.clone(),
            _marker: PhantomData,
        }
    }
}
