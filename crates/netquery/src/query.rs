//! The consumer-facing side of the cache: a [`QueryClient`] shared by all consumers, and one
//! [`Query`] per place that observes a request.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheEntry, QueryCache, QueryStatus, Subscription, Timing};
use crate::config::QueryConfig;
use crate::error::QueryResponse;
use crate::fetch::{Fetcher, SharedFetcher};
use crate::key::{QueryKey, QueryRequest, derive_key};

/// How results of a query are cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Use the configured timings.
    #[default]
    Default,
    /// Always refetch, and evict results as soon as nobody observes them anymore.
    NoCache,
    /// Never refetch on its own, and never evict.
    NoExpiration,
}

impl CachePolicy {
    /// The timing of a query with this policy.
    pub fn resolve(self, defaults: &QueryConfig) -> Timing {
        match self {
            Self::Default => Timing::from(*defaults),
            Self::NoCache => Timing {
                stale_time: Some(Duration::ZERO),
                gc_time: Some(Duration::ZERO),
            },
            Self::NoExpiration => Timing {
                stale_time: None,
                gc_time: None,
            },
        }
    }
}

/// Per call site settings of a query.
///
/// `stale_time` and `gc_time` override the client's defaults for this call site. The policy is
/// applied last, so `NoCache` and `NoExpiration` win over both overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub policy: CachePolicy,
    #[serde(with = "humantime_serde")]
    pub stale_time: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub gc_time: Option<Duration>,
}

impl QueryOptions {
    pub fn no_cache() -> Self {
        Self {
            policy: CachePolicy::NoCache,
            ..Default::default()
        }
    }

    pub fn no_expiration() -> Self {
        Self {
            policy: CachePolicy::NoExpiration,
            ..Default::default()
        }
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    /// The timing of a query with these options.
    pub fn resolve(&self, defaults: &QueryConfig) -> Timing {
        let defaults = QueryConfig {
            stale_time: self.stale_time.or(defaults.stale_time),
            gc_time: self.gc_time.or(defaults.gc_time),
        };
        self.policy.resolve(&defaults)
    }
}

/// What a [`Query`] currently shows.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    pub data: Option<T>,
    pub success: bool,
    pub is_loading: bool,
    pub error_code: Option<i64>,
    pub error_msg: Option<String>,
    pub query_key: QueryKey,
}

impl<T> QueryResult<T> {
    fn new(entry: CacheEntry<T>, query_key: QueryKey) -> Self {
        Self {
            is_loading: entry.status == QueryStatus::Loading,
            data: entry.data,
            success: entry.success,
            error_code: entry.error_code,
            error_msg: entry.error_msg,
            query_key,
        }
    }
}

/// Gives consumers access to a shared [`QueryCache`].
///
/// The client bundles the cache with the [`Fetcher`] that fills it and the default timings of
/// queries. It is cheap to clone.
pub struct QueryClient<T> {
    cache: QueryCache<T>,
    fetcher: SharedFetcher<T>,
    defaults: QueryConfig,
}

impl<T> Clone for QueryClient<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            fetcher: self.fetcher.clone(),
            defaults: self.defaults,
        }
    }
}

impl<T> fmt::Debug for QueryClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("cache", &self.cache)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> QueryClient<T> {
    /// Creates a client with a new, empty cache.
    pub fn new(fetcher: impl Fetcher<T> + 'static, defaults: QueryConfig) -> Self {
        Self::with_cache(QueryCache::new(), Arc::new(fetcher), defaults)
    }

    /// Creates a client on top of an existing cache.
    pub fn with_cache(
        cache: QueryCache<T>,
        fetcher: SharedFetcher<T>,
        defaults: QueryConfig,
    ) -> Self {
        Self {
            cache,
            fetcher,
            defaults,
        }
    }

    pub fn cache(&self) -> &QueryCache<T> {
        &self.cache
    }

    pub fn defaults(&self) -> &QueryConfig {
        &self.defaults
    }

    /// Starts observing `request`.
    ///
    /// This subscribes to the request's key right away, but does not fetch. Call
    /// [`Query::fetch`] for that. `None` creates a query that has nothing to request.
    pub fn query(&self, request: Option<QueryRequest>, options: QueryOptions) -> Query<T> {
        let key = derive_key(request.as_ref());
        let timing = options.resolve(&self.defaults);
        let subscription = self.cache.subscribe_with(&key, timing);
        Query {
            client: self.clone(),
            timing,
            subscription,
        }
    }

    /// Fetches `request` unless it is cached and fresh, without observing it.
    ///
    /// The result is retained for the query's grace period.
    pub fn fetch(
        &self,
        request: &QueryRequest,
        options: QueryOptions,
    ) -> BoxFuture<'static, QueryResponse<T>> {
        let key = QueryKey::from_request(request);
        let timing = options.resolve(&self.defaults);
        self.cache.ensure_fresh(&key, &self.fetcher, timing)
    }

    /// Marks the cached result of `request` as stale.
    pub fn invalidate(&self, request: &QueryRequest) -> bool {
        self.cache.invalidate(&QueryKey::from_request(request))
    }

    /// Marks the cached results of all requests to `url` as stale.
    pub fn invalidate_url(&self, url: &str) -> usize {
        self.cache.invalidate_url(url)
    }
}

/// A single consumer's view of a request.
///
/// The query keeps the cached result of its request alive while it exists.
pub struct Query<T> {
    client: QueryClient<T>,
    timing: Timing,
    subscription: Subscription<T>,
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("subscription", &self.subscription)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Query<T> {
    pub fn key(&self) -> &QueryKey {
        self.subscription.key()
    }

    pub fn request(&self) -> Option<&QueryRequest> {
        self.key().request()
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    /// The current state of the query.
    pub fn result(&self) -> QueryResult<T> {
        QueryResult::new(self.subscription.current(), self.key().clone())
    }

    /// Makes sure the result is fresh, fetching it if needed, and returns the outcome.
    ///
    /// The fetch starts right away. While it is in flight, [`result`](Self::result) reports
    /// `is_loading` together with the previous data.
    pub fn fetch(&self) -> BoxFuture<'static, QueryResponse<T>> {
        self.client
            .cache
            .ensure_fresh(self.key(), &self.client.fetcher, self.timing)
    }

    /// Fetches the request again, no matter how fresh the cached result is.
    ///
    /// Resolves to the outcome of that fetch. A fetch that is already in flight is waited out
    /// first.
    pub fn reload_data(&self) -> BoxFuture<'static, QueryResponse<T>> {
        self.client
            .cache
            .refetch(self.key(), &self.client.fetcher, self.timing)
    }

    /// Switches the query to another request.
    ///
    /// Returns `false` if the request maps to the same key, in which case nothing changes.
    pub fn set_request(&mut self, request: Option<QueryRequest>) -> bool {
        let key = derive_key(request.as_ref());
        if &key == self.key() {
            return false;
        }

        // The new key is subscribed before the old one is released.
        let subscription = self.client.cache.subscribe_with(&key, self.timing);
        let previous = std::mem::replace(&mut self.subscription, subscription);
        drop(previous);
        tracing::trace!(key = %self.key(), "query switched request");
        true
    }

    /// Waits until the result of the query changes, and returns it.
    ///
    /// A query without a request never changes.
    pub async fn changed(&mut self) -> QueryResult<T> {
        let entry = self.subscription.changed().await;
        QueryResult::new(entry, self.key().clone())
    }
}
