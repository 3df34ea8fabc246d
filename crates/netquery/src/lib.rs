//! A keyed async query cache.
//!
//! Consumers describe what they want as a [`QueryRequest`]. The request is turned into a stable
//! [`QueryKey`], under which the [`QueryCache`] keeps the latest result. Fresh results are served
//! straight from the cache. Otherwise the cache runs the request through a [`Fetcher`], making
//! sure that there is never more than one fetch per key in flight, and notifies everyone who
//! [subscribed](QueryCache::subscribe) to the key.
//!
//! Most consumers go through a [`QueryClient`] and its [`Query`] handles.

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod key;
pub mod logging;
pub mod query;
pub mod utils;


pub use cache::{CacheEntry, QueryCache, QueryStatus, Subscription, Timing};
pub use config::{Config, QueryConfig};
pub use error::{FetchError, QueryResponse};
pub use fetch::{FetchFuture, Fetcher, SharedFetcher};
pub use key::{QueryKey, QueryKeyBuilder, QueryRequest, derive_key};
pub use query::{CachePolicy, Query, QueryClient, QueryOptions, QueryResult};
