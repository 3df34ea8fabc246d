use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::BoxFuture;

use crate::cache::{Begin, FetchChannel, QueryCache, Timing};
use crate::error::{FetchError, QueryResponse};
use crate::key::{QueryKey, QueryRequest};
use crate::utils::futures::CallOnDrop;

/// The future returned by a [`Fetcher`].
pub type FetchFuture<T> = BoxFuture<'static, Result<QueryResponse<T>, FetchError>>;

/// Fetches the response of a [`QueryRequest`], typically over the network.
///
/// Failures can be reported either as an `Err`, or as a [`QueryResponse`] with `success: false`.
/// A fetcher may also panic. In every case the query layer turns the outcome into a
/// [`QueryResponse`].
///
/// Any `Fn(QueryRequest) -> impl Future<Output = Result<QueryResponse<T>, FetchError>>` closure is
/// a fetcher.
pub trait Fetcher<T>: Send + Sync {
    fn fetch(&self, request: QueryRequest) -> FetchFuture<T>;
}

impl<T, F, Fut> Fetcher<T> for F
where
    F: Fn(QueryRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<QueryResponse<T>, FetchError>> + Send + 'static,
{
    fn fetch(&self, request: QueryRequest) -> FetchFuture<T> {
        self(request).boxed()
    }
}

/// A [`Fetcher`] that can be shared between queries.
pub type SharedFetcher<T> = Arc<dyn Fetcher<T>>;

impl<T: Clone + Send + Sync + 'static> QueryCache<T> {
    /// Makes sure the entry for `key` is fresh, and resolves to its response.
    ///
    /// If another fetch of `key` is already in flight, this joins it. If the entry is fresh for a
    /// caller with the given `timing`, this resolves to the cached response right away. Otherwise
    /// a new fetch is started, and its outcome written back into the store.
    ///
    /// The idle key never fetches, and resolves to [`QueryResponse::no_request`].
    ///
    /// NOTE: This function itself is *not* `async`, because it eagerly spawns the fetch on the
    /// current tokio runtime, even if the returned future is never awaited. It must therefore be
    /// called within a tokio runtime.
    pub fn ensure_fresh(
        &self,
        key: &QueryKey,
        fetcher: &SharedFetcher<T>,
        timing: Timing,
    ) -> BoxFuture<'static, QueryResponse<T>> {
        self.fetch_with(key, fetcher, timing, false)
    }

    /// Fetches `key` again, regardless of how fresh its entry is, and resolves to the outcome.
    ///
    /// A fetch of `key` that is already in flight was started with an older view of the world,
    /// so this waits for it to settle first and then starts a new fetch. Should yet another fetch
    /// have started by then, this joins it instead. Either way there is never more than one
    /// fetch per key in flight.
    pub fn refetch(
        &self,
        key: &QueryKey,
        fetcher: &SharedFetcher<T>,
        timing: Timing,
    ) -> BoxFuture<'static, QueryResponse<T>> {
        let Some(pending) = self.in_flight(key) else {
            return self.fetch_with(key, fetcher, timing, true);
        };

        tracing::trace!(%key, "waiting for in-flight fetch before refetching");
        let cache = self.clone();
        let key = key.clone();
        let fetcher = fetcher.clone();
        async move {
            let _ = pending.await;
            cache.fetch_with(&key, &fetcher, timing, true).await
        }
        .boxed()
    }

    fn fetch_with(
        &self,
        key: &QueryKey,
        fetcher: &SharedFetcher<T>,
        timing: Timing,
        force: bool,
    ) -> BoxFuture<'static, QueryResponse<T>> {
        let Some(request) = key.request().cloned() else {
            return futures::future::ready(QueryResponse::no_request()).boxed();
        };

        match self.begin_fetch(key, timing, force) {
            Begin::Join(channel) => wait_for(channel),
            Begin::Cached(response) => futures::future::ready(response).boxed(),
            Begin::Start {
                id,
                sender,
                channel,
            } => {
                self.spawn_fetch(key.clone(), id, fetcher, request, sender);
                wait_for(channel)
            }
        }
    }

    /// Spawns fetch `id` of `key` as a separate task.
    fn spawn_fetch(
        &self,
        key: QueryKey,
        id: u64,
        fetcher: &SharedFetcher<T>,
        request: QueryRequest,
        sender: oneshot::Sender<QueryResponse<T>>,
    ) {
        tracing::debug!(%key, url = request.url(), "starting fetch");

        // Clears the in-flight marker if the task is torn down before it settled.
        let abandon_token = {
            let cache = self.clone();
            let key = key.clone();
            CallOnDrop::new(move || {
                tracing::warn!(%key, "fetch was dropped before settling");
                cache.abandon_fetch(&key, id, FetchError::Interrupted.to_string());
            })
        };

        // Creating the future may already panic.
        let fetch: FetchFuture<T> =
            match std::panic::catch_unwind(AssertUnwindSafe(|| fetcher.fetch(request))) {
                Ok(fetch) => fetch,
                Err(panic) => futures::future::ready(Err(FetchError::from_panic(panic))).boxed(),
            };

        let cache = self.clone();
        let task = async move {
            let start = tokio::time::Instant::now();
            let response = match AssertUnwindSafe(fetch).catch_unwind().await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    tracing::debug!(%key, error = %err, "fetch failed");
                    err.into()
                }
                Err(panic) => {
                    let err = FetchError::from_panic(panic);
                    tracing::error!(%key, error = %err, "fetcher panicked");
                    err.into()
                }
            };

            metric!(timer("query.fetch.duration") = start.elapsed());
            cache.settle_fetch(&key, id, &response);
            abandon_token.disarm();
            sender.send(response).ok();
        };

        tokio::spawn(task);
    }
}

fn wait_for<T: Clone + Send + Sync + 'static>(
    channel: FetchChannel<T>,
) -> BoxFuture<'static, QueryResponse<T>> {
    channel
        .map(|result| result.unwrap_or_else(|_| FetchError::Interrupted.into()))
        .boxed()
}
