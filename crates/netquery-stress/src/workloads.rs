use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use netquery::{
    CachePolicy, FetchError, FetchFuture, Fetcher, QueryCache, QueryClient, QueryConfig,
    QueryOptions, QueryRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workload {
    /// The number of concurrent consumers.
    pub concurrency: usize,
    /// The number of distinct requests the consumers cycle through.
    pub keys: usize,
    /// How long the simulated backend takes to answer.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Fail every n-th fetch.
    #[serde(default)]
    pub fail_every: Option<usize>,
    /// Overrides the configured stale time.
    #[serde(default, with = "humantime_serde")]
    pub stale_time: Option<Duration>,
    #[serde(default)]
    pub policy: CachePolicy,
}

/// A backend that answers every request after a fixed latency.
#[derive(Debug)]
pub struct SimulatedBackend {
    latency: Duration,
    fail_every: Option<usize>,
    calls: AtomicUsize,
}

impl SimulatedBackend {
    pub fn new(latency: Duration, fail_every: Option<usize>) -> Self {
        Self {
            latency,
            fail_every: fail_every.filter(|n| *n > 0),
            calls: AtomicUsize::new(0),
        }
    }

    /// The number of fetches the backend has seen.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Fetcher<Value> for SimulatedBackend {
    fn fetch(&self, request: QueryRequest) -> FetchFuture<Value> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let fail = self.fail_every.is_some_and(|every| n % every == 0);
        let latency = self.latency;

        async move {
            tokio::time::sleep(latency).await;
            if fail {
                return Err(FetchError::Status {
                    code: 500,
                    message: format!("simulated failure of fetch {n}"),
                });
            }
            Ok(netquery::QueryResponse::ok(json!({
                "url": request.url(),
                "params": request.params(),
                "fetch": n,
            })))
        }
        .boxed()
    }
}

/// A workload, ready to run.
pub struct PreparedWorkload {
    pub concurrency: usize,
    pub client: QueryClient<Value>,
    pub backend: Arc<SimulatedBackend>,
    requests: Vec<QueryRequest>,
    options: QueryOptions,
    next: AtomicUsize,
}

pub fn prepare_workload(
    index: usize,
    workload: Workload,
    defaults: QueryConfig,
) -> PreparedWorkload {
    let backend = Arc::new(SimulatedBackend::new(workload.latency, workload.fail_every));

    let client = QueryClient::with_cache(QueryCache::new(), backend.clone(), defaults);

    let requests = (0..workload.keys.max(1))
        .map(|key| QueryRequest::new(format!("/workload/{index}")).with_param("key", key))
        .collect();

    PreparedWorkload {
        concurrency: workload.concurrency.max(1),
        client,
        backend,
        requests,
        options: QueryOptions {
            policy: workload.policy,
            stale_time: workload.stale_time,
            gc_time: None,
        },
        next: AtomicUsize::new(0),
    }
}

/// Runs a single operation of the workload, and returns whether it succeeded.
pub async fn process_operation(workload: &PreparedWorkload) -> bool {
    let n = workload.next.fetch_add(1, Ordering::Relaxed);
    let request = &workload.requests[n % workload.requests.len()];
    let response = workload.client.fetch(request, workload.options).await;
    if !response.success {
        tracing::trace!(url = request.url(), error = ?response.error_msg, "operation failed");
    }
    response.success
}
