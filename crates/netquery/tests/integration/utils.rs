use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use netquery::{
    FetchError, FetchFuture, Fetcher, QueryClient, QueryConfig, QueryRequest, QueryResponse,
};
use serde_json::Value;

pub type Items = Vec<String>;

#[derive(Debug, Default)]
struct State {
    hits: AtomicUsize,
    version: AtomicUsize,
    failing: AtomicBool,
}

/// An in-memory backend serving paged `/items`.
///
/// Every page holds three items, tagged with the current version of the backend. Requests to
/// `/malformed` answer with a broken payload, all other URLs with a 404.
#[derive(Debug, Clone)]
pub struct Server {
    latency: Duration,
    state: Arc<State>,
}

impl Server {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            state: Default::default(),
        }
    }

    /// The number of requests the server has received.
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    /// Changes the contents of all pages.
    pub fn bump_version(&self) {
        self.state.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Makes all following requests fail with a transport error, or stops doing so.
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }
}

/// The items `page` holds at `version`.
pub fn page(page: u64, version: usize) -> Items {
    (0..3).map(|i| format!("item-{page}-{i}-v{version}")).collect()
}

pub fn items(page: u64) -> QueryRequest {
    QueryRequest::new("/items").with_param("page", page)
}

impl Fetcher<Items> for Server {
    fn fetch(&self, request: QueryRequest) -> FetchFuture<Items> {
        let state = self.state.clone();
        let latency = self.latency;

        async move {
            state.hits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(latency).await;

            if state.failing.load(Ordering::SeqCst) {
                return Err(FetchError::Transport("connection reset".into()));
            }

            match request.url() {
                "/items" => {
                    let number = request
                        .param("page")
                        .and_then(Value::as_u64)
                        .unwrap_or(1);
                    let version = state.version.load(Ordering::SeqCst);
                    Ok(QueryResponse::ok(page(number, version)))
                }
                "/malformed" => {
                    let items: Items = serde_json::from_str("[\"item-1-0\",")?;
                    Ok(QueryResponse::ok(items))
                }
                _ => Err(FetchError::Status {
                    code: 404,
                    message: "not found".into(),
                }),
            }
        }
        .boxed()
    }
}

/// Setup tests and create a client on top of a [`Server`] that answers after 100ms.
pub fn setup_client(
    update_config: impl FnOnce(&mut QueryConfig),
) -> (QueryClient<Items>, Server) {
    netquery_test::setup();

    let mut config = QueryConfig::default();
    update_config(&mut config);

    let server = Server::new(Duration::from_millis(100));
    let client = QueryClient::new(server.clone(), config);
    (client, server)
}
