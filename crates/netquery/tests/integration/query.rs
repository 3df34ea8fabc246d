use std::time::Duration;

use netquery::{QueryKey, QueryOptions, QueryRequest, QueryResponse};

use crate::{items, page, setup_client};

#[tokio::test(start_paused = true)]
async fn test_items_scenario() {
    let (client, server) = setup_client(|config| {
        config.stale_time = Some(Duration::from_millis(5000));
    });
    let query = client.query(Some(items(1)), QueryOptions::default());

    // t=0: nothing cached, so this fetches.
    let fetch = query.fetch();
    let result = query.result();
    assert!(result.is_loading);
    assert_eq!(result.data, None);

    let response = fetch.await;
    assert_eq!(response, QueryResponse::ok(page(1, 0)));
    let result = query.result();
    assert!(!result.is_loading);
    assert!(result.success);
    assert_eq!(result.data, Some(page(1, 0)));
    assert_eq!(server.hits(), 1);

    // t=2000: still fresh, served from the cache.
    tokio::time::sleep(Duration::from_millis(2000)).await;
    server.bump_version();
    let fetch = query.fetch();
    assert!(!query.result().is_loading);
    assert_eq!(fetch.await.data, Some(page(1, 0)));
    assert_eq!(server.hits(), 1);

    // t=6000: stale, refetched while the old data is still shown.
    tokio::time::sleep(Duration::from_millis(4000)).await;
    let fetch = query.fetch();
    let result = query.result();
    assert!(result.is_loading);
    assert_eq!(result.data, Some(page(1, 0)));

    assert_eq!(fetch.await.data, Some(page(1, 1)));
    let result = query.result();
    assert!(!result.is_loading);
    assert_eq!(result.data, Some(page(1, 1)));
    assert_eq!(server.hits(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_consumers_share_one_fetch() {
    let (client, server) = setup_client(|_| {});
    let first = client.query(Some(items(1)), QueryOptions::default());
    let second = client.query(Some(items(1)), QueryOptions::default());
    assert_eq!(first.key(), second.key());

    let (a, b) = futures::join!(first.fetch(), second.fetch());
    assert_eq!(a, b);
    assert_eq!(server.hits(), 1);
    assert_eq!(first.result(), second.result());

    let entry = client.cache().get(first.key()).unwrap();
    assert_eq!(entry.subscribers(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_set_request() {
    let (client, server) = setup_client(|_| {});
    let mut query = client.query(Some(items(1)), QueryOptions::default());
    query.fetch().await;
    let old_key = query.key().clone();

    // The same request, built differently.
    let same = QueryRequest::new("/items").with_params([("page", 1)]);
    assert!(!query.set_request(Some(same)));
    assert_eq!(query.result().data, Some(page(1, 0)));

    assert!(query.set_request(Some(items(2))));
    assert_ne!(query.key(), &old_key);
    let result = query.result();
    assert_eq!(result.data, None);
    assert_eq!(&result.query_key, query.key());

    // The old entry is no longer observed, but retained for its grace period.
    let old = client.cache().get(&old_key).unwrap();
    assert_eq!(old.subscribers(), 0);
    assert!(old.gc_at().is_some());

    query.fetch().await;
    assert_eq!(query.result().data, Some(page(2, 0)));
    assert_eq!(server.hits(), 2);

    assert!(query.set_request(None));
    assert!(query.key().is_idle());
    assert_eq!(query.result().data, None);
}

#[tokio::test(start_paused = true)]
async fn test_reload_data() {
    let (client, server) = setup_client(|_| {});
    let query = client.query(Some(items(1)), QueryOptions::no_expiration());
    query.fetch().await;

    server.bump_version();
    assert_eq!(query.fetch().await.data, Some(page(1, 0)));
    assert_eq!(server.hits(), 1);

    let reloaded = query.reload_data().await;
    assert_eq!(reloaded, QueryResponse::ok(page(1, 1)));
    assert_eq!(query.result().data, Some(page(1, 1)));
    assert_eq!(server.hits(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reload_during_fetch() {
    let (client, server) = setup_client(|_| {});
    let query = client.query(Some(items(1)), QueryOptions::default());

    let fetch = query.fetch();
    server.bump_version();
    let reload = query.reload_data();

    let (fetched, reloaded) = futures::join!(fetch, reload);
    // Only the reload is guaranteed to observe the new version.
    assert!(fetched.success);
    assert_eq!(reloaded.data, Some(page(1, 1)));
    assert_eq!(query.result().data, Some(page(1, 1)));
    assert_eq!(server.hits(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failure_keeps_data() {
    let (client, server) = setup_client(|_| {});
    let query = client.query(Some(items(1)), QueryOptions::default());
    query.fetch().await;

    server.set_failing(true);
    let response = query.reload_data().await;
    assert!(!response.success);
    assert_eq!(response.data, None);
    assert_eq!(
        response.error_msg.as_deref(),
        Some("transport error: connection reset")
    );

    let result = query.result();
    assert!(!result.success);
    assert!(!result.is_loading);
    assert_eq!(result.data, Some(page(1, 0)));
    assert_eq!(result.error_code, None);
    assert_eq!(
        result.error_msg.as_deref(),
        Some("transport error: connection reset")
    );

    // Once the backend recovers, the next access fetches again.
    server.set_failing(false);
    query.fetch().await;
    let result = query.result();
    assert!(result.success);
    assert_eq!(result.error_msg, None);
    assert_eq!(server.hits(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_error_responses() {
    let (client, _server) = setup_client(|_| {});

    let missing = client.query(Some(QueryRequest::new("/missing")), QueryOptions::default());
    let response = missing.fetch().await;
    assert_eq!(response.error_code, Some(404));
    assert_eq!(missing.result().error_code, Some(404));

    let malformed = client.query(Some(QueryRequest::new("/malformed")), QueryOptions::default());
    let response = malformed.fetch().await;
    assert!(!response.success);
    assert_eq!(response.error_code, None);
    assert!(
        response
            .error_msg
            .unwrap()
            .starts_with("malformed response: ")
    );
}

#[tokio::test(start_paused = true)]
async fn test_no_request() {
    let (client, server) = setup_client(|_| {});
    let query = client.query(None, QueryOptions::default());

    let result = query.result();
    assert_eq!(result.data, None);
    assert!(!result.success);
    assert!(!result.is_loading);
    assert_eq!(result.error_msg, None);
    assert_eq!(result.query_key, QueryKey::idle());

    assert_eq!(query.fetch().await, QueryResponse::no_request());
    assert_eq!(query.reload_data().await, QueryResponse::no_request());
    assert_eq!(server.hits(), 0);
    assert!(client.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_changed() {
    let (client, _server) = setup_client(|_| {});
    let mut query = client.query(Some(items(1)), QueryOptions::default());

    let fetch = query.fetch();
    let loading = query.changed().await;
    assert!(loading.is_loading);

    let mut result = query.changed().await;
    while result.is_loading {
        result = query.changed().await;
    }
    assert_eq!(result.data, Some(page(1, 0)));
    assert_eq!(fetch.await.data, result.data);
}

#[tokio::test(start_paused = true)]
async fn test_no_cache() {
    let (client, server) = setup_client(|config| {
        config.stale_time = Some(Duration::from_secs(60));
    });
    let query = client.query(Some(items(1)), QueryOptions::no_cache());

    query.fetch().await;
    query.fetch().await;
    assert_eq!(server.hits(), 2);

    let key = query.key().clone();
    drop(query);
    assert!(client.cache().get(&key).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_per_query_stale_time() {
    let (client, server) = setup_client(|_| {});
    let patient = client.query(
        Some(items(1)),
        QueryOptions::default().with_stale_time(Duration::from_secs(5)),
    );
    let eager = client.query(Some(items(1)), QueryOptions::default());

    patient.fetch().await;
    patient.fetch().await;
    assert_eq!(server.hits(), 1);

    // The client default is stale right away.
    eager.fetch().await;
    assert_eq!(server.hits(), 2);
    patient.fetch().await;
    assert_eq!(server.hits(), 2);

    tokio::time::sleep(Duration::from_secs(6)).await;
    patient.fetch().await;
    assert_eq!(server.hits(), 3);
}
