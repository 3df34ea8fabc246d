use std::time::Duration;

use netquery::{QueryKey, QueryOptions};

use crate::{items, page, setup_client};

#[tokio::test(start_paused = true)]
async fn test_fetch_without_query() {
    let (client, server) = setup_client(|config| {
        config.stale_time = Some(Duration::from_secs(60));
    });

    let response = client.fetch(&items(1), QueryOptions::default()).await;
    assert_eq!(response.data, Some(page(1, 0)));
    client.fetch(&items(1), QueryOptions::default()).await;
    assert_eq!(server.hits(), 1);

    // A query picks up the cached result.
    let query = client.query(Some(items(1)), QueryOptions::default());
    assert_eq!(query.result().data, Some(page(1, 0)));
    drop(query);

    // Unobserved results are evicted after the default grace period of 5 minutes.
    tokio::time::sleep(Duration::from_secs(4 * 60)).await;
    assert_eq!(client.cache().len(), 1);
    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    assert!(client.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalidate() {
    let (client, server) = setup_client(|config| {
        config.stale_time = Some(Duration::from_secs(60));
    });
    let first = client.query(Some(items(1)), QueryOptions::default());
    let second = client.query(Some(items(2)), QueryOptions::default());
    first.fetch().await;
    second.fetch().await;
    assert_eq!(server.hits(), 2);

    server.bump_version();
    assert!(client.invalidate(&items(1)));
    assert!(!client.invalidate(&items(3)));

    // Invalidated data is still shown until it is refetched.
    assert_eq!(first.result().data, Some(page(1, 0)));
    first.fetch().await;
    second.fetch().await;
    assert_eq!(first.result().data, Some(page(1, 1)));
    assert_eq!(second.result().data, Some(page(2, 0)));
    assert_eq!(server.hits(), 3);

    assert_eq!(client.invalidate_url("/items"), 2);
    assert_eq!(client.invalidate_url("/users"), 0);
    second.fetch().await;
    assert_eq!(second.result().data, Some(page(2, 1)));
    assert_eq!(server.hits(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_policies_share_entries() {
    let (client, server) = setup_client(|config| {
        config.stale_time = Some(Duration::from_secs(60));
    });
    let cached = client.query(Some(items(1)), QueryOptions::no_expiration());
    let uncached = client.query(Some(items(1)), QueryOptions::no_cache());
    assert_eq!(cached.key(), uncached.key());

    cached.fetch().await;
    cached.fetch().await;
    assert_eq!(server.hits(), 1);

    // The no-cache query refetches, and everyone sees the result.
    server.bump_version();
    uncached.fetch().await;
    assert_eq!(cached.result().data, Some(page(1, 1)));
    assert_eq!(server.hits(), 2);

    // The entry outlives the no-cache query, as the other query asked to keep it forever.
    let key: QueryKey = cached.key().clone();
    drop(uncached);
    drop(cached);
    tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
    assert!(client.cache().get(&key).is_some());
}
