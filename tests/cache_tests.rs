//! Integration tests for page access through the Cache.

mod common;

use realtime_page_cache::cache::CacheError;
use realtime_page_cache::query::{QueryDescriptor, SortSpec};
use realtime_page_cache::store::StoreError;

use common::{cache, eventually, ids, seeded, settle};

fn by_id() -> QueryDescriptor {
    QueryDescriptor::new(SortSpec::asc("id"))
}

#[tokio::test]
async fn test_sequential_pages_with_lazy_length() {
    let store = seeded(25);
    let cache = cache(&store);
    let q = by_id();

    let first = cache.get(&q, 1, 10).await.unwrap();
    assert_eq!(ids(&first.items), (1..=10).collect::<Vec<_>>());
    assert_eq!(first.length, None);

    let third = cache.get(&q, 3, 10).await.unwrap();
    assert_eq!(ids(&third.items), (21..=25).collect::<Vec<_>>());
    assert_eq!(third.length, Some(3));

    let before = store.stats();
    let second = cache.get(&q, 2, 10).await.unwrap();
    assert_eq!(ids(&second.items), (11..=20).collect::<Vec<_>>());
    assert_eq!(second.length, Some(3));

    // Served from cache: no fetch, no probe.
    let after = store.stats();
    assert_eq!(after.range_queries, before.range_queries);
    assert_eq!(after.probes, before.probes);
    assert_eq!(cache.metrics().cache_hits.get(), 1);
}

#[tokio::test]
async fn test_page_request_order_does_not_matter() {
    let store = seeded(37);
    let q = QueryDescriptor::new(SortSpec::desc("id"));

    let forward = cache(&store);
    let mut a = Vec::new();
    for page in 1..=4 {
        a.push(forward.get(&q, page, 10).await.unwrap());
    }

    let scattered = cache(&store);
    let mut b = vec![None, None, None, None];
    for page in [4, 2, 1, 3] {
        b[page - 1] = Some(scattered.get(&q, page, 10).await.unwrap());
    }

    for (page, (a, b)) in a.iter().zip(b).enumerate() {
        let b = b.unwrap();
        assert_eq!(a.items, b.items, "page {}", page + 1);
    }
    assert_eq!(ids(&a[3].items), (1..=7).rev().collect::<Vec<_>>());
    assert_eq!(a[3].length, Some(4));
}

#[tokio::test]
async fn test_filtered_query_pages() {
    let store = seeded(30);
    let cache = cache(&store);
    let q = by_id().with("parity", "even");

    let second = cache.get(&q, 2, 10).await.unwrap();
    assert_eq!(ids(&second.items), vec![22, 24, 26, 28, 30]);
    assert_eq!(second.length, Some(2));
}

#[tokio::test]
async fn test_equivalent_descriptors_share_a_manager() {
    let store = seeded(30);
    let cache = cache(&store);

    let a = by_id().with("parity", "odd").with("team", "");
    let b = QueryDescriptor::new(SortSpec::asc("id"))
        .with("team", None::<&str>)
        .with("parity", "odd");

    cache.get(&a, 1, 10).await.unwrap();
    let before = store.stats().range_queries;
    cache.get(&b, 1, 10).await.unwrap();
    assert_eq!(store.stats().range_queries, before);
    assert_eq!(cache.manager_count().await, 1);
}

#[tokio::test]
async fn test_string_and_number_predicates_do_not_collide() {
    let store = seeded(10);
    let cache = cache(&store);

    let numeric = cache.get(&by_id().with("id", 5), 1, 10).await.unwrap();
    assert_eq!(ids(&numeric.items), vec![5]);

    let textual = cache.get(&by_id().with("id", "5"), 1, 10).await.unwrap();
    assert!(textual.items.is_empty());
    assert_eq!(textual.length, Some(0));
    assert_eq!(cache.manager_count().await, 2);
}

#[tokio::test]
async fn test_all_items_from_cache_once_length_known() {
    let store = seeded(25);
    let cache = cache(&store);
    let q = by_id();

    cache.get(&q, 3, 10).await.unwrap();
    let before = store.stats();
    let all = cache.get_all_items(&q).await.unwrap();
    assert_eq!(ids(&all), (1..=25).collect::<Vec<_>>());
    assert_eq!(store.stats().range_queries, before.range_queries);
}

#[tokio::test]
async fn test_all_items_unknown_length_fetches_directly() {
    let store = seeded(25);
    let cache = cache(&store);
    let q = by_id();

    cache.get(&q, 1, 10).await.unwrap();
    let before = store.stats().range_queries;
    let all = cache.get_all_items(&q).await.unwrap();
    assert_eq!(all.len(), 25);
    assert_eq!(store.stats().range_queries, before + 1);
}

#[tokio::test]
async fn test_fetch_failure_keeps_built_prefix() {
    let store = seeded(25);
    let cache = cache(&store);
    let q = by_id();

    store.fail_range_query_in(2);
    let err = cache.get(&q, 3, 10).await.unwrap_err();
    assert!(matches!(err, CacheError::Fetch(StoreError::Unavailable(_))));
    assert!(err.is_store_failure());

    // Page 1 survived; asking for it again needs no range fetch.
    let before = store.stats().range_queries;
    let first = cache.get(&q, 1, 10).await.unwrap();
    assert_eq!(ids(&first.items), (1..=10).collect::<Vec<_>>());
    assert_eq!(store.stats().range_queries, before);

    // No automatic retry happened; an explicit retry succeeds.
    let third = cache.get(&q, 3, 10).await.unwrap();
    assert_eq!(ids(&third.items), (21..=25).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_probe_failure_surfaces() {
    let store = seeded(25);
    let cache = cache(&store);
    store.fail_probes(1);

    let err = cache.get(&by_id(), 1, 10).await.unwrap_err();
    assert!(matches!(err, CacheError::Fetch(_)));

    let first = cache.get(&by_id(), 1, 10).await.unwrap();
    assert_eq!(first.items.len(), 10);
}

#[tokio::test]
async fn test_invalid_query_rejected_before_io() {
    let store = seeded(5);
    let cache = cache(&store);

    let nan = by_id().with("id", f64::NAN);
    assert!(matches!(
        cache.get(&nan, 1, 10).await,
        Err(CacheError::InvalidQuery(_))
    ));
    assert!(matches!(
        cache.get_all_items(&QueryDescriptor::new(SortSpec::desc(""))).await,
        Err(CacheError::InvalidQuery(_))
    ));

    let stats = store.stats();
    assert_eq!(stats.range_queries, 0);
    assert_eq!(stats.subscribes, 0);
}

#[tokio::test]
async fn test_broken_subscription_reloads_on_next_access() {
    let store = seeded(25);
    let cache = cache(&store);
    let q = by_id();
    cache.get(&q, 1, 10).await.unwrap();

    store.break_subscriptions(StoreError::Unavailable("connection reset".into()));
    eventually("subscription failure", || {
        cache.metrics().subscription_failures.get() == 1
    })
    .await;

    let before = store.stats();
    let first = cache.get(&q, 1, 10).await.unwrap();
    assert_eq!(ids(&first.items), (1..=10).collect::<Vec<_>>());
    let after = store.stats();
    assert_eq!(after.range_queries, before.range_queries + 1);
    assert_eq!(after.subscribes, before.subscribes + 1);
    assert_eq!(after.active_subscriptions, 1);
}

#[tokio::test]
async fn test_dropping_cache_unsubscribes_pages() {
    let store = seeded(25);
    let cache = cache(&store);
    cache.get(&by_id(), 3, 10).await.unwrap();
    assert_eq!(store.stats().active_subscriptions, 3);

    drop(cache);
    eventually("pages to unsubscribe", || store.stats().active_subscriptions == 0).await;
    settle().await;
}
