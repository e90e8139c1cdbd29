//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use realtime_page_cache::cache::{Cache, PageUpdate};
use realtime_page_cache::config::CacheConfig;
use realtime_page_cache::store::memory::MemoryCollection;
use realtime_page_cache::store::Item;

/// Items `_id` "0001".."{n}" with a numeric `id` field and a `parity` tag.
pub fn numbered(range: std::ops::RangeInclusive<i64>) -> Vec<Item> {
    range
        .map(|i| {
            Item::new(format!("{i:04}"))
                .with("id", i)
                .with("parity", if i % 2 == 0 { "even" } else { "odd" })
        })
        .collect()
}

pub fn seeded(n: i64) -> MemoryCollection {
    MemoryCollection::with_items(numbered(1..=n))
}

pub fn cache(store: &MemoryCollection) -> Cache {
    Cache::new(Arc::new(store.clone()), CacheConfig::default()).unwrap()
}

pub fn ids(items: &[Item]) -> Vec<i64> {
    items
        .iter()
        .map(|item| item.field("id").and_then(|v| v.as_i64()).unwrap())
        .collect()
}

/// One observed update plus the store's probe count when it fired.
#[derive(Debug, Clone)]
pub struct Observed {
    pub page: usize,
    pub ids: Vec<i64>,
    pub length: Option<usize>,
    pub probes_at_emit: u64,
}

/// Record every update the cache emits.
pub async fn record_updates(cache: &Cache, store: &MemoryCollection) -> Arc<Mutex<Vec<Observed>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let store = store.clone();
    cache
        .on_update(move |update: PageUpdate| {
            sink.lock().unwrap().push(Observed {
                page: update.page,
                ids: ids(&update.items),
                length: update.length,
                probes_at_emit: store.stats().probes,
            });
        })
        .await;
    seen
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Give the manager tasks a moment to drain pending deliveries.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
