//! The top-level cache: routes queries to their page managers.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cache::error::CacheError;
use crate::cache::manager::{Loaded, ManagerHandle, PageManager};
use crate::cache::update::{Notifier, PageUpdate};
use crate::config::CacheConfig;
use crate::metrics::CacheMetrics;
use crate::query::{CanonicalQuery, Fingerprint, QueryDescriptor};
use crate::store::{Item, RangeQuery, RemoteCollection};

/// One page of results plus the best-known page count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageResult {
    pub items: Vec<Item>,
    /// `None` while the total is unknown (unbounded).
    pub length: Option<usize>,
}

/// Managers are per query and per page size: the same query paged at two
/// sizes has two independent cursor chains.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ManagerKey {
    fingerprint: Fingerprint,
    page_size: usize,
}

pub struct Cache {
    store: Arc<dyn RemoteCollection>,
    config: CacheConfig,
    managers: Mutex<HashMap<ManagerKey, ManagerHandle>>,
    notifier: Notifier,
    metrics: Arc<CacheMetrics>,
}

impl Cache {
    pub fn new(store: Arc<dyn RemoteCollection>, config: CacheConfig) -> Result<Self, CacheError> {
        let metrics = Arc::new(CacheMetrics::new()?);
        info!(
            page_size = config.page_size,
            max_page_size = config.max_page_size,
            queue_capacity = config.queue_capacity,
            "Page cache created"
        );
        Ok(Self {
            store,
            config,
            managers: Mutex::new(HashMap::new()),
            notifier: Notifier::new(),
            metrics,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub async fn manager_count(&self) -> usize {
        self.managers.lock().await.len()
    }

    /// Fetch page `page` (1-based) of `query` at `page_size` items per page.
    ///
    /// Loads every earlier page first if needed. Returns an empty page when
    /// `page` lies beyond the end of the result set.
    pub async fn get(
        &self,
        query: &QueryDescriptor,
        page: usize,
        page_size: usize,
    ) -> Result<PageResult, CacheError> {
        let canonical = CanonicalQuery::new(query)?;
        if page == 0 {
            return Err(CacheError::InvalidPage);
        }
        if page_size == 0 || page_size > self.config.max_page_size {
            return Err(CacheError::InvalidPageSize {
                max: self.config.max_page_size,
            });
        }

        let manager = self.manager(query, canonical, page_size).await;
        match manager.load(page).await? {
            Loaded::Page(snapshot) => Ok(PageResult {
                items: snapshot.items.to_vec(),
                length: snapshot.length,
            }),
            Loaded::PastEnd { length } => Ok(PageResult {
                items: Vec::new(),
                length: Some(length),
            }),
        }
    }

    /// Every item matching `query`, in sort order.
    ///
    /// Served from a manager whose length is known; otherwise one unbounded
    /// fetch that bypasses the page cache.
    pub async fn get_all_items(&self, query: &QueryDescriptor) -> Result<Vec<Item>, CacheError> {
        let canonical = Arc::new(CanonicalQuery::new(query)?);

        let candidates: Vec<ManagerHandle> = {
            let managers = self.managers.lock().await;
            managers
                .iter()
                .filter(|(key, _)| key.fingerprint == *canonical.fingerprint())
                .map(|(_, handle)| handle.clone())
                .collect()
        };

        for manager in candidates {
            if let Some(items) = manager.all_items().await? {
                debug!(
                    fingerprint = %canonical.fingerprint(),
                    items = items.len(),
                    "All items served from cache"
                );
                return Ok(items);
            }
        }

        self.metrics.range_fetches.inc();
        let items = self
            .store
            .range_query(&RangeQuery::unbounded(Arc::clone(&canonical)))
            .await
            .map_err(CacheError::Fetch)?;
        debug!(
            fingerprint = %canonical.fingerprint(),
            items = items.len(),
            "All items fetched from store"
        );
        Ok(items)
    }

    /// Install the single update hook, replacing any previous one.
    pub async fn on_update<F>(&self, handler: F)
    where
        F: Fn(PageUpdate) + Send + Sync + 'static,
    {
        self.notifier.set(Arc::new(handler)).await;
    }

    async fn manager(
        &self,
        query: &QueryDescriptor,
        canonical: CanonicalQuery,
        page_size: usize,
    ) -> ManagerHandle {
        let key = ManagerKey {
            fingerprint: canonical.fingerprint().clone(),
            page_size,
        };

        let mut managers = self.managers.lock().await;
        if let Some(handle) = managers.get(&key) {
            return handle.clone();
        }

        info!(fingerprint = %key.fingerprint, page_size, "Creating page manager");
        let handle = PageManager::new(
            Arc::new(query.clone()),
            Arc::new(canonical),
            page_size,
            Arc::clone(&self.store),
            self.notifier.clone(),
            Arc::clone(&self.metrics),
            self.config.queue_capacity,
        )
        .spawn(self.config.queue_capacity);
        managers.insert(key, handle.clone());
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SortSpec;
    use crate::store::memory::MemoryCollection;

    fn cache(store: &MemoryCollection) -> Cache {
        Cache::new(Arc::new(store.clone()), CacheConfig::default()).unwrap()
    }

    fn seeded(n: i64) -> MemoryCollection {
        MemoryCollection::with_items((1..=n).map(|i| Item::new(format!("{i:04}")).with("id", i)))
    }

    #[tokio::test]
    async fn test_invalid_arguments_do_no_io() {
        let store = seeded(5);
        let cache = cache(&store);
        let q = QueryDescriptor::new(SortSpec::asc("id"));

        assert!(matches!(cache.get(&q, 0, 10).await, Err(CacheError::InvalidPage)));
        assert!(matches!(
            cache.get(&q, 1, 0).await,
            Err(CacheError::InvalidPageSize { .. })
        ));
        let max = cache.config().max_page_size;
        assert!(matches!(
            cache.get(&q, 1, max + 1).await,
            Err(CacheError::InvalidPageSize { max: m }) if m == max
        ));
        let bad = QueryDescriptor::new(SortSpec::asc(""));
        assert!(matches!(cache.get(&bad, 1, 10).await, Err(CacheError::InvalidQuery(_))));

        assert_eq!(store.stats().range_queries, 0);
        assert_eq!(cache.manager_count().await, 0);
    }

    #[tokio::test]
    async fn test_managers_keyed_by_fingerprint_and_page_size() {
        let store = seeded(30);
        let cache = cache(&store);
        let a = QueryDescriptor::new(SortSpec::asc("id")).with("x", None::<&str>);
        let b = QueryDescriptor::new(SortSpec::asc("id"));

        cache.get(&a, 1, 10).await.unwrap();
        cache.get(&b, 1, 10).await.unwrap();
        assert_eq!(cache.manager_count().await, 1);

        cache.get(&b, 1, 5).await.unwrap();
        assert_eq!(cache.manager_count().await, 2);
    }

    #[tokio::test]
    async fn test_beyond_end_reports_length() {
        let store = seeded(15);
        let cache = cache(&store);
        let q = QueryDescriptor::new(SortSpec::asc("id"));

        let result = cache.get(&q, 5, 10).await.unwrap();
        assert!(result.items.is_empty());
        assert_eq!(result.length, Some(2));
    }

    #[tokio::test]
    async fn test_all_items_falls_back_to_unbounded_fetch() {
        let store = seeded(12);
        let cache = cache(&store);
        let q = QueryDescriptor::new(SortSpec::desc("id"));

        let items = cache.get_all_items(&q).await.unwrap();
        assert_eq!(items.len(), 12);
        assert_eq!(items[0].id, "0012");
        assert_eq!(store.stats().range_queries, 1);
        assert_eq!(cache.manager_count().await, 0);
    }

    #[tokio::test]
    async fn test_largest_allowed_page_size_is_served() {
        let store = seeded(30);
        let config = CacheConfig {
            max_page_size: 25,
            ..CacheConfig::default()
        };
        let cache = Cache::new(Arc::new(store.clone()), config).unwrap();
        let q = QueryDescriptor::new(SortSpec::asc("id"));

        assert_eq!(cache.get(&q, 1, 25).await.unwrap().items.len(), 25);
        assert!(cache.get(&q, 1, 26).await.is_err());
        assert_eq!(cache.manager_count().await, 1);
    }

    #[tokio::test]
    async fn test_beyond_end_length_survives_lost_subscriptions() {
        let store = seeded(15);
        let cache = cache(&store);
        let q = QueryDescriptor::new(SortSpec::asc("id"));
        assert_eq!(cache.get(&q, 5, 10).await.unwrap().length, Some(2));

        store.break_subscriptions(crate::store::StoreError::Unavailable("gone".into()));
        for _ in 0..100 {
            if cache.metrics().subscription_failures.get() >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let result = cache.get(&q, 5, 10).await.unwrap();
        assert!(result.items.is_empty());
        assert_eq!(result.length, Some(2));
    }
}
