//! In-process live collection.
//!
//! Holds items in memory, answers range queries by filtering and sorting,
//! and pushes a fresh snapshot to every subscriber whose range result changes
//! after a mutation. Call counters and fault injection make it usable as the
//! fake backend in tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::query::CanonicalQuery;
use crate::store::{
    Cursor, Item, RangeQuery, RemoteCollection, StoreError, Subscription, SubscriptionGuard,
};

/// Call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub range_queries: u64,
    pub probes: u64,
    pub subscribes: u64,
    pub active_subscriptions: usize,
}

/// One-shot failures armed by tests.
#[derive(Debug, Default)]
struct Faults {
    /// Fail the n-th upcoming range query (1 = the next one).
    range_query_in: Option<u64>,
    fail_probes: usize,
    fail_subscribes: usize,
}

struct Subscriber {
    range: RangeQuery,
    last: Vec<Item>,
    updates: mpsc::UnboundedSender<Result<Vec<Item>, StoreError>>,
}

#[derive(Default)]
struct Inner {
    items: HashMap<String, Item>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,
    stats: StoreStats,
    faults: Faults,
}

impl Inner {
    fn evaluate(&self, range: &RangeQuery) -> Vec<Item> {
        let query = &range.query;
        let mut matching: Vec<(Cursor, &Item)> = self
            .items
            .values()
            .filter(|item| query.matches(item))
            .map(|item| (query.cursor_of(item), item))
            .collect();
        matching.sort_by(|(a, _), (b, _)| query.compare(a, b));

        let after = range.after.as_ref();
        matching
            .into_iter()
            .filter(|(cursor, _)| after.map_or(true, |after| query.compare(cursor, after).is_gt()))
            .take(range.limit.unwrap_or(usize::MAX))
            .map(|(_, item)| item.clone())
            .collect()
    }

    /// Push a snapshot to every subscriber whose result changed.
    fn publish(&mut self) {
        let mut closed = Vec::new();
        let fresh: Vec<(u64, Vec<Item>)> = self
            .subscribers
            .iter()
            .map(|(id, subscriber)| (*id, self.evaluate(&subscriber.range)))
            .collect();

        for (id, snapshot) in fresh {
            if let Some(subscriber) = self.subscribers.get_mut(&id) {
                if subscriber.last == snapshot {
                    continue;
                }
                subscriber.last = snapshot.clone();
                if subscriber.updates.send(Ok(snapshot)).is_err() {
                    closed.push(id);
                }
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
        }
        self.stats.active_subscriptions = self.subscribers.len();
    }

    fn take_range_fault(&mut self) -> bool {
        match self.faults.range_query_in {
            Some(1) => {
                self.faults.range_query_in = None;
                true
            }
            Some(n) => {
                self.faults.range_query_in = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

/// Shared-handle in-memory collection; clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryCollection {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = Item>) -> Self {
        let collection = Self::new();
        collection.extend(items);
        collection
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace an item, returning the previous version.
    pub fn insert(&self, item: Item) -> Option<Item> {
        let mut inner = self.lock();
        debug!(id = %item.id, "Collection insert");
        let previous = inner.items.insert(item.id.clone(), item);
        inner.publish();
        previous
    }

    pub fn extend(&self, items: impl IntoIterator<Item = Item>) {
        let mut inner = self.lock();
        for item in items {
            inner.items.insert(item.id.clone(), item);
        }
        inner.publish();
    }

    pub fn remove(&self, id: &str) -> Option<Item> {
        let mut inner = self.lock();
        let removed = inner.items.remove(id);
        if removed.is_some() {
            debug!(id, "Collection remove");
            inner.publish();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        self.lock().stats
    }

    /// Make the n-th upcoming range query fail once (1 = the next one).
    pub fn fail_range_query_in(&self, n: u64) {
        self.lock().faults.range_query_in = (n > 0).then_some(n);
    }

    /// Make the next `count` probes fail.
    pub fn fail_probes(&self, count: usize) {
        self.lock().faults.fail_probes = count;
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_subscribes(&self, count: usize) {
        self.lock().faults.fail_subscribes = count;
    }

    /// Deliver an error to every live subscriber and drop them.
    pub fn break_subscriptions(&self, error: StoreError) {
        let mut inner = self.lock();
        for (_, subscriber) in inner.subscribers.drain() {
            let _ = subscriber.updates.send(Err(error.clone()));
        }
        inner.stats.active_subscriptions = 0;
    }

    fn unsubscriber(inner: Weak<Mutex<Inner>>, id: u64) -> impl FnOnce() + Send + Sync + 'static {
        move || {
            if let Some(inner) = inner.upgrade() {
                let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                inner.subscribers.remove(&id);
                inner.stats.active_subscriptions = inner.subscribers.len();
            }
        }
    }
}

#[async_trait]
impl RemoteCollection for MemoryCollection {
    async fn range_query(&self, range: &RangeQuery) -> Result<Vec<Item>, StoreError> {
        let mut inner = self.lock();
        inner.stats.range_queries += 1;
        if inner.take_range_fault() {
            return Err(StoreError::Unavailable("injected range query failure".into()));
        }
        Ok(inner.evaluate(range))
    }

    async fn probe_one(
        &self,
        query: &Arc<CanonicalQuery>,
        after: Option<&Cursor>,
    ) -> Result<Option<Item>, StoreError> {
        let mut inner = self.lock();
        inner.stats.probes += 1;
        if inner.faults.fail_probes > 0 {
            inner.faults.fail_probes -= 1;
            return Err(StoreError::Unavailable("injected probe failure".into()));
        }
        let range = RangeQuery::page(Arc::clone(query), after.cloned(), 1);
        Ok(inner.evaluate(&range).into_iter().next())
    }

    async fn subscribe(&self, range: &RangeQuery) -> Result<Subscription, StoreError> {
        let mut inner = self.lock();
        inner.stats.subscribes += 1;
        if inner.faults.fail_subscribes > 0 {
            inner.faults.fail_subscribes -= 1;
            return Err(StoreError::Unavailable("injected subscribe failure".into()));
        }

        let id = inner.next_subscriber;
        inner.next_subscriber += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot = inner.evaluate(range);
        let _ = tx.send(Ok(snapshot.clone()));
        inner.subscribers.insert(
            id,
            Subscriber {
                range: range.clone(),
                last: snapshot,
                updates: tx,
            },
        );
        inner.stats.active_subscriptions = inner.subscribers.len();

        Ok(Subscription {
            updates: rx,
            guard: SubscriptionGuard::new(Self::unsubscriber(Arc::downgrade(&self.inner), id)),
        })
    }
}
