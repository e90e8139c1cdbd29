//! The remote collection the cache sits in front of.
//!
//! - [`item`]: Item and Cursor types
//! - [`memory`]: in-process live collection used for tests and the demo server
//!
//! The store only needs to support "strictly after this position" range
//! queries with a limit, and live subscriptions over the same range shape.

pub mod item;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::query::CanonicalQuery;

pub use item::{Cursor, Item};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Query rejected by backend: {0}")]
    Rejected(String),

    #[error("Live subscription closed")]
    SubscriptionClosed,
}

/// A bounded (or unbounded) range over a query's ordered result set.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    pub query: Arc<CanonicalQuery>,

    /// Return only items strictly after this position.
    pub after: Option<Cursor>,

    /// Maximum number of items; `None` means the whole remaining result set.
    pub limit: Option<usize>,
}

impl RangeQuery {
    pub fn page(query: Arc<CanonicalQuery>, after: Option<Cursor>, limit: usize) -> Self {
        Self {
            query,
            after,
            limit: Some(limit),
        }
    }

    pub fn unbounded(query: Arc<CanonicalQuery>) -> Self {
        Self {
            query,
            after: None,
            limit: None,
        }
    }
}

/// Snapshots delivered by a live subscription, newest last.
pub type SnapshotStream = mpsc::UnboundedReceiver<Result<Vec<Item>, StoreError>>;

/// Unsubscribes when dropped.
pub struct SubscriptionGuard {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionGuard {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A guard with nothing to tear down.
    pub fn detached() -> Self {
        Self { unsubscribe: None }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// A live view of one range: a snapshot stream plus its teardown guard.
#[derive(Debug)]
pub struct Subscription {
    pub updates: SnapshotStream,
    pub guard: SubscriptionGuard,
}

/// The remote, sorted, filterable document collection.
#[async_trait]
pub trait RemoteCollection: Send + Sync {
    /// Items matching the range, in sort order.
    async fn range_query(&self, range: &RangeQuery) -> Result<Vec<Item>, StoreError>;

    /// The first item strictly after `after`, if any.
    async fn probe_one(
        &self,
        query: &Arc<CanonicalQuery>,
        after: Option<&Cursor>,
    ) -> Result<Option<Item>, StoreError> {
        let range = RangeQuery::page(Arc::clone(query), after.cloned(), 1);
        Ok(self.range_query(&range).await?.into_iter().next())
    }

    /// Live snapshots of the range until the returned guard is dropped.
    ///
    /// The first snapshot on the stream must be the range as of subscribe
    /// time. Consumers that fetch separately skip it: it can be older than
    /// their fetch.
    async fn subscribe(&self, range: &RangeQuery) -> Result<Subscription, StoreError>;
}
