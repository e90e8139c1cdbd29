//! Update notifications emitted when a cached page gets a fresher snapshot.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::query::{Fingerprint, QueryDescriptor};
use crate::store::Item;

/// A fresher snapshot of one page of one query.
#[derive(Debug, Clone, Serialize)]
pub struct PageUpdate {
    /// The descriptor that first created the owning manager.
    pub query: QueryDescriptor,
    pub fingerprint: Fingerprint,
    pub page_size: usize,
    pub page: usize,
    pub items: Vec<Item>,
    /// Known total page count, `None` while unknown.
    pub length: Option<usize>,
}

pub type UpdateHandler = Arc<dyn Fn(PageUpdate) + Send + Sync>;

/// The single external update hook, shared by every manager of a cache.
#[derive(Clone, Default)]
pub struct Notifier {
    handler: Arc<RwLock<Option<UpdateHandler>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the hook, replacing any previous one.
    pub async fn set(&self, handler: UpdateHandler) {
        *self.handler.write().await = Some(handler);
    }

    pub async fn emit(&self, update: PageUpdate) {
        let handler = self.handler.read().await.clone();
        if let Some(handler) = handler {
            handler(update);
        }
    }
}
