use thiserror::Error;

use crate::query::{Fingerprint, QueryError};
use crate::store::StoreError;

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Invalid query: {0}")]
    InvalidQuery(#[from] QueryError),

    #[error("Page numbers start at 1")]
    InvalidPage,

    #[error("Page size must be between 1 and {max}")]
    InvalidPageSize { max: usize },

    #[error("Fetch failed: {0}")]
    Fetch(#[source] StoreError),

    #[error("Subscription failed: {0}")]
    Subscription(#[source] StoreError),

    #[error("Page manager for {0} has shut down")]
    ManagerClosed(Fingerprint),

    #[error("Metrics registration failed: {0}")]
    Metrics(String),
}

impl From<prometheus::Error> for CacheError {
    fn from(error: prometheus::Error) -> Self {
        CacheError::Metrics(error.to_string())
    }
}

impl CacheError {
    /// Whether the failure came from the remote store rather than the caller.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, CacheError::Fetch(_) | CacheError::Subscription(_))
    }
}
