//! Cursor-chained page cache with live cascade invalidation.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`page`]: Page, PageContent, PageState and live delivery events
//! - [`manager`]: Per-query page chain actor (backfill, cascade, length probes)
//! - [`router`]: The Cache, mapping fingerprints to managers
//! - [`update`]: Update notifications and the external hook
//! - [`error`]: CacheError

pub mod error;
pub mod manager;
pub mod page;
pub mod router;
pub mod update;

pub use error::CacheError;
pub use router::{Cache, PageResult};
pub use update::PageUpdate;
