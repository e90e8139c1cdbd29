//! realtime-page-cache: a cursor-based paginated query cache with realtime
//! cascade invalidation over a sorted, filterable live collection.
//!
//! - [`query`]: query descriptors and fingerprinting
//! - [`store`]: the remote collection interface and an in-memory implementation
//! - [`cache`]: pages, page managers and the top-level Cache
//! - [`server`]: HTTP API over the cache
//! - [`config`]: CLI and configuration
//! - [`metrics`]: prometheus counters

pub mod cache;
pub mod config;
pub mod metrics;
pub mod query;
pub mod server;
pub mod store;
