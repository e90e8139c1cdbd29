//! HTTP server exposing the page cache.
//!
//! - [`api`]: Request/response types and route handlers
//! - [`streaming`]: SSE streaming of page updates

pub mod api;
pub mod streaming;
