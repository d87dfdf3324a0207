//! Cache-aside reads with bounded staleness.
//!
//! - [`Query`] / [`CacheKey`]: a read operation plus filters, and its
//!   deterministic key.
//! - [`CacheStore`] / [`MemoryStore`]: where payloads live until they expire.
//! - [`CacheAside`]: `get_or_compute`: serve fresh entries, otherwise compute
//!   and populate.
//! - [`ReadService`] / [`CachedReadService`]: the same thing as a decorator
//!   over a backing read service.
//!
//! Payloads are stored as JSON bytes. Entries are never invalidated
//! explicitly; expiry is the only way out, so readers may see data up to one
//! TTL old.

use thiserror::Error;

pub mod aside;
pub mod query;
pub mod service;
pub mod store;

pub use aside::{CacheAside, CacheStats, CacheStatsSnapshot};
pub use query::{CacheKey, Query};
pub use service::{CachedReadService, ReadService};
pub use store::{CacheEntry, CacheStore, MemoryStore};

/// Faults local to the cache. Always recovered by computing directly.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("cache payload could not be encoded or decoded: {0}")]
    Codec(#[from] serde_json::Error),
}
