//! The cache-aside read path.

use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{trace, warn};

use super::{CacheError, CacheKey, CacheStore};

/// Hit/miss counters for a [`CacheAside`].
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    store_errors: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub store_errors: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

/// Serves reads from a [`CacheStore`] and computes them on a miss.
///
/// The cache is an optimization only:
///
/// - a fresh entry is returned without calling `compute`;
/// - a miss, an expired entry, an unreadable entry or a store that cannot
///   answer all lead to `compute`;
/// - only successful results are stored, with expiry `now + ttl`;
/// - `compute` errors are returned unchanged and leave the store untouched;
/// - store failures are logged and never reach the caller.
///
/// Concurrent misses for one key each run `compute`; the last write wins.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rampart::cache::{CacheAside, CacheKey, MemoryStore, Query};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = CacheAside::new(MemoryStore::new());
/// let key = CacheKey::from_query(&Query::new("user").filter("id", 1));
///
/// let name: Result<String, std::io::Error> = cache
///     .get_or_compute(&key, Duration::from_secs(60), || async { Ok("ada".to_owned()) })
///     .await;
/// assert_eq!(name.unwrap(), "ada");
/// # }
/// ```
#[derive(Debug)]
pub struct CacheAside<S> {
    store: S,
    stats: CacheStats,
}

impl<S: CacheStore> CacheAside<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            stats: CacheStats::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the cached value for `key`, or runs `compute` and caches its
    /// success for `ttl`.
    ///
    /// # Errors
    ///
    /// Exactly the errors `compute` returns.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.lookup::<T>(key).await {
            Ok(Some(value)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                trace!(%key, "cache hit");
                return Ok(value);
            }
            Ok(None) => {
                trace!(%key, "cache miss");
            }
            Err(e) => {
                self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(%key, error = %e, "cache read failed, computing directly");
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let value = compute().await?;

        // Encode before awaiting the store so no borrow of `value` is held
        // across the write.
        let encoded = serde_json::to_vec(&value).map(Bytes::from);
        if let Err(e) = self.populate(key, encoded, ttl).await {
            self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(%key, error = %e, "cache write failed, serving uncached result");
        }

        Ok(value)
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CacheError> {
        match self.store.get(key.as_str()).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn populate(
        &self,
        key: &CacheKey,
        encoded: Result<Bytes, serde_json::Error>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.store.set(key.as_str(), encoded?, ttl).await
    }
}
