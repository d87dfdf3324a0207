//! Cache storage backends.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use tokio::time::Instant;

use super::CacheError;

/// Backend storage for cached payloads.
///
/// Implementations own expiry: [`get`](Self::get) must never return an
/// entry whose TTL has run out. Errors mean "the store could not answer",
/// never "not found". Callers treat them as a miss.
pub trait CacheStore: Send + Sync + 'static {
    /// Returns the payload stored under `key` if it is still fresh.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Bytes>, CacheError>> + Send;

    /// Stores `value` under `key` for `ttl`, replacing any previous entry.
    fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;
}

/// One stored payload and the instant it stops being served.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Bytes,
    /// `None` when `now + ttl` is past what an [`Instant`] can represent;
    /// such an entry never expires.
    pub expires_at: Option<Instant>,
}

impl CacheEntry {
    pub fn new(value: Bytes, ttl: Duration, now: Instant) -> Self {
        Self {
            value,
            expires_at: now.checked_add(ttl),
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Process-local store: one map behind one mutex.
///
/// Expired entries are dropped when a lookup finds them, or in bulk by
/// [`purge_expired`](Self::purge_expired).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries currently held, expired ones included.
    ///
    /// # Errors
    ///
    /// [`CacheError::Unavailable`] if the map's lock is poisoned.
    pub fn len(&self) -> Result<usize, CacheError> {
        Ok(self.lock()?.len())
    }

    /// # Errors
    ///
    /// [`CacheError::Unavailable`] if the map's lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.lock()?.is_empty())
    }

    /// Drops every expired entry; returns how many were removed.
    ///
    /// # Errors
    ///
    /// [`CacheError::Unavailable`] if the map's lock is poisoned.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now));
        Ok(before - entries.len())
    }

    /// # Errors
    ///
    /// [`CacheError::Unavailable`] if the map's lock is poisoned.
    pub fn clear(&self) -> Result<(), CacheError> {
        self.lock()?.clear();
        Ok(())
    }

    // A poisoned map is reported as an unavailable store rather than
    // recovered; the caller falls back to computing.
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, CacheEntry>>, CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable("memory store lock poisoned".to_owned()))
    }
}

impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let now = Instant::now();
        let mut entries = self.lock()?;

        let lookup = entries
            .get(key)
            .map(|entry| entry.is_fresh(now).then(|| entry.value.clone()));

        match lookup {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let entry = CacheEntry::new(value, ttl, Instant::now());
        self.lock()?.insert(key.to_owned(), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entry_is_served_until_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_ttl_never_expires() {
        let store = MemoryStore::new();
        store
            .set("k", Bytes::from_static(b"v"), Duration::MAX)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        assert_eq!(store.purge_expired().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_entry_supersedes_older() {
        let store = MemoryStore::new();
        store.set("k", Bytes::from_static(b"old"), Duration::from_secs(1)).await.unwrap();
        store.set("k", Bytes::from_static(b"new"), Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"new")));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired_entries() {
        let store = MemoryStore::new();
        store.set("short", Bytes::new(), Duration::from_secs(1)).await.unwrap();
        store.set("long", Bytes::new(), Duration::from_secs(100)).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.len().unwrap(), 1);

        store.clear().unwrap();
        assert!(store.is_empty().unwrap());
    }
}
