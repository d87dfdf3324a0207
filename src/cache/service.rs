//! Backing read services and their cached decorator.

use std::{future::Future, sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};

use super::{CacheAside, CacheKey, CacheStore, MemoryStore, Query};

/// The read path of a backing data service.
///
/// Implemented by whatever actually answers a [`Query`] (a database layer,
/// an upstream API) and, with the same signature, by
/// [`CachedReadService`], so callers cannot tell the two apart.
pub trait ReadService: Send + Sync {
    type Output: Serialize + DeserializeOwned + Send;
    type Error: Send;

    fn fetch(&self, query: &Query)
    -> impl Future<Output = Result<Self::Output, Self::Error>> + Send;
}

/// Cache-aside decorator over a [`ReadService`].
///
/// Every query is keyed with [`CacheKey::from_query`] and served through a
/// shared [`CacheAside`]. Several decorators may share one cache as long as
/// their operation names differ.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use rampart::cache::{CachedReadService, Query, ReadService};
///
/// # async fn demo<S: ReadService>(backing: S) -> Result<(), S::Error> {
/// let orders = CachedReadService::in_memory(backing, Duration::from_secs(900));
/// let open = orders.fetch(&Query::new("orders").filter("status", "open")).await?;
/// # let _ = open;
/// # Ok(())
/// # }
/// ```
pub struct CachedReadService<S, C = MemoryStore> {
    inner: S,
    cache: Arc<CacheAside<C>>,
    ttl: Duration,
}

impl<S: ReadService> CachedReadService<S, MemoryStore> {
    /// Decorates `inner` with a private in-memory cache.
    pub fn in_memory(inner: S, ttl: Duration) -> Self {
        Self::new(inner, Arc::new(CacheAside::new(MemoryStore::new())), ttl)
    }
}

impl<S: ReadService, C: CacheStore> CachedReadService<S, C> {
    pub fn new(inner: S, cache: Arc<CacheAside<C>>, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn cache(&self) -> &Arc<CacheAside<C>> {
        &self.cache
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl<S: ReadService, C: CacheStore> ReadService for CachedReadService<S, C> {
    type Output = S::Output;
    type Error = S::Error;

    async fn fetch(&self, query: &Query) -> Result<Self::Output, Self::Error> {
        let key = CacheKey::from_query(query);
        self.cache
            .get_or_compute(&key, self.ttl, || self.inner.fetch(query))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use serde::Deserialize;
    use tokio::time::advance;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Product {
        id: u32,
        category: String,
    }

    #[derive(Debug, PartialEq)]
    enum CatalogError {
        UnknownCategory(String),
    }

    #[derive(Default)]
    struct Catalog {
        calls: AtomicUsize,
    }

    impl ReadService for Catalog {
        type Output = Vec<Product>;
        type Error = CatalogError;

        async fn fetch(&self, query: &Query) -> Result<Vec<Product>, CatalogError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match query.get("category") {
                Some("books") => Ok(vec![Product {
                    id: 1,
                    category: "books".into(),
                }]),
                Some(other) => Err(CatalogError::UnknownCategory(other.to_owned())),
                None => Ok(Vec::new()),
            }
        }
    }

    fn books() -> Query {
        Query::new("products").filter("category", "books")
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_queries_hit_the_backing_service_once() {
        let service = CachedReadService::in_memory(Catalog::default(), Duration::from_secs(60));

        let first = service.fetch(&books()).await.unwrap();
        let second = service.fetch(&books()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(service.inner().calls.load(Ordering::SeqCst), 1);

        advance(Duration::from_secs(61)).await;
        service.fetch(&books()).await.unwrap();
        assert_eq!(service.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn different_filters_are_cached_separately() {
        let service = CachedReadService::in_memory(Catalog::default(), Duration::from_secs(60));

        service.fetch(&books()).await.unwrap();
        service.fetch(&Query::new("products")).await.unwrap();
        service.fetch(&Query::new("products")).await.unwrap();

        assert_eq!(service.inner().calls.load(Ordering::SeqCst), 2);
        assert_eq!(service.cache().store().len().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backing_errors_pass_through_uncached() {
        let service = CachedReadService::in_memory(Catalog::default(), Duration::from_secs(60));
        let games = Query::new("products").filter("category", "games");

        for _ in 0..2 {
            assert_eq!(
                service.fetch(&games).await,
                Err(CatalogError::UnknownCategory("games".into()))
            );
        }
        assert_eq!(service.inner().calls.load(Ordering::SeqCst), 2);
        assert!(service.cache().store().is_empty().unwrap());
    }

    // `Cell` is `Send` but not `Sync`.
    struct Tally;

    impl ReadService for Tally {
        type Output = Cell<u32>;
        type Error = CatalogError;

        async fn fetch(&self, _query: &Query) -> Result<Cell<u32>, CatalogError> {
            Ok(Cell::new(7))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetch_runs_on_spawned_tasks_with_non_sync_output() {
        let service = Arc::new(CachedReadService::in_memory(Tally, Duration::from_secs(60)));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let service = Arc::clone(&service);
                tokio::spawn(async move { service.fetch(&books()).await.map(Cell::into_inner) })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(7));
        }
        assert_eq!(service.cache().store().len().unwrap(), 1);
    }
}
