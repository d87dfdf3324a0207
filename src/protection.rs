//! One place that turns a [`ProtectionConfig`] into running protection.
//!
//! Builds the shared rate limiter and read cache, owns the limiter's
//! background sweep, and installs the layers in request order:
//!
//! ```text
//! RateLimitMiddleware → TimeoutMiddleware → (your layers) → handler
//! ```
//!
//! Read handlers reach the cache through [`Protection::cache`] or
//! [`Protection::cached`].

use std::{sync::Arc, time::Duration};

use crate::{
    cache::{CacheAside, CachedReadService, MemoryStore, ReadService},
    config::{ConfigError, ProtectionConfig},
    middleware::PipelineBuilder,
    security::{RateLimitMiddleware, RateLimiter, SweeperHandle},
    timeout::TimeoutMiddleware,
};

/// Shared protection state for one service instance.
pub struct Protection {
    config: ProtectionConfig,
    limiter: Arc<RateLimiter>,
    cache: Arc<CacheAside<MemoryStore>>,
    sweeper: Option<SweeperHandle>,
}

impl Protection {
    /// # Errors
    ///
    /// The first constraint `config` violates.
    pub fn new(config: ProtectionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(config.rate_limit())?);
        Ok(Self {
            config,
            limiter,
            cache: Arc::new(CacheAside::new(MemoryStore::new())),
            sweeper: None,
        })
    }

    /// [`new`](Self::new) with [`ProtectionConfig::from_env`].
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(ProtectionConfig::from_env())
    }

    /// Starts the idle-client sweep. Calling it again is a no-op.
    pub fn start(&mut self) {
        if self.sweeper.is_none() {
            self.sweeper = Some(self.limiter.start());
        }
    }

    /// Stops the idle-client sweep and waits for it to exit.
    pub async fn stop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.sweeper.as_ref().is_some_and(SweeperHandle::is_running)
    }

    /// Appends the rate-limit and timeout layers to `builder`.
    pub fn layers(&self, builder: PipelineBuilder) -> PipelineBuilder {
        builder
            .layer(Arc::new(
                RateLimitMiddleware::new(Arc::clone(&self.limiter))
                    .trust_forwarded_for(self.config.trust_forwarded_for),
            ))
            .layer(Arc::new(TimeoutMiddleware::new(self.config.request_timeout)))
    }

    /// Wraps a backing read service in the shared cache.
    ///
    /// Services sharing the cache must use distinct operation names.
    pub fn cached<S: ReadService>(&self, inner: S) -> CachedReadService<S, MemoryStore> {
        CachedReadService::new(inner, Arc::clone(&self.cache), self.config.cache_ttl)
    }

    pub fn config(&self) -> &ProtectionConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn cache(&self) -> &Arc<CacheAside<MemoryStore>> {
        &self.cache
    }

    pub fn cache_ttl(&self) -> Duration {
        self.config.cache_ttl
    }
}
