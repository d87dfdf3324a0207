//! Per-client token-bucket admission control.
//!
//! Every client identifier owns a bucket holding up to `burst_capacity`
//! tokens that refills continuously at `rate_per_second`. Admitting a request
//! costs one token; a client with less than one token is rejected. A cold
//! client starts with a full bucket.
//!
//! All buckets live in one map behind one mutex. The refill-then-consume
//! step for a client runs entirely under that lock, so concurrent requests
//! from the same client can never spend the same token twice. The lock is
//! never held across an `.await`.
//!
//! Idle buckets are dropped by a background sweep ([`RateLimiter::start`]),
//! so memory tracks active clients only. A swept client simply comes back
//! with a fresh, full bucket.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{
    ConfigError, DEFAULT_BURST_CAPACITY, DEFAULT_CLEANUP_INTERVAL, DEFAULT_IDLE_TTL,
    DEFAULT_RATE_PER_SECOND,
};

// Absorbs float drift in `elapsed * rate` so that waiting exactly `1 / rate`
// after exhaustion always buys one token.
const TOKEN_EPSILON: f64 = 1e-9;

/// Token-bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained admissions per second.
    pub rate_per_second: f64,
    /// Maximum tokens available at once. Must be `>= rate_per_second`.
    pub burst_capacity: f64,
    /// A bucket untouched for longer than this is swept.
    pub idle_ttl: Duration,
    /// Period of the background sweep.
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_per_second: DEFAULT_RATE_PER_SECOND,
            burst_capacity: DEFAULT_BURST_CAPACITY,
            idle_ttl: DEFAULT_IDLE_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl RateLimitConfig {
    /// # Errors
    ///
    /// [`ConfigError::InvalidRate`] for a non-positive or non-finite rate,
    /// [`ConfigError::BurstBelowRate`] when the burst cannot cover one
    /// second of sustained traffic, [`ConfigError::ZeroDuration`] for a zero
    /// sweep interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rate_per_second.is_finite() || self.rate_per_second <= 0.0 {
            return Err(ConfigError::InvalidRate(self.rate_per_second));
        }
        if !self.burst_capacity.is_finite() || self.burst_capacity < self.rate_per_second {
            return Err(ConfigError::BurstBelowRate {
                rate: self.rate_per_second,
                burst: self.burst_capacity,
            });
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "cleanup interval",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ClientBudget {
    tokens: f64,
    last_refill_at: Instant,
    last_seen_at: Instant,
}

impl ClientBudget {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill_at: now,
            last_seen_at: now,
        }
    }

    fn refill_and_take(&mut self, now: Instant, config: &RateLimitConfig) -> bool {
        if now > self.last_refill_at {
            let elapsed = now.duration_since(self.last_refill_at).as_secs_f64();
            self.tokens = (self.tokens + elapsed * config.rate_per_second).min(config.burst_capacity);
            self.last_refill_at = now;
        }
        if now > self.last_seen_at {
            self.last_seen_at = now;
        }

        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }
}

type Registry = Arc<Mutex<HashMap<String, ClientBudget>>>;

/// Token-bucket rate limiter keyed by client identifier.
///
/// # Examples
///
/// ```
/// use rampart::security::{RateLimitConfig, RateLimiter};
/// use tokio::time::Instant;
///
/// let limiter = RateLimiter::new(RateLimitConfig {
///     rate_per_second: 1.0,
///     burst_capacity: 2.0,
///     ..RateLimitConfig::default()
/// })
/// .unwrap();
///
/// let now = Instant::now();
/// assert!(limiter.admit("198.51.100.4", now));
/// assert!(limiter.admit("198.51.100.4", now));
/// assert!(!limiter.admit("198.51.100.4", now));
/// ```
pub struct RateLimiter {
    config: RateLimitConfig,
    registry: Registry,
}

impl RateLimiter {
    /// # Errors
    ///
    /// Whatever [`RateLimitConfig::validate`] rejects.
    pub fn new(config: RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decides whether `client_id` may proceed at time `now`.
    ///
    /// Returns `true` and spends one token, or `false` without spending
    /// anything. `now` should not go backwards between calls; if it does,
    /// the bucket simply does not refill.
    pub fn admit(&self, client_id: &str, now: Instant) -> bool {
        let mut registry = lock(&self.registry);

        if let Some(budget) = registry.get_mut(client_id) {
            return budget.refill_and_take(now, &self.config);
        }

        let mut budget = ClientBudget::full(self.config.burst_capacity, now);
        let admitted = budget.refill_and_take(now, &self.config);
        registry.insert(client_id.to_owned(), budget);
        admitted
    }

    /// [`admit`](Self::admit) at the current instant.
    pub fn check(&self, client_id: &str) -> bool {
        self.admit(client_id, Instant::now())
    }

    /// Removes every bucket idle for longer than `idle_ttl` as of `now`.
    ///
    /// Returns the number of buckets removed.
    pub fn sweep(&self, now: Instant) -> usize {
        sweep_registry(&self.registry, now, self.config.idle_ttl)
    }

    /// Starts the periodic idle sweep on the current tokio runtime.
    ///
    /// The sweep runs every `cleanup_interval` regardless of traffic until
    /// the returned handle is stopped or dropped.
    pub fn start(&self) -> SweeperHandle {
        let registry = Arc::clone(&self.registry);
        let period = self.config.cleanup_interval;
        let idle_ttl = self.config.idle_ttl;
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            info!(?period, ?idle_ttl, "rate limiter sweeper started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    now = interval.tick() => {
                        let removed = sweep_registry(&registry, now, idle_ttl);
                        if removed > 0 {
                            debug!(removed, "swept idle rate limit buckets");
                        }
                    }
                }
            }

            info!("rate limiter sweeper stopped");
        });

        SweeperHandle {
            shutdown,
            task: Some(task),
        }
    }

    /// Number of clients currently tracked.
    pub fn client_count(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Tokens held by `client_id` as of its last request, without refilling.
    #[doc(hidden)]
    pub fn tokens(&self, client_id: &str) -> Option<f64> {
        lock(&self.registry).get(client_id).map(|b| b.tokens)
    }

    /// Time for an empty bucket to accrue one token, saturating at
    /// [`Duration::MAX`] for rates too small to represent.
    pub fn retry_after(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.config.rate_per_second).unwrap_or(Duration::MAX)
    }
}

fn sweep_registry(registry: &Registry, now: Instant, idle_ttl: Duration) -> usize {
    let mut registry = lock(registry);
    let before = registry.len();
    registry.retain(|_, budget| now.saturating_duration_since(budget.last_seen_at) <= idle_ttl);
    before - registry.len()
}

// A panic while holding the lock cannot leave a bucket half-updated in a way
// that matters, so a poisoned registry is still used.
fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, ClientBudget>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Controls the background sweep started by [`RateLimiter::start`].
///
/// Dropping the handle also stops the sweep; [`stop`](Self::stop) additionally
/// waits for the task to finish.
#[must_use = "dropping the handle stops the sweeper"]
pub struct SweeperHandle {
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Signals the sweeper to exit and waits for it.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "rate limiter sweeper ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: f64, burst: f64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            rate_per_second: rate,
            burst_capacity: burst,
            idle_ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(10),
        })
        .unwrap()
    }

    #[test]
    fn burst_plus_one_rejects_the_last() {
        let limiter = limiter(5.0, 8.0);
        let now = Instant::now();
        for _ in 0..8 {
            assert!(limiter.admit("c", now));
        }
        assert!(!limiter.admit("c", now));
    }

    #[test]
    fn rejection_does_not_spend_tokens() {
        let limiter = limiter(1.0, 1.0);
        let now = Instant::now();
        assert!(limiter.admit("c", now));
        assert!(!limiter.admit("c", now));
        assert!(!limiter.admit("c", now));
        assert_eq!(limiter.tokens("c"), Some(0.0));
        assert!(limiter.admit("c", now + Duration::from_secs(1)));
    }

    #[test]
    fn one_interval_after_exhaustion_buys_exactly_one() {
        let limiter = limiter(10.0, 20.0);
        let start = Instant::now();
        for _ in 0..20 {
            assert!(limiter.admit("c", start));
        }
        assert!(!limiter.admit("c", start));

        let later = start + Duration::from_millis(100);
        assert!(limiter.admit("c", later));
        assert!(!limiter.admit("c", later));
    }

    #[test]
    fn sustained_rate_is_always_admitted() {
        let limiter = limiter(4.0, 4.0);
        let start = Instant::now();
        for i in 0..200 {
            let at = start + Duration::from_millis(250 * i);
            assert!(limiter.admit("steady", at), "request {i} rejected");
        }
    }

    #[test]
    fn refill_is_capped_at_burst() {
        let limiter = limiter(10.0, 20.0);
        let start = Instant::now();
        assert!(limiter.admit("c", start));
        assert!(limiter.admit("c", start + Duration::from_secs(3600)));
        assert_eq!(limiter.tokens("c"), Some(19.0));
    }

    #[test]
    fn clients_have_independent_buckets() {
        let limiter = limiter(1.0, 1.0);
        let now = Instant::now();
        assert!(limiter.admit("a", now));
        assert!(!limiter.admit("a", now));
        assert!(limiter.admit("b", now));
        assert_eq!(limiter.client_count(), 2);
    }

    #[test]
    fn time_going_backwards_does_not_refill() {
        let limiter = limiter(1.0, 1.0);
        let now = Instant::now() + Duration::from_secs(10);
        assert!(limiter.admit("c", now));
        assert!(!limiter.admit("c", now - Duration::from_secs(5)));
        assert!(!limiter.admit("c", now));
    }

    #[test]
    fn sweep_removes_only_idle_clients() {
        let limiter = limiter(1.0, 1.0);
        let start = Instant::now();
        let _ = limiter.admit("idle", start);
        let _ = limiter.admit("active", start + Duration::from_secs(50));

        assert_eq!(limiter.sweep(start + Duration::from_secs(60)), 0);
        assert_eq!(limiter.sweep(start + Duration::from_secs(61)), 1);
        assert_eq!(limiter.client_count(), 1);
        assert!(limiter.tokens("idle").is_none());
        assert!(limiter.tokens("active").is_some());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let base = RateLimitConfig::default();
        let zero_rate = RateLimitConfig {
            rate_per_second: 0.0,
            ..base
        };
        assert!(matches!(
            RateLimiter::new(zero_rate),
            Err(ConfigError::InvalidRate(_))
        ));
        let small_burst = RateLimitConfig {
            burst_capacity: base.rate_per_second - 1.0,
            ..base
        };
        assert!(matches!(
            RateLimiter::new(small_burst),
            Err(ConfigError::BurstBelowRate { .. })
        ));
    }

    #[test]
    fn retry_after_is_one_token_interval() {
        assert_eq!(limiter(4.0, 4.0).retry_after(), Duration::from_millis(250));
    }

    #[test]
    fn retry_after_saturates_for_tiny_rates() {
        assert_eq!(limiter(1e-30, 1.0).retry_after(), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_idle_clients_in_background() {
        let limiter = limiter(1.0, 1.0);
        let handle = limiter.start();
        assert!(handle.is_running());

        assert!(limiter.check("c"));
        assert_eq!(limiter.client_count(), 1);

        tokio::time::sleep(Duration::from_secs(75)).await;
        assert_eq!(limiter.client_count(), 0);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_sweeper_leaves_registry_alone() {
        let limiter = limiter(1.0, 1.0);
        limiter.start().stop().await;

        assert!(limiter.check("c"));
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(limiter.client_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_never_exceed_burst() {
        let limiter = Arc::new(limiter(0.001, 50.0));
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { (0..20).filter(|_| limiter.admit("shared", now)).count() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            admitted += handle.await.unwrap();
        }
        assert_eq!(admitted, 50);
    }
}
