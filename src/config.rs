//! Protection configuration.
//!
//! Every knob is a plain scalar read from the environment with a documented
//! default. Unparseable values fall back to the default and are logged, so a
//! typo never keeps the service from starting.

use std::time::Duration;

use thiserror::Error;

use crate::security::RateLimitConfig;

// ============================================================================
// DEFAULTS
// ============================================================================

pub const DEFAULT_RATE_PER_SECOND: f64 = 10.0;
pub const DEFAULT_BURST_CAPACITY: f64 = 20.0;
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(180);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("rate limit must be a positive number of requests per second, got {0}")]
    InvalidRate(f64),

    #[error("burst capacity ({burst}) must be at least the sustained rate ({rate})")]
    BurstBelowRate { rate: f64, burst: f64 },

    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },
}

// ============================================================================
// PROTECTION CONFIGURATION
// ============================================================================

/// Settings for the rate limiter, the deadline governor and the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectionConfig {
    /// Sustained admissions per second, per client.
    pub rate_per_second: f64,

    /// Tokens a client may spend at once; a new client starts full.
    pub burst_capacity: f64,

    /// How long an inactive client's budget is retained.
    pub idle_ttl: Duration,

    /// Period of the idle-client sweep.
    pub cleanup_interval: Duration,

    /// Wall-clock budget for one request.
    pub request_timeout: Duration,

    /// Lifetime of a cached read result.
    pub cache_ttl: Duration,

    /// Identify clients by the first `X-Forwarded-For` hop instead of the
    /// socket peer. Only safe behind a proxy that overwrites the header.
    pub trust_forwarded_for: bool,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            rate_per_second: DEFAULT_RATE_PER_SECOND,
            burst_capacity: DEFAULT_BURST_CAPACITY,
            idle_ttl: DEFAULT_IDLE_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
            trust_forwarded_for: false,
        }
    }
}

impl ProtectionConfig {
    /// Create a config from environment variables.
    ///
    /// Environment variables:
    /// - `RAMPART_RATE_LIMIT_RPS`: sustained requests per second (default: 10)
    /// - `RAMPART_RATE_LIMIT_BURST`: burst capacity (default: 20)
    /// - `RAMPART_RATE_LIMIT_IDLE_TTL_SECS`: idle client retention (default: 180)
    /// - `RAMPART_RATE_LIMIT_CLEANUP_INTERVAL_SECS`: sweep period (default: 60)
    /// - `RAMPART_REQUEST_TIMEOUT_MS`: per-request deadline (default: 30000)
    /// - `RAMPART_CACHE_TTL_SECS`: cache entry lifetime (default: 900)
    /// - `RAMPART_TRUST_FORWARDED_FOR`: "true" or "false" (default: false)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let secs = |key: &str, default: Duration| {
            parse_or(&lookup, key, default.as_secs()).map_or(default, Duration::from_secs)
        };

        Self {
            rate_per_second: parse_or(&lookup, "RAMPART_RATE_LIMIT_RPS", defaults.rate_per_second)
                .unwrap_or(defaults.rate_per_second),
            burst_capacity: parse_or(&lookup, "RAMPART_RATE_LIMIT_BURST", defaults.burst_capacity)
                .unwrap_or(defaults.burst_capacity),
            idle_ttl: secs("RAMPART_RATE_LIMIT_IDLE_TTL_SECS", defaults.idle_ttl),
            cleanup_interval: secs(
                "RAMPART_RATE_LIMIT_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval,
            ),
            request_timeout: parse_or(
                &lookup,
                "RAMPART_REQUEST_TIMEOUT_MS",
                defaults.request_timeout.as_millis() as u64,
            )
            .map_or(defaults.request_timeout, Duration::from_millis),
            cache_ttl: secs("RAMPART_CACHE_TTL_SECS", defaults.cache_ttl),
            trust_forwarded_for: lookup("RAMPART_TRUST_FORWARDED_FOR")
                .map(|s| s.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.trust_forwarded_for),
        }
    }

    /// Checks the cross-field constraints.
    ///
    /// # Errors
    ///
    /// The first violated constraint, as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limit().validate()?;
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "request timeout",
            });
        }
        if self.cache_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration { name: "cache ttl" });
        }
        Ok(())
    }

    /// The admission-controller slice of this config.
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            rate_per_second: self.rate_per_second,
            burst_capacity: self.burst_capacity,
            idle_ttl: self.idle_ttl,
            cleanup_interval: self.cleanup_interval,
        }
    }
}

// `None` only when the variable is unset; a bad value logs and yields the default.
fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, %default, "ignoring unparseable setting");
            Some(default)
        }
    }
}
