//! Request protection: per-client admission control.
//!
//! - [`RateLimiter`]: token-bucket budgets keyed by client identifier.
//! - [`RateLimitMiddleware`]: the limiter as a pipeline layer (`429` on reject).
//! - [`ClientId`]: how a request is attributed to a client.

pub mod middleware;
pub mod rate_limit;

pub use middleware::{ClientId, RateLimitMiddleware};
pub use rate_limit::{RateLimitConfig, RateLimiter, SweeperHandle};
