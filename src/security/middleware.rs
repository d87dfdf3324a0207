//! Admission-control middleware.
//!
//! [`RateLimitMiddleware`] resolves a [`ClientId`] for each request, asks the
//! [`RateLimiter`] for a token and either forwards the request or answers
//! `429 Too Many Requests` itself.

use std::{fmt, sync::Arc};

use crate::{
    Request, Response, StatusCode,
    context::Context,
    middleware::{Middleware, Next, ResponseFuture},
};

use super::RateLimiter;

/// Stable identifier of the caller a rate budget is charged to.
///
/// Resolved from the connection's peer IP (the port is ignored so that
/// reconnecting does not reset a client's budget). Forwarded addresses are
/// only honoured when explicitly enabled. Inserted into the request
/// extensions for downstream layers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    /// Identifier used when the request carries no usable address.
    pub const UNKNOWN: &'static str = "unknown";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Resolves the client of `request`.
    ///
    /// With `trust_forwarded_for`, the first hop of `X-Forwarded-For` wins
    /// when present and non-empty.
    pub fn from_request(request: &Request, trust_forwarded_for: bool) -> Self {
        if trust_forwarded_for {
            let forwarded = request
                .headers()
                .get("x-forwarded-for")
                .and_then(|value| value.split(',').next())
                .map(str::trim)
                .filter(|hop| !hop.is_empty());
            if let Some(hop) = forwarded {
                return Self::new(hop);
            }
        }

        match request.peer_addr() {
            Some(addr) => Self(addr.ip().to_string()),
            None => Self::new(Self::UNKNOWN),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token-bucket admission control as a pipeline layer.
///
/// Rejected requests never reach the inner layers. The `Retry-After` header
/// tells the client how long one token takes to accrue, rounded up to whole
/// seconds.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rampart::security::{RateLimitConfig, RateLimitMiddleware, RateLimiter};
///
/// let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()).unwrap());
/// let layer = RateLimitMiddleware::new(limiter).trust_forwarded_for(true);
/// ```
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
    trust_forwarded_for: bool,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            trust_forwarded_for: false,
        }
    }

    /// Identify clients by `X-Forwarded-For` when present.
    #[must_use]
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn rejection(&self) -> Response {
        // The float-to-int cast saturates for an unrepresentably long wait.
        let retry_after = self.limiter.retry_after().as_secs_f64().ceil().max(1.0) as u64;
        Response::new(StatusCode::TooManyRequests)
            .header("Retry-After", retry_after.to_string())
            .body("Too Many Requests")
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> ResponseFuture {
        let client = ClientId::from_request(ctx.request(), self.trust_forwarded_for);

        if !self.limiter.check(client.as_str()) {
            tracing::debug!(
                %client,
                path = %ctx.request().path(),
                "rate limit exceeded"
            );
            let response = self.rejection();
            return Box::pin(async move { response });
        }

        ctx.extensions_mut().insert(client);
        Box::pin(next.run(ctx))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::{Method, middleware::Pipeline, security::RateLimitConfig};

    fn peer(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    fn pipeline(limiter: Arc<RateLimiter>, trust: bool) -> Pipeline {
        Pipeline::builder()
            .layer(Arc::new(RateLimitMiddleware::new(limiter).trust_forwarded_for(trust)))
            .handler(|ctx: Context| async move {
                let client = ctx
                    .extensions()
                    .get::<ClientId>()
                    .map(|c| c.to_string())
                    .unwrap_or_default();
                Response::new(StatusCode::Ok).body(client)
            })
    }

    fn limiter(rate: f64, burst: f64) -> Arc<RateLimiter> {
        Arc::new(
            RateLimiter::new(RateLimitConfig {
                rate_per_second: rate,
                burst_capacity: burst,
                ..RateLimitConfig::default()
            })
            .unwrap(),
        )
    }

    #[test]
    fn client_id_ignores_port() {
        let a = Request::new(Method::Get, "/").with_peer_addr(peer("10.1.2.3:1000"));
        let b = Request::new(Method::Get, "/").with_peer_addr(peer("10.1.2.3:2000"));
        assert_eq!(ClientId::from_request(&a, false), ClientId::from_request(&b, false));
        assert_eq!(ClientId::from_request(&a, false).as_str(), "10.1.2.3");
    }

    #[test]
    fn forwarded_for_only_when_trusted() {
        let req = Request::new(Method::Get, "/")
            .with_peer_addr(peer("10.0.0.1:80"))
            .header("X-Forwarded-For", " 203.0.113.9 , 10.0.0.1");
        assert_eq!(ClientId::from_request(&req, false).as_str(), "10.0.0.1");
        assert_eq!(ClientId::from_request(&req, true).as_str(), "203.0.113.9");
    }

    #[test]
    fn missing_peer_is_unknown() {
        let req = Request::new(Method::Get, "/");
        assert_eq!(ClientId::from_request(&req, true).as_str(), ClientId::UNKNOWN);
    }

    #[tokio::test(start_paused = true)]
    async fn twenty_five_instant_requests_admit_twenty() {
        let pipeline = pipeline(limiter(10.0, 20.0), false);
        let mut statuses = Vec::new();
        for _ in 0..25 {
            let req = Request::new(Method::Get, "/").with_peer_addr(peer("192.0.2.1:4000"));
            statuses.push(pipeline.handle(req).await.status());
        }

        assert!(statuses[..20].iter().all(|s| *s == StatusCode::Ok));
        assert!(statuses[20..].iter().all(|s| *s == StatusCode::TooManyRequests));
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_carries_retry_after() {
        let pipeline = pipeline(limiter(0.5, 1.0), false);
        let req = || Request::new(Method::Get, "/").with_peer_addr(peer("192.0.2.1:4000"));
        assert_eq!(pipeline.handle(req()).await.status(), StatusCode::Ok);

        let rejected = pipeline.handle(req()).await;
        assert_eq!(rejected.status(), StatusCode::TooManyRequests);
        assert_eq!(rejected.headers().get("retry-after"), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn tiny_rate_still_answers_429() {
        let pipeline = pipeline(limiter(1e-30, 1.0), false);
        let req = || Request::new(Method::Get, "/").with_peer_addr(peer("192.0.2.1:4000"));
        assert_eq!(pipeline.handle(req()).await.status(), StatusCode::Ok);

        let rejected = pipeline.handle(req()).await;
        assert_eq!(rejected.status(), StatusCode::TooManyRequests);
        assert_eq!(
            rejected.headers().get("retry-after"),
            Some(u64::MAX.to_string().as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn admitted_request_sees_client_id() {
        let pipeline = pipeline(limiter(1.0, 1.0), false);
        let req = Request::new(Method::Get, "/").with_peer_addr(peer("198.51.100.7:9"));
        let res = pipeline.handle(req).await;
        assert_eq!(res.body_slice(), b"198.51.100.7");
    }
}
