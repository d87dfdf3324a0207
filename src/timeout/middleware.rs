//! Deadline enforcement as a pipeline layer.

use std::time::Duration;

use tracing::{error, warn};

use crate::{
    Response, StatusCode,
    context::Context,
    middleware::{Middleware, Next, ResponseFuture},
};

use super::{DeadlineGovernor, Outcome};

/// Runs the rest of the pipeline under a [`DeadlineGovernor`].
///
/// Inner layers find the request's
/// [`DeadlineContext`](super::DeadlineContext) in the extensions. When the
/// deadline passes the client gets `504 Gateway Timeout` right away, and
/// whatever the handler produces later is dropped. A handler that panics
/// yields `500 Internal Server Error`.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use rampart::timeout::TimeoutMiddleware;
///
/// let layer = TimeoutMiddleware::new(Duration::from_secs(30));
/// ```
pub struct TimeoutMiddleware {
    governor: DeadlineGovernor,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Duration) -> Self {
        Self {
            governor: DeadlineGovernor::new(timeout),
        }
    }

    pub fn governor(&self) -> &DeadlineGovernor {
        &self.governor
    }
}

impl Middleware for TimeoutMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> ResponseFuture {
        let governor = self.governor;

        Box::pin(async move {
            let method = ctx.request().method().clone();
            let path = ctx.request().path().to_owned();

            let outcome = governor
                .run_with(move |deadline| {
                    let mut ctx = ctx;
                    ctx.extensions_mut().insert(deadline);
                    next.run(ctx)
                })
                .await;

            match outcome {
                Ok(Outcome::Completed(response)) => response,
                Ok(Outcome::TimedOut) => {
                    warn!(
                        %method,
                        %path,
                        timeout_ms = governor.timeout().as_millis() as u64,
                        "request exceeded its deadline"
                    );
                    Response::new(StatusCode::GatewayTimeout).body("Gateway Timeout")
                }
                Err(e) => {
                    error!(%method, %path, error = %e, "request handler failed");
                    Response::new(StatusCode::InternalServerError).body("Internal Server Error")
                }
            }
        })
    }
}
