//! Middleware pipeline: ordered layers in front of a terminal handler.
//!
//! Each middleware wraps the next layer and may pass the request through,
//! short-circuit with its own response, or decorate the downstream response.
//! The protection layers of this crate are ordinary middleware:
//!
//! ```text
//! LoggerMiddleware → RateLimitMiddleware → TimeoutMiddleware → handler
//! ```
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; [`Next::run`] advances it.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`IntoHandler`]: conversion for the terminal `async fn(Context) -> Response`.
//! - [`Pipeline`] / [`PipelineBuilder`]: an assembled, shareable stack.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Request, Response, StatusCode, context::Context};

/// Boxed response future returned by every layer.
pub type ResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> ResponseFuture + Send + Sync + 'static>;

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so a middleware can forward a
/// request at most once. The stack itself is shared, advancing only bumps an
/// index.
pub struct Next {
    stack: Arc<[MiddlewareHandler]>,
    index: usize,
}

impl Next {
    /// Creates a cursor positioned at the start of `stack`.
    pub fn new(stack: Arc<[MiddlewareHandler]>) -> Self {
        Self { stack, index: 0 }
    }

    /// Invokes the next layer and returns its response.
    ///
    /// An exhausted chain (no layer produced a response) yields
    /// `500 Internal Server Error`.
    pub async fn run(mut self, ctx: Context) -> Response {
        let handler = self.stack.get(self.index).cloned();
        match handler {
            Some(handler) => {
                self.index += 1;
                handler(ctx, self).await
            }
            None => Response::new(StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline"),
        }
    }
}

/// The core trait for all middleware.
///
/// # Contract
///
/// - Implementations must be `Send + Sync`; one instance serves every request.
/// - `handle` returns a pinned `Send` future so it can be awaited, or
///   spawned, on a multi-threaded runtime.
/// - Shared state must not stay locked across an `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to `next`.
    fn handle(&self, ctx: Context, next: Next) -> ResponseFuture;
}

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// Conversion trait for the terminal request handler.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait via the blanket impl.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler, boxing the returned future.
    fn call(&self, ctx: Context) -> ResponseFuture;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> ResponseFuture {
        Box::pin((self)(ctx))
    }
}

/// Assembles middleware layers in order, outermost first.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rampart::{Response, StatusCode};
/// use rampart::middleware::{LoggerMiddleware, Pipeline};
///
/// let pipeline = Pipeline::builder()
///     .layer(Arc::new(LoggerMiddleware))
///     .handler(|_ctx| async { Response::new(StatusCode::Ok) });
/// ```
#[derive(Default)]
pub struct PipelineBuilder {
    layers: Vec<MiddlewareHandler>,
}

impl PipelineBuilder {
    /// Appends a middleware; layers run in the order they are added.
    #[must_use]
    pub fn layer<M>(mut self, middleware: Arc<M>) -> Self
    where
        M: Middleware + 'static,
    {
        self.layers.push(from_middleware(middleware));
        self
    }

    /// Terminates the stack with `handler` and freezes it.
    pub fn handler(mut self, handler: impl IntoHandler) -> Pipeline {
        self.layers
            .push(Arc::new(move |ctx: Context, _next: Next| handler.call(ctx)));
        Pipeline {
            stack: self.layers.into(),
        }
    }
}

/// A frozen middleware stack plus handler. Cloning is cheap.
#[derive(Clone)]
pub struct Pipeline {
    stack: Arc<[MiddlewareHandler]>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Runs `request` through every layer and returns the final response.
    pub async fn handle(&self, request: Request) -> Response {
        self.handle_context(Context::new(request)).await
    }

    /// Like [`handle`](Self::handle) for a pre-populated [`Context`].
    pub async fn handle_context(&self, ctx: Context) -> Response {
        Next::new(Arc::clone(&self.stack)).run(ctx).await
    }

    /// Number of layers, the terminal handler included.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

/// Logs each request's method, path, client, status and duration.
///
/// Never short-circuits. Placed outermost it also records requests that the
/// rate limiter or the deadline governor answered on their own.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> ResponseFuture {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_owned();
            let path = ctx.request().path().to_owned();
            let peer = ctx
                .request()
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "-".to_owned());

            let response = next.run(ctx).await;
            let status = response.status().as_u16();
            let elapsed = start.elapsed();

            if response.status().is_server_error() {
                tracing::warn!(%method, %path, %peer, status, ?elapsed, "request failed");
            } else {
                tracing::info!(%method, %path, %peer, status, ?elapsed, "request served");
            }

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::Method;

    // Records the order in which layers see the request.
    struct Trace {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Middleware for Trace {
        fn handle(&self, ctx: Context, next: Next) -> ResponseFuture {
            self.seen.lock().unwrap().push(self.name);
            Box::pin(next.run(ctx))
        }
    }

    struct Reject;

    impl Middleware for Reject {
        fn handle(&self, _ctx: Context, _next: Next) -> ResponseFuture {
            Box::pin(async { Response::new(StatusCode::TooManyRequests) })
        }
    }

    fn get(path: &str) -> Request {
        Request::new(Method::Get, path)
    }

    #[tokio::test]
    async fn layers_run_in_order_before_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder()
            .layer(Arc::new(Trace { name: "outer", seen: seen.clone() }))
            .layer(Arc::new(Trace { name: "inner", seen: seen.clone() }))
            .handler(|_ctx| async { Response::new(StatusCode::Ok) });

        let res = pipeline.handle(get("/")).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(*seen.lock().unwrap(), vec!["outer", "inner"]);
        assert_eq!(pipeline.depth(), 3);
    }

    #[tokio::test]
    async fn short_circuit_skips_handler() {
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let pipeline = Pipeline::builder().layer(Arc::new(Reject)).handler(move |_ctx| {
            let flag = flag.clone();
            async move {
                *flag.lock().unwrap() = true;
                Response::new(StatusCode::Ok)
            }
        });

        let res = pipeline.handle(get("/")).await;
        assert_eq!(res.status(), StatusCode::TooManyRequests);
        assert!(!*called.lock().unwrap());
    }

    #[tokio::test]
    async fn exhausted_chain_returns_500() {
        let stack: Arc<[MiddlewareHandler]> = Vec::new().into();
        let res = Next::new(stack).run(Context::new(get("/"))).await;
        assert_eq!(res.status(), StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn logger_passes_response_through() {
        let pipeline = Pipeline::builder()
            .layer(Arc::new(LoggerMiddleware))
            .handler(|_ctx| async { Response::new(StatusCode::Created) });
        assert_eq!(pipeline.handle(get("/x")).await.status(), StatusCode::Created);
    }
}
