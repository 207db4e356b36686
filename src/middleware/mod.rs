//! Middleware pipeline: composable before/after request handler logic.
//!
//! Each middleware wraps the next layer, enabling request inspection,
//! short-circuit responses, and response decoration without coupling handlers
//! to infrastructure concerns.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`] / [`endpoint`]: build handlers from a [`Middleware`]
//!   or from a terminal handler function.
//!
//! ## Built-in middleware
//!
//! - [`CacheMiddleware`]: the coalescing response cache.
//! - [`HealthCheckMiddleware`]: serves the cache health report as JSON.
//! - [`LoggerMiddleware`]: request/response logger.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Response, context::Context};

pub mod cache;
pub mod health;

pub use cache::CacheMiddleware;
pub use health::HealthCheckMiddleware;

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed on each call to [`run`](Self::run), so it cannot be called
/// more than once per middleware invocation.
pub struct Next {
    middlewares: Vec<MiddlewareHandler>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rttp_cache::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware::new()));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// Wraps a terminal handler as the last entry of a pipeline.
///
/// The handler never sees `Next`; anything after it in the chain is unreachable.
///
/// ```rust,no_run
/// use rttp_cache::middleware::{Next, endpoint};
/// use rttp_cache::{Response, StatusCode};
///
/// let chain = vec![endpoint(|_ctx| async { Response::new(StatusCode::Ok).body("report") })];
/// let next = Next::new(chain);
/// ```
pub fn endpoint<H, F>(handler: H) -> MiddlewareHandler
where
    H: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    Arc::new(
        move |ctx: Context, _next: Next| -> Pin<Box<dyn Future<Output = Response> + Send>> {
            Box::pin(handler(ctx))
        },
    )
}

impl Next {
    /// Creates a new `Next` positioned at the start of the given middleware stack.
    pub fn new(middlewares: Vec<MiddlewareHandler>) -> Self {
        Self {
            middlewares,
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain and returns its response.
    ///
    /// If the chain is exhausted without producing a response, a
    /// `500 Internal Server Error` is returned as a safe fallback.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            handler(ctx, self).await
        } else {
            Response::new(crate::StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline")
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may pass
/// through, short-circuit, or decorate the downstream response.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// Logs each request's method, path, status, cache outcome, and duration.
///
/// ```text
/// METHOD /path - STATUS [HIT|MISS|-] (duration)
/// ```
pub struct LoggerMiddleware {
    outcome_header: Arc<str>,
}

impl Default for LoggerMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggerMiddleware {
    /// Reads the cache outcome from `X-Cache`.
    pub fn new() -> Self {
        Self::with_outcome_header("X-Cache")
    }

    /// Reads the cache outcome from a custom header.
    pub fn with_outcome_header(name: impl Into<Arc<str>>) -> Self {
        Self {
            outcome_header: name.into(),
        }
    }
}

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let outcome_header = Arc::clone(&self.outcome_header);
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();

            let response = next.run(ctx).await;

            let duration = start.elapsed();
            let status = response.status().as_u16();
            let outcome = response.headers().get(&outcome_header).unwrap_or("-");

            tracing::info!("{} {} - {} [{}] ({:?})", method, path, status, outcome, duration);

            response
        })
    }
}
