//! The coalescing cache as a pipeline stage.
//!
//! Everything after [`CacheMiddleware`] in the chain is the downstream handler:
//! it runs only on a miss, at most once at a time per key.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use super::{Middleware, Next};
use crate::cache::{BoxError, BoxFuture, CoalescingCoordinator, Downstream};
use crate::context::Context;
use crate::http::{Request, ResponseWriter};
use crate::{Response, StatusCode};

/// Middleware that serves cacheable requests through a shared
/// [`CoalescingCoordinator`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rttp_cache::cache::{CoalescingCoordinator, MemoryStore};
/// use rttp_cache::config::CacheConfig;
/// use rttp_cache::middleware::{CacheMiddleware, from_middleware};
///
/// let config = CacheConfig::default();
/// let store = Arc::new(MemoryStore::new(config.store_capacity));
/// let coordinator = Arc::new(CoalescingCoordinator::new(&config, store).unwrap());
/// let handler = from_middleware(Arc::new(CacheMiddleware::new(coordinator)));
/// ```
pub struct CacheMiddleware {
    coordinator: Arc<CoalescingCoordinator>,
}

impl CacheMiddleware {
    pub fn new(coordinator: Arc<CoalescingCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<CoalescingCoordinator> {
        &self.coordinator
    }
}

impl Middleware for CacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let coordinator = Arc::clone(&self.coordinator);

        Box::pin(async move {
            // The rest of the chain takes the context; the coordinator keeps a copy
            // of the request for fingerprinting and replay negotiation.
            let request = ctx.request().clone();
            let downstream = RemainingChain::new(ctx, next);
            let mut response = Response::new(StatusCode::Ok);

            match coordinator.handle(&request, &mut response, &downstream).await {
                Ok(_) => response,
                Err(err) => {
                    error!(
                        method = %request.method(),
                        path = %request.path(),
                        error = %err,
                        "downstream handler failed"
                    );
                    Response::new(StatusCode::InternalServerError).body("Internal Server Error")
                }
            }
        })
    }
}

/// Runs the rest of the pipeline once and copies its response into the
/// coordinator's writer.
struct RemainingChain {
    pending: Mutex<Option<(Context, Next)>>,
}

impl RemainingChain {
    fn new(ctx: Context, next: Next) -> Self {
        Self {
            pending: Mutex::new(Some((ctx, next))),
        }
    }
}

impl Downstream for RemainingChain {
    fn call<'a>(
        &'a self,
        _request: &'a Request,
        response: &'a mut dyn ResponseWriter,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        Box::pin(async move {
            let pending = self.pending.lock().take();
            let Some((ctx, next)) = pending else {
                return Err::<(), BoxError>("remaining middleware chain already ran".into());
            };

            let (status, headers, body) = next.run(ctx).await.into_parts();
            response.set_status(status);
            for (name, value) in headers.iter() {
                response.headers_mut().insert(name, value);
            }
            response.write(&body)?;
            Ok(())
        })
    }
}
