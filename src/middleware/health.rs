//! JSON health endpoint for the cache coordinator.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::warn;

use super::{Middleware, Next};
use crate::cache::CoalescingCoordinator;
use crate::context::Context;
use crate::{Method, Response, StatusCode};

/// Answers `GET <path>` with the coordinator's [`HealthReport`] and passes
/// everything else through.
///
/// The status is `200` while the report is healthy, including a saturated
/// pool, and `503` once the coordinator is shut down, so plain HTTP probes
/// work without parsing the body.
///
/// [`HealthReport`]: crate::cache::HealthReport
pub struct HealthCheckMiddleware {
    path: String,
    coordinator: Arc<CoalescingCoordinator>,
}

impl HealthCheckMiddleware {
    pub fn new(path: impl Into<String>, coordinator: Arc<CoalescingCoordinator>) -> Self {
        Self {
            path: path.into(),
            coordinator,
        }
    }

    fn report(&self) -> Response {
        let report = self.coordinator.health();
        let status = if report.success {
            StatusCode::Ok
        } else {
            StatusCode::ServiceUnavailable
        };
        match serde_json::to_vec(&report) {
            Ok(body) => Response::new(status)
                .header("Content-Type", "application/json")
                .header("Cache-Control", "no-store")
                .body_bytes(body),
            Err(err) => {
                warn!(error = %err, "failed to serialize health report");
                Response::new(StatusCode::InternalServerError).body("health report unavailable")
            }
        }
    }
}

impl Middleware for HealthCheckMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let request = ctx.request();
        if request.method() == &Method::Get && request.path() == self.path {
            let response = self.report();
            return Box::pin(async move { response });
        }
        Box::pin(next.run(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Request;
    use crate::cache::MemoryStore;
    use crate::config::CacheConfig;
    use crate::middleware::{endpoint, from_middleware};

    fn ctx(target: &str) -> Context {
        let raw = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        Context::new(Request::parse(raw.as_bytes()).unwrap().0)
    }

    fn chain() -> (Arc<CoalescingCoordinator>, Vec<crate::middleware::MiddlewareHandler>) {
        let config = CacheConfig {
            pool_capacity: 3,
            ..CacheConfig::default()
        };
        let coordinator = Arc::new(
            CoalescingCoordinator::new(&config, Arc::new(MemoryStore::new(8))).unwrap(),
        );
        let health = HealthCheckMiddleware::new("/_cache/health", Arc::clone(&coordinator));
        let handlers = vec![
            from_middleware(Arc::new(health)),
            endpoint(|_ctx: Context| async { Response::new(StatusCode::Ok).body("app") }),
        ];
        (coordinator, handlers)
    }

    #[tokio::test]
    async fn serves_report_as_json() {
        let (_, handlers) = chain();
        let response = Next::new(handlers).run(ctx("/_cache/health")).await;
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.headers().get("content-type"), Some("application/json"));

        let json: serde_json::Value = serde_json::from_slice(response.body_ref()).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["status"], "OK");
        assert_eq!(json["pool_capacity"], 3);
        assert_eq!(json["pool_available"], 3);
        assert_eq!(json["active_keys"], 0);
    }

    #[tokio::test]
    async fn reports_unavailable_after_shutdown() {
        let (coordinator, handlers) = chain();
        coordinator.shutdown();
        let response = Next::new(handlers).run(ctx("/_cache/health")).await;
        assert_eq!(response.status(), StatusCode::ServiceUnavailable);
    }

    #[tokio::test]
    async fn saturated_pool_still_answers_200() {
        let (coordinator, handlers) = chain();
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(coordinator.pool().borrow(std::time::Duration::from_millis(10)).await.unwrap());
        }
        let response = Next::new(handlers).run(ctx("/_cache/health")).await;
        assert_eq!(response.status(), StatusCode::Ok);

        let json: serde_json::Value = serde_json::from_slice(response.body_ref()).unwrap();
        assert_eq!(json["pool_available"], 0);
        assert_eq!(json["status"], "Lock pool saturated (3 keys in flight)");
        for lock in held {
            coordinator.pool().release(lock);
        }
    }

    #[tokio::test]
    async fn other_paths_pass_through() {
        let (_, handlers) = chain();
        let response = Next::new(handlers).run(ctx("/reports")).await;
        assert_eq!(response.body_ref(), b"app");
    }
}
