//! # rttp-cache
//!
//! Request-coalescing response cache middleware for the rttp HTTP framework.
//!
//! Identical concurrent requests are computed once; repeated requests replay
//! the stored response; distinct-key concurrency is bounded by a lock pool
//! that answers `429` instead of growing without limit.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rttp_cache::cache::{CoalescingCoordinator, MemoryStore};
//! use rttp_cache::config::CacheConfig;
//! use rttp_cache::context::Context;
//! use rttp_cache::middleware::{CacheMiddleware, Next, endpoint, from_middleware};
//! use rttp_cache::{Request, Response, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::from_json_str(r#"{ "pool_capacity": 32 }"#)?;
//!     let store = Arc::new(MemoryStore::new(config.store_capacity));
//!     let coordinator = Arc::new(CoalescingCoordinator::new(&config, store)?);
//!
//!     let chain = vec![
//!         from_middleware(Arc::new(CacheMiddleware::new(coordinator))),
//!         endpoint(|_ctx: Context| async {
//!             Response::new(StatusCode::Ok).body("expensive report")
//!         }),
//!     ];
//!
//!     let (request, _) = Request::parse(b"GET /report HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
//!     let response = Next::new(chain).run(Context::new(request)).await;
//!     assert_eq!(response.headers().get("x-cache"), Some("MISS"));
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CoalescingCoordinator, Outcome};
pub use config::{CacheConfig, ConfigError};
pub use http::{Headers, Method, Request, Response, ResponseWriter, StatusCode};
