//! Request coalescing in front of an expensive downstream handler.
//!
//! For each cacheable request the coordinator:
//!
//! 1. fingerprints it (non-cacheable methods go straight downstream);
//! 2. joins the key's in-flight entry, or borrows a pooled lock and creates
//!    one (pool exhausted ⇒ `429 Timeout waiting for cache lock`);
//! 3. acquires the key's mutex (timeout ⇒ `429 Timeout acquiring cache lock`);
//! 4. under the mutex, replays a hit or runs downstream through a
//!    [`ResponseCapture`] and stores a 2xx result;
//! 5. leaves the in-flight entry, returning the lock to the pool when the
//!    last holder leaves.
//!
//! Step 5 lives in a drop guard, so it also runs when downstream fails,
//! panics, or the request future is cancelled.

use std::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::capture::ResponseCapture;
use super::codec::CompressionPolicy;
use super::inflight::InFlightRegistry;
use super::key::{CacheKey, KeyFingerprinter};
use super::pool::{LockPool, PooledLock};
use super::replay::{self, ReplayMode};
use super::stats::{CacheStats, HealthReport};
use super::store::CacheStore;
use crate::config::{CacheConfig, ConfigError};
use crate::http::{Request, ResponseWriter, StatusCode};

/// Boxed error returned by downstream handlers.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Boxed `Send` future borrowing from the call site.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const POOL_TIMEOUT_MESSAGE: &str = "Timeout waiting for cache lock";
pub const LOCK_TIMEOUT_MESSAGE: &str = "Timeout acquiring cache lock";

/// The expensive handler behind the cache.
///
/// Implemented for any `Fn(&Request, &mut dyn ResponseWriter) -> BoxFuture`
/// closure; wrap one in [`downstream_fn`] to get its signature inferred.
pub trait Downstream: Send + Sync {
    fn call<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut dyn ResponseWriter,
    ) -> BoxFuture<'a, Result<(), BoxError>>;
}

impl<F> Downstream for F
where
    F: for<'a> Fn(&'a Request, &'a mut dyn ResponseWriter) -> BoxFuture<'a, Result<(), BoxError>>
        + Send
        + Sync,
{
    fn call<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut dyn ResponseWriter,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        self(request, response)
    }
}

/// Pins a closure to the [`Downstream`] signature.
///
/// ```rust,no_run
/// use rttp_cache::cache::{BoxError, downstream_fn};
///
/// let handler = downstream_fn(|req, res| {
///     Box::pin(async move {
///         res.write(format!("computed {}", req.path()).as_bytes())?;
///         Ok::<(), BoxError>(())
///     })
/// });
/// # let _ = handler;
/// ```
pub fn downstream_fn<F>(f: F) -> F
where
    F: for<'a> Fn(&'a Request, &'a mut dyn ResponseWriter) -> BoxFuture<'a, Result<(), BoxError>>
        + Send
        + Sync,
{
    f
}

/// Admission-control rejection kinds, both answered with 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No pooled lock became free within the timeout.
    PoolExhausted,
    /// The key's mutex stayed held past the timeout.
    LockTimeout,
}

/// What [`CoalescingCoordinator::handle`] did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Method not cacheable; downstream ran directly.
    Bypassed,
    Hit(ReplayMode),
    /// Downstream ran; `stored` says whether the result entered the cache.
    Miss { stored: bool },
    Rejected(Rejection),
}

/// Owns the lock pool, in-flight registry, store, and stats for one process.
///
/// Build one at startup and share it (`Arc`) with every request.
pub struct CoalescingCoordinator {
    fingerprinter: KeyFingerprinter,
    pool: LockPool,
    registry: InFlightRegistry,
    store: Arc<dyn CacheStore>,
    stats: Arc<CacheStats>,
    policy: CompressionPolicy,
    lock_timeout: Duration,
    outcome_header: String,
    max_entry_size: usize,
    stats_log_frequency: u64,
}

impl std::fmt::Debug for CoalescingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingCoordinator")
            .field("pool_capacity", &self.pool.capacity())
            .field("pool_available", &self.pool.available())
            .field("active_keys", &self.registry.len())
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl CoalescingCoordinator {
    /// Builds a coordinator over `store` and subscribes to its evictions.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] from validating `config` or compiling its
    /// identity patterns.
    pub fn new(config: &CacheConfig, store: Arc<dyn CacheStore>) -> Result<Self, ConfigError> {
        config.validate()?;
        let stats = Arc::new(CacheStats::new());

        {
            let stats = Arc::clone(&stats);
            store.on_eviction(Arc::new(move |key, entry| {
                stats.record_eviction();
                debug!(key = %key, size = entry.stored_size(), "cache entry evicted");
            }));
        }

        Ok(Self {
            fingerprinter: KeyFingerprinter::from_config(config)?,
            pool: LockPool::new(config.pool_capacity),
            registry: InFlightRegistry::new(),
            store,
            stats,
            policy: CompressionPolicy::from_config(config),
            lock_timeout: config.lock_timeout(),
            outcome_header: config.outcome_header.clone(),
            max_entry_size: config.max_entry_size,
            stats_log_frequency: config.stats_log_frequency,
        })
    }

    /// Serves `request` into `response`, computing through `downstream` at
    /// most once per key at a time.
    ///
    /// # Errors
    ///
    /// Downstream errors, unchanged, after the key's reservation is torn down.
    /// Admission rejections are not errors; they come back as
    /// [`Outcome::Rejected`] with a 429 already written.
    pub async fn handle<D>(
        &self,
        request: &Request,
        response: &mut dyn ResponseWriter,
        downstream: &D,
    ) -> Result<Outcome, BoxError>
    where
        D: Downstream + ?Sized,
    {
        if self.stats.record_request(self.stats_log_frequency) {
            self.log_summary();
        }

        let Some(key) = self.fingerprinter.fingerprint(request) else {
            self.stats.record_bypass();
            debug!(method = %request.method(), path = %request.path(), "method not cacheable; bypassing");
            downstream.call(request, response).await?;
            return Ok(Outcome::Bypassed);
        };

        let Some(reservation) = self.reserve(&key).await else {
            self.stats.record_borrow_failure();
            warn!(key = %key, timeout = ?self.lock_timeout, "lock pool exhausted");
            return self.reject(response, Rejection::PoolExhausted);
        };

        let lock = Arc::clone(&reservation.lock);
        let _guard = match tokio::time::timeout(self.lock_timeout, lock.mutex().lock()).await {
            Ok(guard) => guard,
            Err(_elapsed) => {
                // Unwind the reservation before answering.
                drop(reservation);
                self.stats.record_lock_timeout();
                warn!(key = %key, timeout = ?self.lock_timeout, "timed out waiting for key lock");
                return self.reject(response, Rejection::LockTimeout);
            }
        };

        if let Some(entry) = self.store.get(&key) {
            self.stats.record_hit();
            response.set_header(&self.outcome_header, "HIT");
            let mode = replay::replay(&key, &entry, request.headers(), response)?;
            if mode == ReplayMode::Degraded {
                self.stats.record_replay_failure();
            }
            debug!(key = %key, mode = ?mode, "cache hit");
            return Ok(Outcome::Hit(mode));
        }

        self.stats.record_miss();
        response.set_header(&self.outcome_header, "MISS");
        let mut capture = ResponseCapture::new(response, self.max_entry_size);
        downstream.call(request, &mut capture).await?;

        let status = capture.status();
        if !status.is_success() {
            debug!(key = %key, status = status.as_u16(), "downstream status not cacheable");
            return Ok(Outcome::Miss { stored: false });
        }

        let stored = match capture.finish(&self.policy, &self.outcome_header) {
            Ok(entry) => {
                debug!(
                    key = %key,
                    size = entry.stored_size(),
                    encoding = %entry.encoding,
                    "storing response"
                );
                self.store.put(key, entry);
                self.stats.record_store();
                true
            }
            Err(err) => {
                self.stats.record_store_failure();
                warn!(key = %key, error = %err, "response not cached");
                false
            }
        };
        Ok(Outcome::Miss { stored })
    }

    /// Joins or creates the in-flight entry for `key`.
    async fn reserve(&self, key: &CacheKey) -> Option<Reservation<'_>> {
        if let Some(lock) = self.registry.join(key) {
            self.stats.record_join();
            return Some(Reservation::new(self, key.clone(), lock));
        }

        let borrowed = self.pool.borrow(self.lock_timeout).await?;
        self.stats.record_borrow();

        let registration = self.registry.register(key.clone(), borrowed);
        if let Some(surplus) = registration.surplus {
            // Another request registered the key while we waited on the pool.
            self.stats.record_join();
            self.return_lock(surplus);
        }
        Some(Reservation::new(self, key.clone(), registration.lock))
    }

    fn return_lock(&self, lock: Arc<PooledLock>) {
        self.pool.release(lock);
        self.stats.record_return();
    }

    fn reject(
        &self,
        response: &mut dyn ResponseWriter,
        rejection: Rejection,
    ) -> Result<Outcome, BoxError> {
        let message = match rejection {
            Rejection::PoolExhausted => POOL_TIMEOUT_MESSAGE,
            Rejection::LockTimeout => LOCK_TIMEOUT_MESSAGE,
        };
        response.send_error(StatusCode::TooManyRequests, message)?;
        Ok(Outcome::Rejected(rejection))
    }

    /// Computes the key for `request`, or `None` if it bypasses the cache.
    pub fn fingerprint(&self, request: &Request) -> Option<CacheKey> {
        self.fingerprinter.fingerprint(request)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn pool(&self) -> &LockPool {
        &self.pool
    }

    pub fn registry(&self) -> &InFlightRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Cheap snapshot for health polling: a handful of atomic loads and two
    /// short lock acquisitions.
    pub fn health(&self) -> HealthReport {
        let stats = self.stats.snapshot();
        let capacity = self.pool.capacity();
        let available = self.pool.available();
        let active_keys = self.registry.len();

        let (success, status) = if self.pool.is_closed() {
            (false, "Cache coordinator shut down".to_owned())
        } else if available == 0 {
            // Saturated pools still serve; only shutdown is unhealthy.
            (true, format!("Lock pool saturated ({capacity} keys in flight)"))
        } else {
            (true, "OK".to_owned())
        };

        HealthReport {
            success,
            status,
            hit_rate: stats.hit_rate(),
            pool_capacity: capacity,
            pool_available: available,
            pool_low_water_mark: self.pool.low_water_mark(),
            active_keys,
            cached_entries: self.store.len(),
            stats,
        }
    }

    /// Closes the lock pool so waiting and future requests are rejected, then
    /// logs a final summary. In-flight requests finish normally.
    pub fn shutdown(&self) {
        self.pool.close();
        info!("cache coordinator shutting down");
        self.log_summary();
    }

    fn log_summary(&self) {
        let s = self.stats.snapshot();
        info!(
            requests = s.requests,
            hits = s.hits,
            misses = s.misses,
            hit_rate = s.hit_rate(),
            stores = s.stores,
            evictions = s.evictions,
            rejections = s.rejections(),
            pool_available = self.pool.available(),
            pool_capacity = self.pool.capacity(),
            pool_low_water = self.pool.low_water_mark(),
            active_keys = self.registry.len(),
            "cache stats"
        );
    }
}

/// One registrant's hold on a key's pooled lock.
///
/// Dropping it leaves the registry and, for the last holder, returns the lock
/// to the pool.
struct Reservation<'c> {
    coordinator: &'c CoalescingCoordinator,
    key: CacheKey,
    lock: Arc<PooledLock>,
}

impl<'c> Reservation<'c> {
    fn new(coordinator: &'c CoalescingCoordinator, key: CacheKey, lock: Arc<PooledLock>) -> Self {
        Self {
            coordinator,
            key,
            lock,
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.coordinator.registry.leave(&self.key) {
            debug_assert_eq!(lock.id(), self.lock.id());
            self.coordinator.return_lock(lock);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::store::MemoryStore;
    use crate::http::Response;

    struct Echo {
        calls: AtomicUsize,
        status: StatusCode,
    }

    impl Echo {
        fn new(status: StatusCode) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                status,
            }
        }
    }

    impl Downstream for Echo {
        fn call<'a>(
            &'a self,
            request: &'a Request,
            response: &'a mut dyn ResponseWriter,
        ) -> BoxFuture<'a, Result<(), BoxError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                response.set_status(self.status);
                response.set_header("Content-Type", "text/plain");
                response.write(format!("echo {}", request.path()).as_bytes())?;
                Ok::<(), BoxError>(())
            })
        }
    }

    fn coordinator() -> CoalescingCoordinator {
        let config = CacheConfig {
            pool_capacity: 2,
            lock_timeout_ms: 200,
            ..CacheConfig::default()
        };
        CoalescingCoordinator::new(&config, Arc::new(MemoryStore::new(16))).unwrap()
    }

    fn request(method: &str, target: &str) -> Request {
        let raw = format!("{method} {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        Request::parse(raw.as_bytes()).unwrap().0
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let coordinator = coordinator();
        let downstream = Echo::new(StatusCode::Ok);

        let mut first = Response::default();
        let outcome = coordinator
            .handle(&request("GET", "/a"), &mut first, &downstream)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Miss { stored: true });
        assert_eq!(first.headers().get("x-cache"), Some("MISS"));

        let mut second = Response::default();
        let outcome = coordinator
            .handle(&request("GET", "/a"), &mut second, &downstream)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Hit(ReplayMode::AsStored));
        assert_eq!(second.headers().get("x-cache"), Some("HIT"));
        assert_eq!(second.body_ref(), first.body_ref());
        assert_eq!(downstream.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.pool().available(), 2);
        assert!(coordinator.registry().is_empty());
    }

    #[tokio::test]
    async fn post_bypasses_cache() {
        let coordinator = coordinator();
        let downstream = Echo::new(StatusCode::Ok);
        for _ in 0..2 {
            let mut response = Response::default();
            let outcome = coordinator
                .handle(&request("POST", "/a"), &mut response, &downstream)
                .await
                .unwrap();
            assert_eq!(outcome, Outcome::Bypassed);
            assert!(!response.headers().contains("x-cache"));
        }
        assert_eq!(downstream.calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.stats().snapshot().bypassed, 2);
        assert_eq!(coordinator.pool().low_water_mark(), 2);
    }

    #[tokio::test]
    async fn error_status_not_stored() {
        let coordinator = coordinator();
        let downstream = Echo::new(StatusCode::InternalServerError);
        for _ in 0..2 {
            let mut response = Response::default();
            let outcome = coordinator
                .handle(&request("GET", "/boom"), &mut response, &downstream)
                .await
                .unwrap();
            assert_eq!(outcome, Outcome::Miss { stored: false });
            assert_eq!(response.status(), StatusCode::InternalServerError);
        }
        assert_eq!(downstream.calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.store().len(), 0);
    }

    #[tokio::test]
    async fn downstream_error_propagates_after_teardown() {
        let coordinator = coordinator();
        let failing = downstream_fn(|_, _| Box::pin(async { Err::<(), BoxError>("backend unavailable".into()) }));

        let mut response = Response::default();
        let err = coordinator
            .handle(&request("GET", "/fail"), &mut response, &failing)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "backend unavailable");
        assert_eq!(coordinator.pool().available(), 2);
        assert!(coordinator.registry().is_empty());
        assert_eq!(coordinator.store().len(), 0);
    }

    #[tokio::test]
    async fn health_reflects_pool_and_counters() {
        let coordinator = coordinator();
        let downstream = Echo::new(StatusCode::Ok);
        let mut response = Response::default();
        coordinator
            .handle(&request("GET", "/h"), &mut response, &downstream)
            .await
            .unwrap();

        let health = coordinator.health();
        assert!(health.success);
        assert_eq!(health.status, "OK");
        assert_eq!(health.pool_capacity, 2);
        assert_eq!(health.pool_available, 2);
        assert_eq!(health.pool_low_water_mark, 1);
        assert_eq!(health.active_keys, 0);
        assert_eq!(health.cached_entries, 1);
        assert_eq!(health.stats.misses, 1);

        coordinator.shutdown();
        assert!(!coordinator.health().success);
    }

    #[tokio::test]
    async fn saturated_pool_is_still_healthy() {
        let coordinator = coordinator();
        let a = coordinator.pool().borrow(Duration::from_millis(10)).await.unwrap();
        let b = coordinator.pool().borrow(Duration::from_millis(10)).await.unwrap();

        let health = coordinator.health();
        assert!(health.success);
        assert_eq!(health.pool_available, 0);
        assert_eq!(health.status, "Lock pool saturated (2 keys in flight)");

        coordinator.pool().release(a);
        coordinator.pool().release(b);
        assert_eq!(coordinator.health().status, "OK");
    }

    #[tokio::test]
    async fn shutdown_rejects_new_keys() {
        let coordinator = coordinator();
        coordinator.shutdown();
        let downstream = Echo::new(StatusCode::Ok);
        let mut response = Response::default();
        let outcome = coordinator
            .handle(&request("GET", "/late"), &mut response, &downstream)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Rejected(Rejection::PoolExhausted));
        assert_eq!(response.status(), StatusCode::TooManyRequests);
        assert_eq!(downstream.calls.load(Ordering::SeqCst), 0);
    }
}
