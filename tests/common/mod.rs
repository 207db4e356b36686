#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rttp_cache::cache::{BoxError, BoxFuture, CoalescingCoordinator, Downstream, MemoryStore};
use rttp_cache::{CacheConfig, Request, ResponseWriter, StatusCode};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn coordinator(pool_capacity: usize, lock_timeout_ms: u64) -> Arc<CoalescingCoordinator> {
    coordinator_with(CacheConfig {
        pool_capacity,
        lock_timeout_ms,
        ..CacheConfig::default()
    })
}

pub fn coordinator_with(config: CacheConfig) -> Arc<CoalescingCoordinator> {
    init_tracing();
    let store = Arc::new(MemoryStore::new(config.store_capacity));
    Arc::new(CoalescingCoordinator::new(&config, store).unwrap())
}

pub fn get(target: &str) -> Request {
    request(target, &[])
}

pub fn request(target: &str, headers: &[(&str, &str)]) -> Request {
    let mut raw = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n");
    for (name, value) in headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str("\r\n");
    Request::parse(raw.as_bytes()).unwrap().0
}

/// A slow backend that counts calls and tracks its own peak concurrency.
pub struct SlowBackend {
    pub delay: Duration,
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    pub calls: AtomicUsize,
    running: AtomicUsize,
    pub peak: AtomicUsize,
}

impl SlowBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            status: StatusCode::Ok,
            content_type: "text/plain",
            body: b"computed".to_vec(),
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Downstream for SlowBackend {
    fn call<'a>(
        &'a self,
        _request: &'a Request,
        response: &'a mut dyn ResponseWriter,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;

            self.running.fetch_sub(1, Ordering::SeqCst);
            response.set_status(self.status);
            response.set_header("Content-Type", self.content_type);
            response.write(&self.body)?;
            Ok::<(), BoxError>(())
        })
    }
}
