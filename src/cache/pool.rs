//! Bounded pool of reusable per-key mutexes.
//!
//! The pool is the admission-control valve: it holds exactly `capacity`
//! locks for the life of the process, and a key needs one to be computed.
//! When every lock is checked out, new distinct keys wait up to the borrow
//! timeout and are then rejected.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

/// A pre-allocated mutex that serializes work for one key at a time.
#[derive(Debug)]
pub struct PooledLock {
    id: usize,
    mutex: Mutex<()>,
    /// Registrants currently sharing this lock. Only touched by the
    /// in-flight registry while it holds the key's map shard.
    holds: AtomicUsize,
    checked_out: AtomicBool,
}

impl PooledLock {
    fn new(id: usize) -> Self {
        Self {
            id,
            mutex: Mutex::new(()),
            holds: AtomicUsize::new(0),
            checked_out: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn hold_count(&self) -> usize {
        self.holds.load(Ordering::Acquire)
    }

    pub(crate) fn mutex(&self) -> &Mutex<()> {
        &self.mutex
    }

    pub(crate) fn holds(&self) -> &AtomicUsize {
        &self.holds
    }
}

/// Fixed-capacity lock pool.
///
/// `borrow` waits on a semaphore whose permits mirror the idle list, so a
/// permit always corresponds to a lock sitting in `idle`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rttp_cache::cache::LockPool;
///
/// # tokio_test_block_on(async {
/// let pool = LockPool::new(1);
/// let lock = pool.borrow(Duration::from_millis(10)).await.unwrap();
/// assert!(pool.borrow(Duration::from_millis(10)).await.is_none());
/// pool.release(lock);
/// assert_eq!(pool.available(), 1);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug)]
pub struct LockPool {
    capacity: usize,
    idle: SyncMutex<Vec<Arc<PooledLock>>>,
    permits: Semaphore,
    low_water: AtomicUsize,
}

impl LockPool {
    /// Pre-allocates `capacity` locks.
    pub fn new(capacity: usize) -> Self {
        let idle = (0..capacity)
            .rev()
            .map(|id| Arc::new(PooledLock::new(id)))
            .collect();
        Self {
            capacity,
            idle: SyncMutex::new(idle),
            permits: Semaphore::new(capacity),
            low_water: AtomicUsize::new(capacity),
        }
    }

    /// Waits up to `timeout` for an idle lock.
    ///
    /// Returns `None` on timeout or after [`close`](Self::close); never errors.
    pub async fn borrow(&self, timeout: Duration) -> Option<Arc<PooledLock>> {
        let permit = match tokio::time::timeout(timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                debug!("lock pool closed; refusing borrow");
                return None;
            }
            Err(_elapsed) => return None,
        };
        // The lock now travels without its permit; release() re-adds one.
        permit.forget();

        let (lock, remaining) = {
            let mut idle = self.idle.lock();
            let lock = idle.pop();
            (lock, idle.len())
        };
        let Some(lock) = lock else {
            // Unreachable while permits mirror `idle`; give the permit back.
            warn!("lock pool permit granted with no idle lock");
            self.permits.add_permits(1);
            return None;
        };

        lock.checked_out.store(true, Ordering::Release);
        self.low_water.fetch_min(remaining, Ordering::AcqRel);
        Some(lock)
    }

    /// Returns a lock to the pool. Non-blocking.
    ///
    /// Releasing a lock that is not checked out is logged and ignored, so the
    /// pool can never grow past its capacity.
    pub fn release(&self, lock: Arc<PooledLock>) {
        if !lock.checked_out.swap(false, Ordering::AcqRel) {
            warn!(lock_id = lock.id, "ignoring release of a lock that is not checked out");
            return;
        }
        {
            let mut idle = self.idle.lock();
            if idle.len() >= self.capacity {
                warn!(lock_id = lock.id, "lock pool full; dropping released lock");
                return;
            }
            idle.push(lock);
        }
        self.permits.add_permits(1);
    }

    /// Closes the pool: pending and future borrows return `None`.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Locks currently idle in the pool.
    pub fn available(&self) -> usize {
        self.idle.lock().len()
    }

    /// Fewest idle locks ever observed.
    pub fn low_water_mark(&self) -> usize {
        self.low_water.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn borrow_until_exhausted() {
        let pool = LockPool::new(2);
        let a = pool.borrow(SHORT).await.unwrap();
        let b = pool.borrow(SHORT).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.available(), 0);
        assert!(pool.borrow(SHORT).await.is_none());
        assert_eq!(pool.low_water_mark(), 0);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.low_water_mark(), 0);
    }

    #[tokio::test]
    async fn double_release_is_ignored() {
        let pool = LockPool::new(1);
        let lock = pool.borrow(SHORT).await.unwrap();
        pool.release(Arc::clone(&lock));
        pool.release(lock);
        assert_eq!(pool.available(), 1);

        let first = pool.borrow(SHORT).await;
        assert!(first.is_some());
        assert!(pool.borrow(SHORT).await.is_none());
    }

    #[tokio::test]
    async fn waiting_borrower_wakes_on_release() {
        let pool = Arc::new(LockPool::new(1));
        let held = pool.borrow(SHORT).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.borrow(Duration::from_secs(5)).await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(held);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn close_fails_borrows_fast() {
        let pool = LockPool::new(1);
        pool.close();
        assert!(pool.is_closed());
        assert!(pool.borrow(Duration::from_secs(60)).await.is_none());
    }
}
