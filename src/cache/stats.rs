//! Process-wide counters and the health report built from them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters shared by every request.
#[derive(Debug, Default)]
pub struct CacheStats {
    requests: AtomicU64,
    bypassed: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    store_failures: AtomicU64,
    replay_failures: AtomicU64,
    evictions: AtomicU64,
    joins: AtomicU64,
    borrows: AtomicU64,
    returns: AtomicU64,
    borrow_failures: AtomicU64,
    lock_timeouts: AtomicU64,
}

macro_rules! counters {
    ($($record:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $record(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    counters! {
        record_bypass => bypassed,
        record_hit => hits,
        record_miss => misses,
        record_store => stores,
        record_store_failure => store_failures,
        record_replay_failure => replay_failures,
        record_eviction => evictions,
        record_join => joins,
        record_borrow => borrows,
        record_return => returns,
        record_borrow_failure => borrow_failures,
        record_lock_timeout => lock_timeouts,
    }

    /// Counts a request; returns `true` when it lands on a summary-logging
    /// boundary for `frequency` (`0` never logs).
    pub fn record_request(&self, frequency: u64) -> bool {
        let n = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        frequency > 0 && n % frequency == 0
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            requests: load(&self.requests),
            bypassed: load(&self.bypassed),
            hits: load(&self.hits),
            misses: load(&self.misses),
            stores: load(&self.stores),
            store_failures: load(&self.store_failures),
            replay_failures: load(&self.replay_failures),
            evictions: load(&self.evictions),
            joins: load(&self.joins),
            borrows: load(&self.borrows),
            returns: load(&self.returns),
            borrow_failures: load(&self.borrow_failures),
            lock_timeouts: load(&self.lock_timeouts),
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub bypassed: u64,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub store_failures: u64,
    pub replay_failures: u64,
    pub evictions: u64,
    pub joins: u64,
    pub borrows: u64,
    pub returns: u64,
    pub borrow_failures: u64,
    pub lock_timeouts: u64,
}

impl StatsSnapshot {
    /// `hits / (hits + misses)`, or `0.0` before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }

    /// Requests turned away with a 429.
    pub fn rejections(&self) -> u64 {
        self.borrow_failures + self.lock_timeouts
    }
}

/// Diagnostic surface polled by operators.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub success: bool,
    pub status: String,
    pub hit_rate: f64,
    pub pool_capacity: usize,
    pub pool_available: usize,
    pub pool_low_water_mark: usize,
    pub active_keys: usize,
    pub cached_entries: usize,
    pub stats: StatsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_from_counters() {
        let stats = CacheStats::new();
        assert_eq!(stats.snapshot().hit_rate(), 0.0);
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        assert!((stats.snapshot().hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn log_boundary_every_n_requests() {
        let stats = CacheStats::new();
        let boundaries: Vec<bool> = (0..6).map(|_| stats.record_request(3)).collect();
        assert_eq!(boundaries, vec![false, false, true, false, false, true]);
        assert!(!(0..10).any(|_| stats.record_request(0)));
        assert_eq!(stats.snapshot().requests, 16);
    }

    #[test]
    fn rejections_sum_both_timeouts() {
        let stats = CacheStats::new();
        stats.record_borrow_failure();
        stats.record_lock_timeout();
        stats.record_lock_timeout();
        assert_eq!(stats.snapshot().rejections(), 3);
    }

    #[test]
    fn snapshot_serializes() {
        let json = serde_json::to_value(StatsSnapshot::default()).unwrap();
        assert_eq!(json["hits"], 0);
        assert!(json.get("lock_timeouts").is_some());
    }
}
