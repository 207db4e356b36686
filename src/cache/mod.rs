//! Request-coalescing response cache.
//!
//! [`CoalescingCoordinator`] sits in front of an expensive handler and makes
//! sure each distinct request shape is computed at most once at a time.
//! Concurrency across distinct keys is bounded by a [`LockPool`]: once every
//! pooled lock is checked out, further distinct keys are turned away with
//! `429 Too Many Requests` instead of piling up.
//!
//! ```text
//! request ─▶ KeyFingerprinter ─▶ InFlightRegistry/LockPool ─▶ per-key mutex
//!                                                                 │
//!                    hit ◀── CacheStore ──▶ miss ─▶ ResponseCapture ─▶ downstream
//! ```

pub mod capture;
pub mod codec;
pub mod coordinator;
pub mod identity;
pub mod inflight;
pub mod key;
pub mod pool;
pub mod replay;
pub mod stats;
pub mod store;

pub use capture::{CaptureError, ResponseCapture};
pub use codec::{CompressionPolicy, ContentEncoding};
pub use coordinator::{
    BoxError, BoxFuture, CoalescingCoordinator, Downstream, Outcome, Rejection, downstream_fn,
};
pub use identity::{CallerIdentity, IdentityExtractor};
pub use inflight::InFlightRegistry;
pub use key::{AcceptBucket, CacheKey, KeyFingerprinter};
pub use pool::{LockPool, PooledLock};
pub use replay::ReplayMode;
pub use stats::{CacheStats, HealthReport, StatsSnapshot};
pub use store::{CacheStore, CachedEntry, EntryMetadata, EvictionListener, MemoryStore};
