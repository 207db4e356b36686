//! Cache coordinator configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config:
//!
//! ```
//! use rttp_cache::config::CacheConfig;
//!
//! let config = CacheConfig::from_json_str(r#"{ "pool_capacity": 8, "lock_timeout_ms": 500 }"#).unwrap();
//! assert_eq!(config.pool_capacity, 8);
//! assert_eq!(config.min_compress_size, 2048);
//! assert_eq!(config.cacheable_methods, vec!["GET".to_string()]);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::Method;

/// Errors raised while loading or validating a [`CacheConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse cache config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("identity pattern for scheme `{scheme}` is not a valid regex: {source}")]
    IdentityPattern {
        scheme: String,
        #[source]
        source: regex::Error,
    },
}

/// One credential scheme the identity extractor understands.
///
/// `pattern` runs against the full credential header value and must have
/// exactly one capture group: the caller identity token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityScheme {
    pub scheme: String,
    pub pattern: String,
}

impl IdentityScheme {
    pub fn new(scheme: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            pattern: pattern.into(),
        }
    }
}

/// Options recognized by the cache coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Methods eligible for caching; anything else bypasses the cache.
    pub cacheable_methods: Vec<String>,
    /// Upper bound on both the pool borrow wait and the per-key mutex wait.
    pub lock_timeout_ms: u64,
    /// Number of pooled locks, i.e. distinct keys that may be computed at once.
    pub pool_capacity: usize,
    /// Content types worth gzipping. `text/*` style entries match a whole
    /// top-level type.
    pub compressible_types: Vec<String>,
    /// Bodies smaller than this are stored uncompressed.
    pub min_compress_size: usize,
    /// Log a stats summary every N requests; `0` disables it.
    pub stats_log_frequency: u64,
    /// Header carrying caller credentials.
    pub credential_header: String,
    pub identity_schemes: Vec<IdentityScheme>,
    /// Response header marking the outcome as `HIT` or `MISS`.
    pub outcome_header: String,
    /// Captures larger than this are dropped instead of stored.
    pub max_entry_size: usize,
    /// Entry bound for [`MemoryStore`](crate::cache::MemoryStore).
    pub store_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cacheable_methods: vec!["GET".to_owned()],
            lock_timeout_ms: 240_000,
            pool_capacity: 64,
            compressible_types: [
                "text/*",
                "application/json",
                "application/xml",
                "application/javascript",
                "application/csv",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            min_compress_size: 2048,
            stats_log_frequency: 500,
            credential_header: "Authorization".to_owned(),
            identity_schemes: vec![
                IdentityScheme::new("Bearer", r"^Bearer\s+([A-Za-z0-9._~+/-]+=*)$"),
                IdentityScheme::new("Basic", r"^Basic\s+([A-Za-z0-9+/]+=*)$"),
            ],
            outcome_header: "X-Cache".to_owned(),
            max_entry_size: 8 * 1024 * 1024,
            store_capacity: 1024,
        }
    }
}

impl CacheConfig {
    /// Parses a JSON document and validates the result.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed JSON, [`ConfigError::Invalid`] for
    /// out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the coordinator relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "pool_capacity",
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.store_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "store_capacity",
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.outcome_header.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "outcome_header",
                reason: "must not be empty".to_owned(),
            });
        }
        if self.credential_header.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "credential_header",
                reason: "must not be empty".to_owned(),
            });
        }
        Ok(())
    }

    /// The lock-wait timeout as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Parsed cacheable methods, deduplicated.
    pub fn methods(&self) -> Vec<Method> {
        let mut methods: Vec<Method> = Vec::with_capacity(self.cacheable_methods.len());
        for raw in &self.cacheable_methods {
            let Ok(method) = raw.parse::<Method>();
            if !methods.contains(&method) {
                methods.push(method);
            }
        }
        methods
    }
}
