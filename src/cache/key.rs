//! Request fingerprinting.
//!
//! A [`CacheKey`] is the SHA-256 of, in order: caller scheme and token (when
//! present), uppercased method, path, query pairs sorted by name, and the
//! coarse [`AcceptBucket`]. Every field is length-prefixed so adjacent fields
//! cannot bleed into each other.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::identity::IdentityExtractor;
use crate::config::{CacheConfig, ConfigError};
use crate::http::{Headers, Method, Request};

/// Fixed-length hex digest identifying a cacheable request.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Length of the hex digest.
    pub const LEN: usize = 64;

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix keeps log lines readable
        write!(f, "CacheKey({}…)", &self.0[..12])
    }
}

/// Coarse classification of the `Accept` header.
///
/// Wildcards and quality parameters never split a family: `application/json`
/// and `application/json;q=0.9, */*;q=0.1` land in the same bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AcceptBucket {
    Json,
    Csv,
    Xml,
    /// Header absent, or nothing but wildcards.
    Any,
    /// An unrecognized concrete `type/subtype`, lowercased.
    Other(String),
}

impl AcceptBucket {
    /// Classifies an `Accept` header value.
    ///
    /// The first recognized family by preference (highest `q`, then header
    /// order) wins; failing that, the most preferred concrete media type.
    pub fn classify(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return Self::Any;
        };

        let mut ranges: Vec<(usize, f32, String)> = accept
            .split(',')
            .enumerate()
            .filter_map(|(position, range)| {
                let mut parts = range.split(';');
                let media = parts.next()?.trim().to_ascii_lowercase();
                if media.is_empty() {
                    return None;
                }
                let quality = parts
                    .filter_map(|p| p.trim().strip_prefix("q="))
                    .find_map(|q| q.trim().parse::<f32>().ok())
                    .unwrap_or(1.0);
                (quality > 0.0).then_some((position, quality, media))
            })
            .collect();

        // Preference order: quality descending, then position
        ranges.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        if let Some(family) = ranges.iter().find_map(|(_, _, media)| Self::family(media)) {
            return family;
        }

        ranges
            .into_iter()
            .map(|(_, _, media)| media)
            .find(|media| !media.ends_with("/*") && media != "*")
            .map_or(Self::Any, Self::Other)
    }

    fn family(media: &str) -> Option<Self> {
        let (kind, subtype) = media.split_once('/')?;
        if kind == "*" || subtype == "*" {
            return None;
        }
        match subtype {
            "json" | "x-json" | "x-ndjson" => Some(Self::Json),
            "csv" | "x-csv" | "comma-separated-values" => Some(Self::Csv),
            "xml" => Some(Self::Xml),
            s if s.ends_with("+json") => Some(Self::Json),
            s if s.ends_with("+xml") => Some(Self::Xml),
            _ => None,
        }
    }

    /// The token hashed into the key.
    pub fn token(&self) -> &str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Xml => "xml",
            Self::Any => "*/*",
            Self::Other(media) => media,
        }
    }
}

/// Pure `request → key` function.
///
/// Returns `None` ("do not cache") for methods outside the configured set.
#[derive(Debug, Clone)]
pub struct KeyFingerprinter {
    methods: Vec<Method>,
    identity: IdentityExtractor,
}

impl KeyFingerprinter {
    pub fn new(methods: Vec<Method>, identity: IdentityExtractor) -> Self {
        Self { methods, identity }
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.methods(),
            IdentityExtractor::from_config(config)?,
        ))
    }

    pub fn is_cacheable(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    /// Computes the cache key for `request`, or `None` when it must bypass the cache.
    pub fn fingerprint(&self, request: &Request) -> Option<CacheKey> {
        if !self.is_cacheable(request.method()) {
            return None;
        }
        Some(self.digest(request))
    }

    fn digest(&self, request: &Request) -> CacheKey {
        let mut hasher = Sha256::new();

        // An anonymous caller contributes nothing; all of them share one bucket.
        if let Some(identity) = self.identity.extract(request.headers()) {
            hasher.update(b"I");
            update_field(&mut hasher, identity.scheme().as_bytes());
            update_field(&mut hasher, identity.token().as_bytes());
        }

        update_field(&mut hasher, request.method().as_str().as_bytes());
        update_field(&mut hasher, request.path().as_bytes());

        let mut pairs: Vec<&(String, String)> = request.query_pairs().iter().collect();
        // Stable: repeated names keep their wire order.
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        hasher.update((pairs.len() as u64).to_le_bytes());
        for (name, value) in pairs {
            update_field(&mut hasher, format!("{name}={value}").as_bytes());
        }

        let bucket = AcceptBucket::classify(accept_header(request.headers()));
        update_field(&mut hasher, bucket.token().as_bytes());

        CacheKey(hex::encode(hasher.finalize()).into())
    }
}

fn accept_header(headers: &Headers) -> Option<&str> {
    headers.get("accept").filter(|v| !v.trim().is_empty())
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
