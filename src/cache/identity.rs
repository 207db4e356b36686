//! Caller identity extraction from a credential header.
//!
//! Each registered scheme (`Bearer`, `Basic`, ...) owns a regex with one
//! capture group. A header that names an unknown scheme, or that does not
//! match its scheme's pattern, yields no identity: such callers share the
//! anonymous bucket rather than being rejected here.

use regex::Regex;
use tracing::debug;

use crate::config::{CacheConfig, ConfigError, IdentityScheme};
use crate::http::Headers;

/// An authenticated caller: the scheme its credential matched under, and
/// the token captured by that scheme's pattern.
///
/// The scheme is part of the identity, so `Bearer X` and `Basic X` are
/// different callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    scheme: String,
    token: String,
}

impl CallerIdentity {
    /// Scheme name, lowercased.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

#[derive(Debug, Clone)]
struct CompiledScheme {
    scheme: String,
    pattern: Regex,
}

/// Scheme-keyed caller identity extractor.
///
/// # Examples
///
/// ```
/// use rttp_cache::cache::IdentityExtractor;
/// use rttp_cache::http::Headers;
///
/// let extractor = IdentityExtractor::new("Authorization")
///     .with_scheme("Token", r"^Token\s+(\w+)$")
///     .unwrap();
///
/// let mut headers = Headers::new();
/// headers.insert("Authorization", "token abc123");
/// assert_eq!(extractor.extract(&headers), None); // regex is case-sensitive
///
/// let mut headers = Headers::new();
/// headers.insert("Authorization", "Token abc123");
/// let caller = extractor.extract(&headers).unwrap();
/// assert_eq!(caller.scheme(), "token");
/// assert_eq!(caller.token(), "abc123");
/// ```
#[derive(Debug, Clone)]
pub struct IdentityExtractor {
    header: String,
    schemes: Vec<CompiledScheme>,
}

impl IdentityExtractor {
    /// Creates an extractor reading `header` with no schemes registered.
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            schemes: Vec::new(),
        }
    }

    /// Builds the extractor described by `config`.
    pub fn from_config(config: &CacheConfig) -> Result<Self, ConfigError> {
        config
            .identity_schemes
            .iter()
            .try_fold(Self::new(&config.credential_header), |extractor, s| {
                let IdentityScheme { scheme, pattern } = s;
                extractor.with_scheme(scheme, pattern)
            })
    }

    /// Registers a scheme. A later registration for the same scheme wins.
    ///
    /// # Errors
    ///
    /// [`ConfigError::IdentityPattern`] if the regex does not compile, and
    /// [`ConfigError::Invalid`] if it does not have exactly one capture group.
    pub fn with_scheme(mut self, scheme: &str, pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|source| ConfigError::IdentityPattern {
            scheme: scheme.to_owned(),
            source,
        })?;
        // captures_len counts the implicit whole-match group
        if regex.captures_len() != 2 {
            return Err(ConfigError::Invalid {
                field: "identity_schemes",
                reason: format!(
                    "pattern for scheme `{scheme}` must have exactly one capture group"
                ),
            });
        }
        self.schemes.retain(|s| !s.scheme.eq_ignore_ascii_case(scheme));
        self.schemes.push(CompiledScheme {
            scheme: scheme.to_owned(),
            pattern: regex,
        });
        Ok(self)
    }

    /// Returns the caller identity, or `None` for anonymous or malformed
    /// credentials.
    pub fn extract(&self, headers: &Headers) -> Option<CallerIdentity> {
        let value = headers.get(&self.header)?.trim();
        let scheme_name = value.split_whitespace().next()?;
        let scheme = self
            .schemes
            .iter()
            .find(|s| s.scheme.eq_ignore_ascii_case(scheme_name))?;

        let token = scheme
            .pattern
            .captures(value)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .filter(|token| !token.is_empty());

        if token.is_none() {
            debug!(scheme = %scheme.scheme, "credential did not match scheme pattern; treating caller as anonymous");
        }
        token.map(|token| CallerIdentity {
            scheme: scheme.scheme.to_ascii_lowercase(),
            token: token.to_owned(),
        })
    }
}
