//! Body encodings for stored entries.

use std::fmt;
use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::config::CacheConfig;
use crate::http::Headers;

/// How a cached body is encoded at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentEncoding {
    Identity,
    Gzip,
}

impl ContentEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
        }
    }

    /// Reads `Content-Encoding`. Anything other than gzip (or its `x-gzip`
    /// alias) is treated as opaque identity bytes.
    pub fn from_headers(headers: &Headers) -> Self {
        match headers.get("content-encoding").map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip") => {
                Self::Gzip
            }
            _ => Self::Identity,
        }
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides which captured bodies get compressed before storage.
#[derive(Debug, Clone)]
pub struct CompressionPolicy {
    types: Vec<String>,
    min_size: usize,
}

impl CompressionPolicy {
    pub fn new(types: Vec<String>, min_size: usize) -> Self {
        let types = types
            .into_iter()
            .map(|t| t.trim().to_ascii_lowercase())
            .collect();
        Self { types, min_size }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.compressible_types.clone(), config.min_compress_size)
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// `true` when a body of `len` bytes typed `content_type` should be gzipped.
    pub fn is_eligible(&self, content_type: Option<&str>, len: usize) -> bool {
        len >= self.min_size && content_type.is_some_and(|ct| self.is_compressible_type(ct))
    }

    fn is_compressible_type(&self, content_type: &str) -> bool {
        let media = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if media.ends_with("+json") || media.ends_with("+xml") {
            return true;
        }
        self.types.iter().any(|t| match t.strip_suffix("/*") {
            Some(top) => media
                .split_once('/')
                .is_some_and(|(media_top, _)| media_top == top),
            None => *t == media,
        })
    }
}

/// Gzips `bytes` at the default compression level.
pub fn gzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Inflates a gzip body.
pub fn gunzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() * 3);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// `true` when the request's `Accept-Encoding` admits gzip.
///
/// An explicit `gzip;q=0` refuses it even if a wildcard would allow it.
pub fn accepts_gzip(request_headers: &Headers) -> bool {
    let mut wildcard = false;
    for value in request_headers.get_all("accept-encoding") {
        for coding in value.split(',') {
            let mut parts = coding.split(';');
            let name = parts.next().unwrap_or_default().trim();
            let refused = parts
                .filter_map(|p| p.trim().strip_prefix("q="))
                .any(|q| q.trim().parse::<f32>().is_ok_and(|q| q <= 0.0));
            if name.eq_ignore_ascii_case("gzip") || name.eq_ignore_ascii_case("x-gzip") {
                return !refused;
            }
            if name == "*" {
                wildcard = !refused;
            }
        }
    }
    wildcard
}
