//! Writing a stored entry back out on a cache hit.

use std::io;

use tracing::error;

use super::codec::{self, ContentEncoding};
use super::key::CacheKey;
use super::store::CachedEntry;
use crate::http::{Headers, ResponseWriter};

/// How a hit was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Stored bytes sent unchanged (identity, or gzip to a gzip-capable client).
    AsStored,
    /// Gzip entry inflated for a client without gzip support.
    Decompressed,
    /// Gzip entry failed to inflate; raw stored bytes were sent.
    Degraded,
}

/// Replays `entry` into `response` for a client whose request headers are
/// `request_headers`.
///
/// A corrupt gzip entry never fails the request: the stored bytes go out
/// unchanged and the failure is logged with the key, size and headers.
///
/// # Errors
///
/// Only client write failures.
pub fn replay(
    key: &CacheKey,
    entry: &CachedEntry,
    request_headers: &Headers,
    response: &mut dyn ResponseWriter,
) -> io::Result<ReplayMode> {
    response.set_status(entry.metadata.status);
    for (name, value) in entry.headers.iter() {
        response.headers_mut().insert(name, value);
    }

    if entry.encoding == ContentEncoding::Identity {
        response.write(&entry.body)?;
        return Ok(ReplayMode::AsStored);
    }

    // Every representation of a gzip entry carries the Vary.
    merge_vary(response.headers_mut());

    if codec::accepts_gzip(request_headers) {
        response.set_header("Content-Encoding", ContentEncoding::Gzip.as_str());
        response.write(&entry.body)?;
        return Ok(ReplayMode::AsStored);
    }

    match codec::gunzip(&entry.body) {
        Ok(plain) => {
            response.write(&plain)?;
            Ok(ReplayMode::Decompressed)
        }
        Err(err) => {
            error!(
                key = %key,
                stored_size = entry.stored_size(),
                original_size = entry.metadata.original_size,
                headers = ?entry.headers,
                error = %err,
                "stored entry failed to decompress; sending raw bytes"
            );
            response.write(&entry.body)?;
            Ok(ReplayMode::Degraded)
        }
    }
}

/// Adds `Accept-Encoding` to `Vary` without clobbering what is there.
/// A wildcard `Vary` already covers it.
fn merge_vary(headers: &mut Headers) {
    let existing: Vec<String> = headers
        .get_all("vary")
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect();

    if existing.iter().any(|v| v == "*" || v.eq_ignore_ascii_case("accept-encoding")) {
        return;
    }
    if existing.is_empty() {
        headers.set("Vary", "Accept-Encoding");
    } else {
        headers.set("Vary", format!("{}, Accept-Encoding", existing.join(", ")));
    }
}
