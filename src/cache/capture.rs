//! Tee from the downstream handler to the client and a capture buffer.
//!
//! The client always gets every byte first. The buffer is best-effort: once
//! it fails it stops buffering and remembers why, and the response is simply
//! not stored.

use std::collections::TryReserveError;
use std::io;
use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

use super::codec::{self, CompressionPolicy, ContentEncoding};
use super::store::{CachedEntry, EntryMetadata};
use crate::http::{Headers, ResponseWriter, StatusCode};

/// Why a captured response could not become a cache entry.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("captured body exceeds the {limit}-byte entry limit")]
    LimitExceeded { limit: usize },

    #[error("could not grow capture buffer: {0}")]
    Reserve(#[from] TryReserveError),

    #[error("downstream sent an error response")]
    ErrorSent,

    #[error("client write failed: {0}")]
    ClientWrite(io::ErrorKind),

    #[error("failed to compress captured body: {0}")]
    Compress(#[source] io::Error),
}

/// Headers that describe the original transfer rather than the content.
const TRANSIENT_HEADERS: &[&str] = &["content-length", "connection", "transfer-encoding"];

#[derive(Debug)]
enum Buffer {
    Capturing(Vec<u8>),
    Failed(CaptureError),
}

/// A [`ResponseWriter`] decorator that copies the body into memory.
pub struct ResponseCapture<'a> {
    client: &'a mut dyn ResponseWriter,
    buffer: Buffer,
    limit: usize,
}

impl<'a> ResponseCapture<'a> {
    /// Wraps `client`; bodies beyond `limit` bytes are not captured.
    pub fn new(client: &'a mut dyn ResponseWriter, limit: usize) -> Self {
        Self {
            client,
            buffer: Buffer::Capturing(Vec::new()),
            limit,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.buffer, Buffer::Failed(_))
    }

    /// Bytes captured so far (zero once failed).
    pub fn captured_len(&self) -> usize {
        match &self.buffer {
            Buffer::Capturing(bytes) => bytes.len(),
            Buffer::Failed(_) => 0,
        }
    }

    fn capture(&mut self, chunk: &[u8]) {
        let Buffer::Capturing(bytes) = &mut self.buffer else {
            return;
        };
        let result = if bytes.len() + chunk.len() > self.limit {
            Err(CaptureError::LimitExceeded { limit: self.limit })
        } else {
            bytes
                .try_reserve(chunk.len())
                .map(|()| bytes.extend_from_slice(chunk))
                .map_err(CaptureError::from)
        };
        if let Err(err) = result {
            warn!(error = %err, "response capture failed; response will not be cached");
            self.buffer = Buffer::Failed(err);
        }
    }

    /// Turns the capture into a cache entry.
    ///
    /// Identity bodies eligible under `policy` are gzipped. A body the
    /// downstream already gzipped is kept as-is; other encodings are stored
    /// opaque with their `Content-Encoding` header preserved.
    ///
    /// # Errors
    ///
    /// The buffer's recorded failure, or [`CaptureError::Compress`].
    pub fn finish(
        self,
        policy: &CompressionPolicy,
        outcome_header: &str,
    ) -> Result<CachedEntry, CaptureError> {
        let bytes = match self.buffer {
            Buffer::Capturing(bytes) => bytes,
            Buffer::Failed(err) => return Err(err),
        };
        let client_headers = self.client.headers();
        let status = self.client.status();
        let original_size = bytes.len();

        let declared = client_headers
            .get("content-encoding")
            .map(str::trim)
            .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("identity"));
        let pre_gzipped = ContentEncoding::from_headers(client_headers) == ContentEncoding::Gzip;

        let (body, encoding) = if pre_gzipped {
            (bytes, ContentEncoding::Gzip)
        } else if declared.is_none()
            && policy.is_eligible(client_headers.get("content-type"), original_size)
        {
            let packed = codec::gzip(&bytes).map_err(CaptureError::Compress)?;
            (packed, ContentEncoding::Gzip)
        } else {
            (bytes, ContentEncoding::Identity)
        };

        let mut headers = Headers::with_capacity(client_headers.len());
        for (name, value) in client_headers.iter() {
            let transient = TRANSIENT_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
                || name.eq_ignore_ascii_case(outcome_header)
                || (name.eq_ignore_ascii_case("content-encoding") && declared.is_none_or(|_| pre_gzipped));
            if !transient {
                headers.insert(name, value);
            }
        }

        Ok(CachedEntry {
            headers,
            body: Bytes::from(body),
            encoding,
            metadata: EntryMetadata {
                status,
                original_size,
                stored_at: SystemTime::now(),
            },
        })
    }
}

impl ResponseWriter for ResponseCapture<'_> {
    fn status(&self) -> StatusCode {
        self.client.status()
    }

    fn set_status(&mut self, status: StatusCode) {
        self.client.set_status(status);
    }

    fn headers(&self) -> &Headers {
        self.client.headers()
    }

    fn headers_mut(&mut self) -> &mut Headers {
        self.client.headers_mut()
    }

    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        if let Err(err) = self.client.write(chunk) {
            // The client missed this chunk, so the buffer can no longer match
            // what was delivered.
            if !self.is_failed() {
                warn!(error = %err, "client write failed; response will not be cached");
                self.buffer = Buffer::Failed(CaptureError::ClientWrite(err.kind()));
            }
            return Err(err);
        }
        self.capture(chunk);
        Ok(())
    }

    fn send_error(&mut self, status: StatusCode, message: &str) -> io::Result<()> {
        self.buffer = Buffer::Failed(CaptureError::ErrorSent);
        self.client.send_error(status, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::http::Response;

    fn policy() -> CompressionPolicy {
        CompressionPolicy::from_config(&CacheConfig::default())
    }

    #[test]
    fn tees_to_client_and_buffer() {
        let mut client = Response::default();
        let mut capture = ResponseCapture::new(&mut client, 1024);
        capture.set_header("Content-Type", "text/plain");
        capture.write(b"hello ").unwrap();
        capture.write(b"world").unwrap();
        assert_eq!(capture.captured_len(), 11);

        let entry = capture.finish(&policy(), "X-Cache").unwrap();
        assert_eq!(entry.body.as_ref(), b"hello world");
        assert_eq!(entry.encoding, ContentEncoding::Identity);
        assert_eq!(client.body_ref(), b"hello world");
    }

    #[test]
    fn overflow_marks_failed_without_touching_client() {
        let mut client = Response::default();
        let mut capture = ResponseCapture::new(&mut client, 8);
        capture.write(b"12345").unwrap();
        capture.write(b"67890").unwrap();
        capture.write(b"more").unwrap();
        assert!(capture.is_failed());

        let err = capture.finish(&policy(), "X-Cache").unwrap_err();
        assert!(matches!(err, CaptureError::LimitExceeded { limit: 8 }));
        assert_eq!(client.body_ref(), b"1234567890more");
    }

    #[test]
    fn eligible_body_is_compressed() {
        let body = r#"{"id":1,"name":"widget"}"#.repeat(200);
        let mut client = Response::default();
        let mut capture = ResponseCapture::new(&mut client, usize::MAX);
        capture.set_header("Content-Type", "application/json");
        capture.set_header("X-Cache", "MISS");
        capture.set_header("Content-Length", "0");
        capture.write(body.as_bytes()).unwrap();

        let entry = capture.finish(&policy(), "X-Cache").unwrap();
        assert_eq!(entry.encoding, ContentEncoding::Gzip);
        assert_eq!(entry.metadata.original_size, body.len());
        assert_eq!(codec::gunzip(&entry.body).unwrap(), body.as_bytes());
        assert!(!entry.headers.contains("x-cache"));
        assert!(!entry.headers.contains("content-length"));
        assert_eq!(entry.headers.get("content-type"), Some("application/json"));
    }

    #[test]
    fn small_body_stays_identity() {
        let mut client = Response::default();
        let mut capture = ResponseCapture::new(&mut client, usize::MAX);
        capture.set_header("Content-Type", "application/json");
        capture.write(b"{}").unwrap();
        let entry = capture.finish(&policy(), "X-Cache").unwrap();
        assert_eq!(entry.encoding, ContentEncoding::Identity);
    }

    #[test]
    fn pre_gzipped_body_stored_as_is() {
        let raw = codec::gzip(b"already packed").unwrap();
        let mut client = Response::default();
        let mut capture = ResponseCapture::new(&mut client, usize::MAX);
        capture.set_header("Content-Type", "text/plain");
        capture.set_header("Content-Encoding", "gzip");
        capture.write(&raw).unwrap();

        let entry = capture.finish(&policy(), "X-Cache").unwrap();
        assert_eq!(entry.encoding, ContentEncoding::Gzip);
        assert_eq!(entry.body.as_ref(), raw.as_slice());
        assert!(!entry.headers.contains("content-encoding"));
    }

    #[test]
    fn foreign_encoding_kept_opaque() {
        let body = vec![b'x'; 4096];
        let mut client = Response::default();
        let mut capture = ResponseCapture::new(&mut client, usize::MAX);
        capture.set_header("Content-Type", "text/plain");
        capture.set_header("Content-Encoding", "br");
        capture.write(&body).unwrap();

        let entry = capture.finish(&policy(), "X-Cache").unwrap();
        assert_eq!(entry.encoding, ContentEncoding::Identity);
        assert_eq!(entry.headers.get("content-encoding"), Some("br"));
    }

    #[test]
    fn send_error_discards_capture() {
        let mut client = Response::default();
        let mut capture = ResponseCapture::new(&mut client, usize::MAX);
        capture.write(b"partial").unwrap();
        capture
            .send_error(StatusCode::BadGateway, "upstream failed")
            .unwrap();
        assert!(matches!(
            capture.finish(&policy(), "X-Cache"),
            Err(CaptureError::ErrorSent)
        ));
        assert_eq!(client.status(), StatusCode::BadGateway);
    }

    /// Fails the first write, then delegates.
    struct FlakyClient {
        inner: Response,
        fail_next: bool,
    }

    impl ResponseWriter for FlakyClient {
        fn status(&self) -> StatusCode {
            self.inner.status()
        }

        fn set_status(&mut self, status: StatusCode) {
            self.inner.set_status(status);
        }

        fn headers(&self) -> &Headers {
            self.inner.headers()
        }

        fn headers_mut(&mut self) -> &mut Headers {
            self.inner.headers_mut()
        }

        fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
            if std::mem::take(&mut self.fail_next) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer reset"));
            }
            self.inner.write(chunk)
        }
    }

    #[test]
    fn client_write_failure_discards_capture() {
        let mut client = FlakyClient {
            inner: Response::default(),
            fail_next: true,
        };
        let mut capture = ResponseCapture::new(&mut client, usize::MAX);
        assert!(capture.write(b"AAA").is_err());
        capture.write(b"BBB").unwrap();

        assert!(capture.is_failed());
        assert!(matches!(
            capture.finish(&policy(), "X-Cache"),
            Err(CaptureError::ClientWrite(io::ErrorKind::BrokenPipe))
        ));
    }
}
