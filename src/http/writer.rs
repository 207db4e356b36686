//! The response surface a handler writes into.
//!
//! The host server hands the pipeline something that implements
//! [`ResponseWriter`]; the cache layer wraps it (see
//! [`ResponseCapture`](crate::cache::ResponseCapture)) to observe the bytes on
//! their way out.

use std::io;

use super::{Headers, StatusCode};

/// Streaming response primitives: status, headers, body writes, error send.
///
/// Writes go straight to the client. Implementations must be `Send` because
/// a writer is borrowed across `.await` points inside the downstream call.
pub trait ResponseWriter: Send {
    /// Current status code.
    fn status(&self) -> StatusCode;

    /// Sets the status code.
    fn set_status(&mut self, status: StatusCode);

    /// Response headers written so far.
    fn headers(&self) -> &Headers;

    /// Mutable access to response headers.
    fn headers_mut(&mut self) -> &mut Headers;

    /// Appends a chunk to the response body.
    fn write(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Replaces a header value.
    fn set_header(&mut self, name: &str, value: &str) {
        self.headers_mut().set(name, value);
    }

    /// Sends a short plain-text error with the given status.
    fn send_error(&mut self, status: StatusCode, message: &str) -> io::Result<()> {
        self.set_status(status);
        self.set_header("Content-Type", "text/plain; charset=utf-8");
        self.write(message.as_bytes())
    }
}
