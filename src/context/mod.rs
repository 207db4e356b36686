//! Per-request context threaded through the middleware pipeline.

use std::time::Instant;

use crate::Request;

/// Per-request state handed from one middleware to the next.
#[derive(Debug)]
pub struct Context {
    request: Request,
    received_at: Instant,
}

impl Context {
    /// Create a new context from a request
    pub fn new(request: Request) -> Self {
        Self {
            request,
            received_at: Instant::now(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// When the pipeline first saw this request.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn into_request(self) -> Request {
        self.request
    }
}
