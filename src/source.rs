//! Contract between the adapter and its backing storage.

use std::fmt;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::error::Result;

/// Byte stream handed back by a [`StreamSource`].
pub type SourceBody = Box<dyn AsyncRead + Send + Unpin>;

/// Outcome of a successful `stream_at` call.
pub struct StreamAtResponse {
    /// Bytes of the requested range, possibly fewer than asked for when the
    /// object ends inside it. `None` when the range starts at or past the end
    /// of the object.
    pub body: Option<SourceBody>,
    /// Total object length in bytes, when the backend learned it. Backends
    /// may only discover the size on offset-0 fetches.
    pub total_size: Option<u64>,
}

impl fmt::Debug for StreamAtResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamAtResponse")
            .field("body", &self.body.as_ref().map(|_| ()))
            .field("total_size", &self.total_size)
            .finish()
    }
}

impl StreamAtResponse {
    /// A response for a range entirely past the end of the object.
    pub fn past_end(total_size: Option<u64>) -> Self {
        Self {
            body: None,
            total_size,
        }
    }
}

/// A key-addressable source that fulfils linear range requests.
///
/// This is the only interface the adapter core knows about storage; the
/// handlers in [`crate::backend`] implement it for local files, HTTP and S3.
#[async_trait]
pub trait StreamSource: Send + Sync + 'static {
    /// Stream up to `len` bytes of `key` starting at `offset`.
    ///
    /// Absent objects fail with [`crate::Error::NotFound`]; every other
    /// backend failure propagates verbatim.
    async fn stream_at(&self, key: &str, offset: u64, len: u64) -> Result<StreamAtResponse>;
}

/// Receives one event per upstream fetch issued by the adapter.
///
/// Useful for audit logs and for spotting read patterns that defeat the
/// cache. The adapter calls this before the fetch is dispatched.
pub trait FetchLogger: Send + Sync {
    fn log_fetch(&self, key: &str, offset: u64, len: u64);
}

/// Stock [`FetchLogger`] that emits a `tracing` debug event per fetch.
pub struct TracingLogger;

impl FetchLogger for TracingLogger {
    fn log_fetch(&self, key: &str, offset: u64, len: u64) {
        debug!("GET {key} off={offset} len={len}");
    }
}
