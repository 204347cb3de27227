//! Sequential, seekable reader over one cached object.

use std::fmt;
use std::io::SeekFrom;

use crate::adapter::{Adapter, RangeRead};
use crate::error::{Error, Result};

/// A positioned reader over a single object, backed by an [`Adapter`].
///
/// Holds only the object key, its size and a cursor; every read goes through
/// the adapter's block cache. Created via [`Adapter::reader`], which resolves
/// the object size up front (and therefore fails early on a missing object).
pub struct ObjectReader<'a> {
    adapter: &'a Adapter,
    key: String,
    size: u64,
    pos: u64,
}

impl fmt::Debug for ObjectReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectReader")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("pos", &self.pos)
            .finish()
    }
}

impl<'a> ObjectReader<'a> {
    pub(crate) fn new(adapter: &'a Adapter, key: String, size: u64) -> Self {
        Self {
            adapter,
            key,
            size,
            pos: 0,
        }
    }

    /// Total object length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current cursor position.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Read at the cursor and advance it. Returns `Ok(0)` at the end of the
    /// object; a short count means the end was reached inside the range.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.size {
            return Ok(0);
        }
        let n = self.adapter.read_at(&self.key, buf, self.pos).await?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Move the cursor. Seeking past the end is legal (the next read returns
    /// `Ok(0)`); seeking before the start fails and leaves the cursor where
    /// it was.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i64::try_from(offset)
                .map_err(|_| Error::InvalidArgument(format!("seek offset {offset} overflows")))?,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.size as i64 + delta,
        };
        if target < 0 {
            return Err(Error::InvalidArgument(format!(
                "seek before start of {}",
                self.key
            )));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    /// Positional read; does not move the cursor.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.adapter.read_at(&self.key, buf, offset).await
    }

    /// Positional batch read; does not move the cursor.
    pub async fn read_at_multi(&self, reads: &mut [RangeRead<'_>]) -> Result<Vec<usize>> {
        self.adapter.read_at_multi(&self.key, reads).await
    }
}
