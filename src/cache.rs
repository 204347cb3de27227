//! In-memory LRU stores for populated blocks and learned object sizes.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use bytes::Bytes;
use lru::LruCache;
use tracing::trace;

use crate::error::{Error, Result};

/// Size-cache value recording that the origin reported "no such object".
/// Distinct from an absent entry, which only means the size is unknown.
pub const NOT_FOUND: i64 = -1;

/// Store for fully populated blocks, keyed by `(object key, block index)`.
///
/// Implementations must be safe for concurrent use and are expected to treat
/// both reads and writes as recency touches. A single instance may be shared
/// by several adapters over different backends to pool capacity.
pub trait BlockCache: Send + Sync {
    fn add(&self, key: &str, block: u64, data: Bytes);
    fn get(&self, key: &str, block: u64) -> Option<Bytes>;
    /// Drop every cached block.
    fn purge(&self);
}

/// Strict-LRU [`BlockCache`] bounded by entry count.
pub struct LruBlockCache {
    inner: Mutex<LruCache<(String, u64), Bytes>>,
}

impl LruBlockCache {
    /// Create a cache holding at most `capacity` blocks.
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            Error::InvalidArgument("block cache capacity must be positive".to_string())
        })?;
        Ok(Self {
            inner: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockCache for LruBlockCache {
    fn add(&self, key: &str, block: u64, data: Bytes) {
        trace!(key, block, len = data.len(), "cache block");
        self.inner
            .lock()
            .unwrap()
            .put((key.to_string(), block), data);
    }

    fn get(&self, key: &str, block: u64) -> Option<Bytes> {
        self.inner
            .lock()
            .unwrap()
            .get(&(key.to_string(), block))
            .cloned()
    }

    fn purge(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// Bounded LRU of learned object sizes, with [`NOT_FOUND`] as the negative
/// sentinel. Capacity 0 disables caching entirely.
pub(crate) struct SizeCache {
    inner: Option<Mutex<LruCache<String, i64>>>,
}

impl SizeCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: NonZeroUsize::new(capacity)
                .map(|capacity| Mutex::new(LruCache::new(capacity))),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<i64> {
        let inner = self.inner.as_ref()?;
        inner.lock().unwrap().get(key).copied()
    }

    pub(crate) fn add(&self, key: &str, size: i64) {
        if let Some(inner) = &self.inner {
            trace!(key, size, "cache object size");
            inner.lock().unwrap().put(key.to_string(), size);
        }
    }

    pub(crate) fn purge(&self) {
        if let Some(inner) = &self.inner {
            inner.lock().unwrap().clear();
        }
    }
}
