//! The caching adapter: options, read entry points and the fetch coordinator.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::future;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use crate::bytesize::parse_block_size;
use crate::cache::{BlockCache, LruBlockCache, SizeCache, NOT_FOUND};
use crate::error::{Error, Result};
use crate::planner::{plan_fetches, BlockLayout, FetchPlan};
use crate::reader::ObjectReader;
use crate::singleflight::KeyedMutex;
use crate::source::{FetchLogger, SourceBody, StreamSource};

const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024;
const DEFAULT_CACHED_BLOCKS: usize = 100;
const DEFAULT_SIZE_CACHE_ENTRIES: usize = 1024;

/// One destination of a multi-range read: fill `buf` from `offset`.
pub struct RangeRead<'a> {
    pub offset: u64,
    pub buf: &'a mut [u8],
}

/// Caching read adapter over a [`StreamSource`].
///
/// Concurrent `read_at` calls for overlapping ranges collapse into single
/// upstream fetches; fetched blocks and learned object sizes are kept in
/// bounded LRU caches owned by the adapter.
pub struct Adapter {
    source: Arc<dyn StreamSource>,
    blocks: Arc<dyn BlockCache>,
    sizes: SizeCache,
    layout: BlockLayout,
    split_ranges: bool,
    inflight: KeyedMutex<(String, u64)>,
    logger: Option<Arc<dyn FetchLogger>>,
}

/// Options for [`Adapter`] construction. Validated in [`build`](Self::build).
pub struct AdapterBuilder {
    source: Arc<dyn StreamSource>,
    block_size: Option<String>,
    num_cached_blocks: Option<usize>,
    block_cache: Option<Arc<dyn BlockCache>>,
    size_cache_entries: Option<usize>,
    split_ranges: bool,
    logger: Option<Arc<dyn FetchLogger>>,
}

impl AdapterBuilder {
    /// Block size spec, e.g. `"512kb"`. Defaults to 128 KiB.
    pub fn block_size(mut self, spec: &str) -> Self {
        self.block_size = Some(spec.to_string());
        self
    }

    /// Capacity of the default block cache. Exclusive with
    /// [`block_cache`](Self::block_cache).
    pub fn num_cached_blocks(mut self, count: usize) -> Self {
        self.num_cached_blocks = Some(count);
        self
    }

    /// Use a caller-supplied (possibly shared) block cache.
    pub fn block_cache(mut self, cache: Arc<dyn BlockCache>) -> Self {
        self.block_cache = Some(cache);
        self
    }

    /// Capacity of the object-size cache; 0 disables it.
    pub fn size_cache(mut self, entries: usize) -> Self {
        self.size_cache_entries = Some(entries);
        self
    }

    /// When true, cached blocks are never spanned by an upstream fetch; each
    /// contiguous run of misses becomes its own range request.
    pub fn split_ranges(mut self, split: bool) -> Self {
        self.split_ranges = split;
        self
    }

    /// Receive one event per upstream fetch.
    pub fn logger(mut self, logger: Arc<dyn FetchLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<Adapter> {
        let block_size = match &self.block_size {
            Some(spec) => parse_block_size(spec)?,
            None => DEFAULT_BLOCK_SIZE,
        };
        if self.num_cached_blocks.is_some() && self.block_cache.is_some() {
            return Err(Error::InvalidArgument(
                "num_cached_blocks and block_cache are mutually exclusive".to_string(),
            ));
        }
        let blocks: Arc<dyn BlockCache> = match self.block_cache {
            Some(cache) => cache,
            None => Arc::new(LruBlockCache::new(
                self.num_cached_blocks.unwrap_or(DEFAULT_CACHED_BLOCKS),
            )?),
        };
        Ok(Adapter {
            source: self.source,
            blocks,
            sizes: SizeCache::new(
                self.size_cache_entries.unwrap_or(DEFAULT_SIZE_CACHE_ENTRIES),
            ),
            layout: BlockLayout { block_size },
            split_ranges: self.split_ranges,
            inflight: KeyedMutex::new(),
            logger: self.logger,
        })
    }
}

/// What one plan execution produced. A plan that fails mid-stream still
/// reports the blocks it managed to populate before the error.
#[derive(Default)]
struct PlanOutcome {
    fetched: Vec<(u64, Bytes)>,
    /// Blocks this plan owned that turned out to lie past the end of the object.
    exhausted: Vec<u64>,
    err: Option<Error>,
}

impl Adapter {
    pub fn builder(source: impl StreamSource) -> AdapterBuilder {
        AdapterBuilder {
            source: Arc::new(source),
            block_size: None,
            num_cached_blocks: None,
            block_cache: None,
            size_cache_entries: None,
            split_ranges: false,
            logger: None,
        }
    }

    /// Construct with default options.
    pub fn new(source: impl StreamSource) -> Result<Self> {
        Self::builder(source).build()
    }

    pub fn block_size(&self) -> u64 {
        self.layout.block_size
    }

    /// Drop all cached blocks and sizes. Subsequent reads behave like a
    /// fresh adapter, modulo the I/O they trigger.
    pub fn purge(&self) {
        self.blocks.purge();
        self.sizes.purge();
    }

    /// Read into `buf` from absolute `offset` of `key`.
    ///
    /// A count shorter than `buf.len()` means the object ends inside the
    /// requested range; a read starting at or past the end returns `Ok(0)`.
    pub async fn read_at(&self, key: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut reads = [RangeRead { offset, buf }];
        let counts = self.read_ranges(key, &mut reads).await?;
        Ok(counts[0])
    }

    /// Read a batch of ranges of one object, fanning upstream fetches out in
    /// parallel and de-duplicating shared blocks.
    ///
    /// Fills every buffer it can. On failure the error of the lowest-indexed
    /// failed range is returned; bytes already copied stay in the buffers.
    pub async fn read_at_multi(
        &self,
        key: &str,
        reads: &mut [RangeRead<'_>],
    ) -> Result<Vec<usize>> {
        self.read_ranges(key, reads).await
    }

    /// Sequential/seekable reader over one object. Learns the object size,
    /// so a missing object fails here (and the failure is cached).
    pub async fn reader(&self, key: &str) -> Result<ObjectReader<'_>> {
        let size = self.object_size(key).await?;
        Ok(ObjectReader::new(self, key.to_string(), size))
    }

    async fn object_size(&self, key: &str) -> Result<u64> {
        if let Some(size) = self.known_size(key)? {
            return Ok(size);
        }
        // Warm block 0 through the regular path; the fetch records the size.
        let mut probe = [0u8; 1];
        self.read_at(key, &mut probe, 0).await?;
        match self.known_size(key)? {
            Some(size) => Ok(size),
            None => Err(Error::Backend(anyhow::anyhow!(
                "backend did not report a size for {key}"
            ))),
        }
    }

    /// Size-cache lookup: `Ok(None)` means unknown, `Err` means the key is
    /// recorded as absent.
    fn known_size(&self, key: &str) -> Result<Option<u64>> {
        match self.sizes.get(key) {
            Some(size) if size >= 0 => Ok(Some(size as u64)),
            Some(_) => Err(Error::NotFound(key.to_string())),
            None => Ok(None),
        }
    }

    async fn read_ranges(&self, key: &str, reads: &mut [RangeRead<'_>]) -> Result<Vec<usize>> {
        if reads.is_empty() {
            return Ok(Vec::new());
        }

        // Blocks obtained during this call, pinned against cache eviction so
        // the copy phase cannot lose them under a small cache.
        let mut scratch: HashMap<u64, Bytes> = HashMap::new();
        // Blocks confirmed to lie past the end of the object.
        let mut exhausted: BTreeSet<u64> = BTreeSet::new();
        let mut failed = vec![false; reads.len()];
        let mut first_err: Option<(usize, Error)> = None;

        loop {
            let size = match self.known_size(key) {
                Ok(size) => size,
                Err(_) => {
                    // Sticky not-found: fail every range still in flight.
                    let affected: Vec<usize> = (0..reads.len()).filter(|&i| !failed[i]).collect();
                    record_failure(
                        &mut failed,
                        &mut first_err,
                        &affected,
                        Error::NotFound(key.to_string()),
                    );
                    break;
                }
            };

            let required = self.required_blocks(reads, &failed, size);
            let mut missing = BTreeSet::new();
            for &index in &required {
                if scratch.contains_key(&index) || exhausted.contains(&index) {
                    continue;
                }
                match self.blocks.get(key, index) {
                    Some(block) => {
                        scratch.insert(index, block);
                    }
                    None => {
                        missing.insert(index);
                    }
                }
            }
            if missing.is_empty() {
                break;
            }

            let plans = plan_fetches(&required, &missing, self.split_ranges);
            trace!(key, plans = plans.len(), misses = missing.len(), "fetch round");
            let outcomes =
                future::join_all(plans.iter().map(|plan| self.execute_plan(key, *plan))).await;

            for (plan, mut outcome) in plans.iter().zip(outcomes) {
                for (index, block) in outcome.fetched.drain(..) {
                    scratch.insert(index, block);
                }
                exhausted.extend(outcome.exhausted.iter().copied());
                if let Some(err) = outcome.err.take() {
                    let unresolved: Vec<u64> = plan
                        .blocks()
                        .filter(|index| {
                            missing.contains(index)
                                && !scratch.contains_key(index)
                                && !exhausted.contains(index)
                                && self.blocks.get(key, *index).is_none()
                        })
                        .collect();
                    let affected = self.affected_requests(reads, &failed, size, &unresolved);
                    record_failure(&mut failed, &mut first_err, &affected, err);
                }
            }
        }

        let size = self.sizes.get(key).filter(|&s| s >= 0).map(|s| s as u64);
        let counts = reads
            .iter_mut()
            .map(|read| self.copy_out(read, &scratch, size))
            .collect();
        match first_err {
            Some((_, err)) => Err(err),
            None => Ok(counts),
        }
    }

    /// Union of block indices the unfailed ranges cover, clamped to the
    /// object size when known.
    fn required_blocks(
        &self,
        reads: &[RangeRead<'_>],
        failed: &[bool],
        size: Option<u64>,
    ) -> BTreeSet<u64> {
        let mut required = BTreeSet::new();
        for (read, _) in reads.iter().zip(failed).filter(|(_, &f)| !f) {
            if let Some((first, last)) = self.clamped_span(read, size) {
                required.extend(first..=last);
            }
        }
        required
    }

    fn clamped_span(&self, read: &RangeRead<'_>, size: Option<u64>) -> Option<(u64, u64)> {
        if read.buf.is_empty() {
            return None;
        }
        let mut end = read.offset + read.buf.len() as u64;
        if let Some(size) = size {
            if read.offset >= size {
                return None;
            }
            end = end.min(size);
        }
        Some(self.layout.covering(read.offset, end))
    }

    /// Indices of unfailed requests that needed one of `unresolved`.
    fn affected_requests(
        &self,
        reads: &[RangeRead<'_>],
        failed: &[bool],
        size: Option<u64>,
        unresolved: &[u64],
    ) -> Vec<usize> {
        reads
            .iter()
            .enumerate()
            .filter(|(i, _)| !failed[*i])
            .filter(|(_, read)| {
                self.clamped_span(read, size).is_some_and(|(first, last)| {
                    unresolved.iter().any(|index| (first..=last).contains(index))
                })
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Run one fetch plan: take the per-block single-flight locks in
    /// ascending order, fetch the range once if any block is ours to do,
    /// populate the store, release.
    async fn execute_plan(&self, key: &str, plan: FetchPlan) -> PlanOutcome {
        let mut owned = Vec::new();
        for index in plan.blocks() {
            if self.inflight.lock((key.to_string(), index)).await {
                owned.push(index);
            } else {
                // Another party just populated this block; the result is in
                // the cache, so give the lock straight back.
                self.inflight.unlock((key.to_string(), index));
            }
        }
        if owned.is_empty() {
            return PlanOutcome::default();
        }

        // Blocks whose lock came back `false` were just populated by another
        // party; shrink the upstream request to the span we actually own.
        let span = FetchPlan {
            first: owned[0],
            last: owned[owned.len() - 1],
        };
        let offset = span.offset(&self.layout);
        let len = span.len(&self.layout);
        if let Some(logger) = &self.logger {
            logger.log_fetch(key, offset, len);
        }
        debug!(key, offset, len, "upstream fetch");
        let outcome = self.drain_plan(key, span, &owned, offset, len).await;

        for index in &owned {
            self.inflight.unlock((key.to_string(), *index));
        }
        outcome
    }

    /// Issue the upstream request for a plan and drain it block by block.
    /// Bytes of spanned blocks we do not own are read and discarded.
    async fn drain_plan(
        &self,
        key: &str,
        plan: FetchPlan,
        owned: &[u64],
        offset: u64,
        len: u64,
    ) -> PlanOutcome {
        let mut outcome = PlanOutcome::default();
        let response = match self.source.stream_at(key, offset, len).await {
            Ok(response) => response,
            Err(err) => {
                if err.is_not_found() {
                    self.sizes.add(key, NOT_FOUND);
                }
                outcome.err = Some(err);
                return outcome;
            }
        };
        if let Some(total) = response.total_size {
            self.sizes.add(key, total as i64);
        }

        let mut body = match response.body {
            Some(body) => body,
            None => {
                // The whole plan lies past the end of the object.
                outcome.exhausted.extend(owned.iter().copied());
                return outcome;
            }
        };

        let block_size = self.layout.block_size as usize;
        let mut ended = false;
        for index in plan.blocks() {
            if ended {
                if owned.contains(&index) {
                    outcome.exhausted.push(index);
                }
                continue;
            }
            let mut block = BytesMut::zeroed(block_size);
            let filled = match read_full(&mut body, &mut block).await {
                Ok(filled) => filled,
                Err(err) => {
                    outcome.err = Some(err);
                    return outcome;
                }
            };
            block.truncate(filled);
            if filled < block_size {
                // Short block: the object ends here. It is still cached; the
                // size cache is the authority for its valid length.
                ended = true;
            }
            if owned.contains(&index) {
                if filled > 0 {
                    let block = block.freeze();
                    self.blocks.add(key, index, block.clone());
                    outcome.fetched.push((index, block));
                } else {
                    outcome.exhausted.push(index);
                }
            }
        }
        outcome
    }

    /// Copy the longest contiguous prefix of a range out of the resolved
    /// blocks. Stops at the first gap (failed fetch) or at the end of the
    /// object (size clamp or short final block).
    fn copy_out(&self, read: &mut RangeRead<'_>, scratch: &HashMap<u64, Bytes>, size: Option<u64>) -> usize {
        if read.buf.is_empty() {
            return 0;
        }
        let offset = read.offset;
        let mut end = offset + read.buf.len() as u64;
        if let Some(size) = size {
            if offset >= size {
                return 0;
            }
            end = end.min(size);
        }
        let (first, last) = self.layout.covering(offset, end);

        let mut filled = 0usize;
        for index in first..=last {
            let Some(block) = scratch.get(&index) else {
                break;
            };
            let block_start = self.layout.start_of(index);
            let from = offset.max(block_start) - block_start;
            let wanted = end.min(block_start + self.layout.block_size) - block_start;
            let until = wanted.min(block.len() as u64);
            if until <= from {
                break;
            }
            let dst = (block_start + from - offset) as usize;
            let src = &block[from as usize..until as usize];
            read.buf[dst..dst + src.len()].copy_from_slice(src);
            filled = dst + src.len();
            if until < wanted {
                // Short final block; nothing follows it.
                break;
            }
        }
        filled
    }
}

fn record_failure(
    failed: &mut [bool],
    first_err: &mut Option<(usize, Error)>,
    affected: &[usize],
    err: Error,
) {
    let Some(&lowest) = affected.first() else {
        return;
    };
    for &index in affected {
        failed[index] = true;
    }
    match first_err {
        Some((current, _)) if *current <= lowest => {}
        _ => *first_err = Some((lowest, err)),
    }
}

/// Read until `buf` is full or the stream ends.
async fn read_full(body: &mut SourceBody, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = body.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StreamAtResponse;
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory source serving a fixed byte array under any key, counting
    /// upstream calls.
    struct MemSource {
        data: Vec<u8>,
        calls: Arc<AtomicUsize>,
    }

    impl MemSource {
        fn new(data: Vec<u8>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    data,
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl StreamSource for MemSource {
        async fn stream_at(&self, key: &str, offset: u64, len: u64) -> Result<StreamAtResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if key == "enoent" {
                return Err(Error::NotFound(key.to_string()));
            }
            let size = self.data.len() as u64;
            if offset >= size {
                return Ok(StreamAtResponse::past_end(Some(size)));
            }
            let end = (offset + len).min(size) as usize;
            Ok(StreamAtResponse {
                body: Some(Box::new(Cursor::new(
                    self.data[offset as usize..end].to_vec(),
                ))),
                total_size: Some(size),
            })
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i / 4) as u8).collect()
    }

    #[tokio::test]
    async fn test_read_within_one_block() {
        let (source, calls) = MemSource::new(patterned(1024));
        let adapter = Adapter::builder(source).block_size("10").build().unwrap();

        let mut buf = [0u8; 4];
        let n = adapter.read_at("", &mut buf, 0).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [0, 0, 0, 0]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Same range again: served from cache.
        let n = adapter.read_at("", &mut buf, 0).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_spanning_blocks() {
        let (source, _) = MemSource::new(patterned(1024));
        let adapter = Adapter::builder(source).block_size("10").build().unwrap();

        let mut buf = [0u8; 16];
        let n = adapter.read_at("", &mut buf, 63).await.unwrap();
        assert_eq!(n, 16);
        assert_eq!(
            buf,
            [15, 16, 16, 16, 16, 17, 17, 17, 17, 18, 18, 18, 18, 19, 19, 19]
        );
    }

    #[tokio::test]
    async fn test_short_read_at_end() {
        let (source, _) = MemSource::new(patterned(1024));
        let adapter = Adapter::builder(source).block_size("10").build().unwrap();

        let mut buf = [0u8; 8];
        let n = adapter.read_at("", &mut buf, 255 * 4).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &[255, 255, 255, 255]);
    }

    #[tokio::test]
    async fn test_read_past_end() {
        let (source, calls) = MemSource::new(patterned(1024));
        let adapter = Adapter::builder(source).block_size("10").build().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(adapter.read_at("", &mut buf, 256 * 4).await.unwrap(), 0);
        // Size is now cached; a further past-end read plans no fetch at all.
        let calls_before = calls.load(Ordering::SeqCst);
        assert_eq!(adapter.read_at("", &mut buf, 256 * 4 + 5).await.unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn test_not_found_is_sticky() {
        let (source, calls) = MemSource::new(patterned(1024));
        let adapter = Adapter::builder(source).block_size("10").build().unwrap();

        let mut buf = [0u8; 4];
        let err = adapter.read_at("enoent", &mut buf, 0).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Second read is short-circuited by the size cache.
        let err = adapter.read_at("enoent", &mut buf, 8).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_reads_fetch_once() {
        let (source, calls) = MemSource::new(patterned(1024));
        let adapter = Arc::new(
            Adapter::builder(source).block_size("10").build().unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let adapter = adapter.clone();
            handles.push(tokio::spawn(async move {
                let mut buf = [0u8; 4];
                let n = adapter.read_at("", &mut buf, 0).await.unwrap();
                assert_eq!(n, 4);
                assert_eq!(buf, [0, 0, 0, 0]);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_multi_read_dedups_shared_blocks() {
        let (source, calls) = MemSource::new(patterned(1024));
        let adapter = Adapter::builder(source).block_size("4").build().unwrap();

        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let mut reads = [
            RangeRead { offset: 0, buf: &mut a },
            RangeRead { offset: 2, buf: &mut b },
        ];
        let counts = adapter.read_at_multi("", &mut reads).await.unwrap();
        assert_eq!(counts, vec![4, 4]);
        assert_eq!(a, [0, 0, 0, 0]);
        assert_eq!(b, [0, 0, 1, 1]);
        // Blocks 0 and 1 were needed; block 0 was shared.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_purge_forgets_everything() {
        let (source, calls) = MemSource::new(patterned(1024));
        let adapter = Adapter::builder(source).block_size("10").build().unwrap();

        let mut buf = [0u8; 4];
        adapter.read_at("", &mut buf, 0).await.unwrap();
        adapter.purge();
        adapter.read_at("", &mut buf, 0).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_split_ranges_preserves_cached_blocks() {
        let (source, calls) = MemSource::new(patterned(1024));
        let adapter = Adapter::builder(source)
            .block_size("10")
            .split_ranges(true)
            .build()
            .unwrap();

        // Cache block 2, then read a range covering blocks 1-3.
        let mut buf = [0u8; 10];
        adapter.read_at("", &mut buf, 20).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut buf = [0u8; 30];
        let n = adapter.read_at("", &mut buf, 10).await.unwrap();
        assert_eq!(n, 30);
        assert_eq!(&buf[..4], &[2, 2, 3, 3]);
        // Blocks 1 and 3 fetched separately; block 2 untouched.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_option_validation() {
        let (source, _) = MemSource::new(Vec::new());
        assert!(Adapter::builder(source).block_size("foo").build().is_err());

        let (source, _) = MemSource::new(Vec::new());
        assert!(Adapter::builder(source).num_cached_blocks(0).build().is_err());

        let (source, _) = MemSource::new(Vec::new());
        let shared = Arc::new(LruBlockCache::new(10).unwrap());
        assert!(Adapter::builder(source)
            .num_cached_blocks(10)
            .block_cache(shared)
            .build()
            .is_err());

        let (source, _) = MemSource::new(Vec::new());
        assert!(Adapter::builder(source).size_cache(100).build().is_ok());
    }
}
