//! Block-caching read adapter for keyed object storage.
//!
//! An [`Adapter`] sits between `read_at`-style consumers and a
//! [`StreamSource`] that can only serve linear ranges. Unaligned, overlapping
//! and concurrent reads collapse into block-aligned, de-duplicated upstream
//! fetches; populated blocks and learned object sizes live in bounded LRU
//! caches owned by the adapter.
//!
//! ```no_run
//! use rangecache::{backend::HttpBackend, Adapter};
//!
//! # async fn demo() -> rangecache::Result<()> {
//! let adapter = Adapter::builder(HttpBackend::new())
//!     .block_size("512kb")
//!     .num_cached_blocks(256)
//!     .build()?;
//!
//! let mut header = [0u8; 16];
//! let n = adapter
//!     .read_at("https://example.com/scene.tif", &mut header, 0)
//!     .await?;
//! # let _ = n;
//! # Ok(())
//! # }
//! ```

pub mod backend;

mod adapter;
mod bytesize;
mod cache;
mod error;
mod planner;
mod reader;
mod singleflight;
mod source;

pub use crate::adapter::{Adapter, AdapterBuilder, RangeRead};
pub use crate::bytesize::parse_block_size;
pub use crate::cache::{BlockCache, LruBlockCache, NOT_FOUND};
pub use crate::error::{Error, Result};
pub use crate::reader::ObjectReader;
pub use crate::singleflight::KeyedMutex;
pub use crate::source::{
    FetchLogger, SourceBody, StreamAtResponse, StreamSource, TracingLogger,
};
