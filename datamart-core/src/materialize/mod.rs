//! Local copies of datasets, converted to the requested format.

pub mod archive;
mod cache;
mod config;
mod fetch;
mod key;
mod lock;
mod store;
pub mod writer;

pub use cache::{CacheActivity, MaterializationCache, PathOrigin, ScopedPath};
pub use config::{CacheConfig, DEFAULT_DOWNLOAD_SIZE_LIMIT};
pub use fetch::{DatasetFetcher, DescriptorFetcher, HttpFetcher};
pub use key::{CacheKey, MAX_KEY_LEN};
pub use lock::EntryLock;
pub use store::{CacheStats, CacheStore, EntryInfo};
pub use writer::{D3mWriter, FormatWriter, WriteRequest, WriterRegistry};
