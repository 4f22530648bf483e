//! Paged storage layer.
//!
//! Everything the blob engine needs from the file system lives here:
//!
//! - **PageManager**: reads and writes whole pages of a single file
//! - **BufferPoolManager**: in-memory cache of pages with LRU eviction
//! - **PagedStorage**: byte-addressed view over pages, the contract the engine consumes
//!
//! Page size is chosen when a file is opened and must be a power of two.

pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;
pub mod paged;

pub use buffer::{BufferPoolManager, PageReadGuard, PageWriteGuard};
pub use disk::{DEFAULT_PAGE_SIZE, PageManager};
pub use error::{StorageError, StorageResult};
pub use page::PageId;
pub use paged::{PagedFileStorage, PagedStorage};
