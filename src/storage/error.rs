//! Storage layer error types.

use crate::storage::page::PageId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the paged file, the buffer pool and the byte-level adapter.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error on {path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Buffer pool is full: all {frames} frames are pinned")]
    BufferPoolFull { frames: usize },

    #[error("Access [{offset}, {offset}+{len}) is outside storage of {size} bytes")]
    OutOfBounds { offset: u64, len: usize, size: u64 },

    #[error("Invalid page size {page_size}: {reason}")]
    InvalidPageSize { page_size: usize, reason: &'static str },

    #[error("Buffer size must be the page size ({expected}), got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("Storage is closed")]
    Closed,
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
