//! Configuration for opening a blob storage.

use crate::storage::DEFAULT_PAGE_SIZE;

/// Default number of pages held by the buffer pool.
pub const DEFAULT_BUFFER_POOL_FRAMES: usize = 64;

/// Default limit on redirect hops followed while resolving a record id.
pub const DEFAULT_MAX_REDIRECT_HOPS: usize = 16;

#[derive(Debug, Clone)]
pub struct BlobStorageConfig {
    /// Page size of the underlying file. Fixed for the life of the file.
    pub page_size: usize,

    /// Number of pages the buffer pool may cache.
    pub buffer_pool_frames: usize,

    /// Resolution of a record id fails with a corruption error past this many hops.
    pub max_redirect_hops: usize,

    /// Recompute statistics with a full scan when the previous session did not close cleanly.
    pub recover_on_unclean_open: bool,
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            buffer_pool_frames: DEFAULT_BUFFER_POOL_FRAMES,
            max_redirect_hops: DEFAULT_MAX_REDIRECT_HOPS,
            recover_on_unclean_open: true,
        }
    }
}

impl BlobStorageConfig {
    pub fn builder() -> BlobStorageConfigBuilder {
        BlobStorageConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct BlobStorageConfigBuilder {
    config: BlobStorageConfig,
}

impl BlobStorageConfigBuilder {
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.config.page_size = page_size;
        self
    }

    pub fn buffer_pool_frames(mut self, frames: usize) -> Self {
        self.config.buffer_pool_frames = frames;
        self
    }

    pub fn max_redirect_hops(mut self, hops: usize) -> Self {
        self.config.max_redirect_hops = hops;
        self
    }

    pub fn recover_on_unclean_open(mut self, recover: bool) -> Self {
        self.config.recover_on_unclean_open = recover;
        self
    }

    pub fn build(self) -> BlobStorageConfig {
        self.config
    }
}
