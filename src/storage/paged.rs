//! Byte-addressed storage over pages.
//!
//! [`PagedStorage`] is the contract the blob engine is written against. It
//! hides pages entirely: callers address bytes by absolute offset and the
//! implementation splits each access along page boundaries.

use crate::storage::buffer::BufferPoolManager;
use crate::storage::buffer::lru::LruReplacer;
use crate::storage::disk::PageManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Durable, offset-addressed byte storage with page-aligned growth.
pub trait PagedStorage: Send + Sync {
    fn page_size(&self) -> usize;

    fn read_bytes(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    fn write_bytes(&self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Current size in bytes, always a multiple of the page size.
    fn size(&self) -> StorageResult<u64>;

    /// Extends the storage to at least `new_size` bytes. Never shrinks.
    fn grow(&self, new_size: u64) -> StorageResult<()>;

    fn flush(&self) -> StorageResult<()>;

    /// Flushes and releases the storage. Closing twice is a no-op.
    fn close(&self) -> StorageResult<()>;
}

/// [`PagedStorage`] backed by a page file and an LRU buffer pool.
pub struct PagedFileStorage {
    buffer_pool: BufferPoolManager,
    size: AtomicU64,
    closed: AtomicBool,
}

impl PagedFileStorage {
    /// Opens `path`, creating an empty file if it does not exist.
    pub fn open(path: &Path, page_size: usize, buffer_pool_frames: usize) -> StorageResult<Self> {
        let page_manager = PageManager::open(path, page_size)?;
        Self::with_page_manager(page_manager, buffer_pool_frames)
    }

    /// Creates `path`, truncating any existing content.
    pub fn create(path: &Path, page_size: usize, buffer_pool_frames: usize) -> StorageResult<Self> {
        let page_manager = PageManager::create(path, page_size)?;
        Self::with_page_manager(page_manager, buffer_pool_frames)
    }

    fn with_page_manager(page_manager: PageManager, buffer_pool_frames: usize) -> StorageResult<Self> {
        let page_size = page_manager.page_size();
        let size = page_manager.num_pages()? as u64 * page_size as u64;
        let replacer = Box::new(LruReplacer::new(buffer_pool_frames));
        Ok(Self {
            buffer_pool: BufferPoolManager::new(page_manager, replacer, buffer_pool_frames),
            size: AtomicU64::new(size),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn check_bounds(&self, offset: u64, len: usize) -> StorageResult<()> {
        let size = self.size.load(Ordering::SeqCst);
        match offset.checked_add(len as u64) {
            Some(end) if end <= size => Ok(()),
            _ => Err(StorageError::OutOfBounds { offset, len, size }),
        }
    }
}

/// Splits `[offset, offset + len)` into `(page, offset_in_page, len_in_page)` pieces.
fn page_spans(offset: u64, len: usize, page_size: usize) -> impl Iterator<Item = (PageId, usize, usize)> {
    let mut position = offset;
    let end = offset + len as u64;
    std::iter::from_fn(move || {
        if position >= end {
            return None;
        }
        let page_id = PageId::containing(position, page_size);
        let in_page = (position - page_id.start_offset(page_size)) as usize;
        let chunk = (page_size - in_page).min((end - position) as usize);
        position += chunk as u64;
        Some((page_id, in_page, chunk))
    })
}

impl PagedStorage for PagedFileStorage {
    fn page_size(&self) -> usize {
        self.buffer_pool.page_size()
    }

    fn read_bytes(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.ensure_open()?;
        self.check_bounds(offset, len)?;

        let mut out = Vec::with_capacity(len);
        for (page_id, in_page, chunk) in page_spans(offset, len, self.page_size()) {
            let page = self.buffer_pool.fetch_page(page_id)?;
            out.extend_from_slice(&page[in_page..in_page + chunk]);
        }
        Ok(out)
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.ensure_open()?;
        self.check_bounds(offset, data.len())?;

        let mut written = 0;
        for (page_id, in_page, chunk) in page_spans(offset, data.len(), self.page_size()) {
            let mut page = self.buffer_pool.fetch_page_write(page_id)?;
            page[in_page..in_page + chunk].copy_from_slice(&data[written..written + chunk]);
            written += chunk;
        }
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        self.ensure_open()?;
        Ok(self.size.load(Ordering::SeqCst))
    }

    fn grow(&self, new_size: u64) -> StorageResult<()> {
        self.ensure_open()?;
        let page_size = self.page_size() as u64;
        while self.size.load(Ordering::SeqCst) < new_size {
            let (page_id, _page) = self.buffer_pool.new_page()?;
            self.size
                .store(page_id.start_offset(page_size as usize) + page_size, Ordering::SeqCst);
        }
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        self.ensure_open()?;
        self.buffer_pool.flush_all()
    }

    fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.buffer_pool.flush_all()
    }
}
