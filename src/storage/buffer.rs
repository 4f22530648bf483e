pub mod lru;
pub mod replacer;

use crate::storage::disk::PageManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use dashmap::DashMap;
use lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use replacer::{Replacer, FrameId};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

type FrameData = Arc<RwLock<Box<[u8]>>>;

struct Frame {
    data: FrameData,
    page_id: Option<PageId>,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            page_id: None,
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    fn reset(&mut self) {
        self.page_id = None;
        self.pin_count.store(0, Ordering::SeqCst);
        self.is_dirty.store(false, Ordering::SeqCst);
        self.data.write().fill(0);
    }
}

/// Bounded page cache in front of a [`PageManager`].
///
/// Lock order is `page_manager` → `frames` → `replacer`. Misses are serialized
/// through the page manager lock so a page is never resident in two frames.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    page_table: DashMap<PageId, FrameId>,
    frames: RwLock<Vec<Frame>>,
    replacer: Mutex<Box<dyn Replacer>>,
    page_manager: Mutex<PageManager>,
    max_frames: usize,
    page_size: usize,
}

impl BufferPoolManager {
    pub fn new(page_manager: PageManager, replacer: Box<dyn Replacer>, max_frames: usize) -> Self {
        let page_size = page_manager.page_size();
        Self {
            inner: Arc::new(BufferPoolInner {
                page_table: DashMap::new(),
                frames: RwLock::new(Vec::with_capacity(max_frames)),
                replacer: Mutex::new(replacer),
                page_manager: Mutex::new(page_manager),
                max_frames: max_frames.max(1),
                page_size,
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PageReadGuard> {
        let (frame_id, data) = self.pin_page(page_id)?;
        Ok(PageReadGuard {
            inner: self.inner.clone(),
            frame_id,
            data: data.read_arc(),
        })
    }

    pub fn fetch_page_write(&self, page_id: PageId) -> StorageResult<PageWriteGuard> {
        let (frame_id, data) = self.pin_page(page_id)?;
        Ok(PageWriteGuard {
            inner: self.inner.clone(),
            frame_id,
            data: data.write_arc(),
        })
    }

    /// Appends a zeroed page to the file and returns it pinned for writing.
    pub fn new_page(&self) -> StorageResult<(PageId, PageWriteGuard)> {
        let mut page_manager = self.inner.page_manager.lock();
        let frame_id = self.acquire_frame(&mut page_manager)?;

        let page_id = match page_manager.allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                self.release_frame(frame_id);
                return Err(e);
            }
        };

        let data = {
            let mut frames = self.inner.frames.write();
            let frame = &mut frames[frame_id as usize];
            frame.page_id = Some(page_id);
            frame.pin_count.store(1, Ordering::SeqCst);
            frame.is_dirty.store(true, Ordering::SeqCst);
            self.inner.page_table.insert(page_id, frame_id);
            self.inner.replacer.lock().set_evictable(frame_id, false);
            frame.data.clone()
        };
        drop(page_manager);

        Ok((
            page_id,
            PageWriteGuard {
                inner: self.inner.clone(),
                frame_id,
                data: data.write_arc(),
            },
        ))
    }

    /// Writes every dirty frame back and syncs the file.
    pub fn flush_all(&self) -> StorageResult<()> {
        let mut page_manager = self.inner.page_manager.lock();
        let frames = self.inner.frames.read();

        for frame in frames.iter() {
            Self::write_back(&mut page_manager, frame)?;
        }

        page_manager.sync()
    }

    fn write_back(page_manager: &mut PageManager, frame: &Frame) -> StorageResult<()> {
        let Some(page_id) = frame.page_id else {
            return Ok(());
        };
        if frame.is_dirty.swap(false, Ordering::SeqCst) {
            let data = frame.data.read();
            if let Err(e) = page_manager.write_page(page_id, &data) {
                frame.is_dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }

    fn try_pin_resident(&self, page_id: PageId) -> Option<(FrameId, FrameData)> {
        let frames = self.inner.frames.read();
        let frame_id = *self.inner.page_table.get(&page_id)?;
        let frame = &frames[frame_id as usize];
        frame.pin_count.fetch_add(1, Ordering::SeqCst);
        self.inner.replacer.lock().set_evictable(frame_id, false);
        Some((frame_id, frame.data.clone()))
    }

    fn pin_page(&self, page_id: PageId) -> StorageResult<(FrameId, FrameData)> {
        if let Some(pinned) = self.try_pin_resident(page_id) {
            return Ok(pinned);
        }

        let mut page_manager = self.inner.page_manager.lock();
        // Another thread may have loaded the page while we waited
        if let Some(pinned) = self.try_pin_resident(page_id) {
            return Ok(pinned);
        }

        let frame_id = self.acquire_frame(&mut page_manager)?;
        let mut frames = self.inner.frames.write();
        let frame = &mut frames[frame_id as usize];

        let loaded = page_manager.read_page(page_id, &mut frame.data.write());
        if let Err(e) = loaded {
            drop(frames);
            self.release_frame(frame_id);
            return Err(e);
        }

        frame.page_id = Some(page_id);
        frame.pin_count.store(1, Ordering::SeqCst);
        frame.is_dirty.store(false, Ordering::SeqCst);
        self.inner.page_table.insert(page_id, frame_id);
        self.inner.replacer.lock().set_evictable(frame_id, false);

        Ok((frame_id, frame.data.clone()))
    }

    /// Finds an empty frame, growing the pool or evicting an unpinned page.
    fn acquire_frame(&self, page_manager: &mut PageManager) -> StorageResult<FrameId> {
        let mut frames = self.inner.frames.write();
        if frames.len() < self.inner.max_frames {
            frames.push(Frame::new(self.inner.page_size));
            return Ok((frames.len() - 1) as FrameId);
        }

        loop {
            let victim = self
                .inner
                .replacer
                .lock()
                .victim()
                .ok_or(StorageError::BufferPoolFull {
                    frames: self.inner.max_frames,
                })?;
            let frame = &mut frames[victim as usize];
            // Re-pinned between its last unpin and now
            if frame.pin_count.load(Ordering::SeqCst) > 0 {
                continue;
            }

            if let Err(e) = Self::write_back(page_manager, frame) {
                self.inner.replacer.lock().set_evictable(victim, true);
                return Err(e);
            }
            if let Some(old_page_id) = frame.page_id {
                self.inner.page_table.remove(&old_page_id);
            }
            frame.reset();
            return Ok(victim);
        }
    }

    /// Returns a frame that was acquired but never filled to the eviction pool.
    fn release_frame(&self, frame_id: FrameId) {
        let mut frames = self.inner.frames.write();
        frames[frame_id as usize].reset();
        self.inner.replacer.lock().set_evictable(frame_id, true);
    }

    fn unpin(inner: &BufferPoolInner, frame_id: FrameId, mark_dirty: bool) {
        let frames = inner.frames.read();
        let frame = &frames[frame_id as usize];
        if mark_dirty {
            frame.is_dirty.store(true, Ordering::SeqCst);
        }
        if frame.pin_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            inner.replacer.lock().set_evictable(frame_id, true);
        }
    }
}

pub struct PageReadGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    data: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
}

impl Deref for PageReadGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        BufferPoolManager::unpin(&self.inner, self.frame_id, false);
    }
}

/// Write access to a pinned page. The page is marked dirty when the guard drops.
pub struct PageWriteGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    data: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
}

impl Deref for PageWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        BufferPoolManager::unpin(&self.inner, self.frame_id, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::{TempDir, tempdir};

    const PAGE_SIZE: usize = 512;

    fn create_test_buffer_pool(max_frames: usize) -> Result<(TempDir, BufferPoolManager)> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.blob");
        let page_manager = PageManager::create(&file_path, PAGE_SIZE)?;
        let replacer = Box::new(lru::LruReplacer::new(max_frames));
        Ok((dir, BufferPoolManager::new(page_manager, replacer, max_frames)))
    }

    #[test]
    fn test_new_page() -> Result<()> {
        let (_dir, buffer_pool) = create_test_buffer_pool(10)?;

        let (page_id, mut guard) = buffer_pool.new_page()?;
        assert_eq!(page_id, PageId(0));
        assert_eq!(guard.len(), PAGE_SIZE);

        guard[0] = 42;
        guard[1] = 43;
        drop(guard);

        let guard = buffer_pool.fetch_page(page_id)?;
        assert_eq!(guard[0], 42);
        assert_eq!(guard[1], 43);

        Ok(())
    }

    #[test]
    fn test_fetch_write() -> Result<()> {
        let (_dir, buffer_pool) = create_test_buffer_pool(10)?;

        let (page_id, mut guard) = buffer_pool.new_page()?;
        guard[0] = 10;
        drop(guard);

        let mut guard = buffer_pool.fetch_page_write(page_id)?;
        guard[0] = 20;
        drop(guard);

        let guard = buffer_pool.fetch_page(page_id)?;
        assert_eq!(guard[0], 20);

        Ok(())
    }

    #[test]
    fn test_eviction_writes_back_dirty_pages() -> Result<()> {
        let (_dir, buffer_pool) = create_test_buffer_pool(2)?;

        for i in 0..3u8 {
            let (page_id, mut guard) = buffer_pool.new_page()?;
            assert_eq!(page_id, PageId(i as u32));
            guard[0] = i + 1;
        }

        // Page 0 was evicted to make room for page 2
        assert!(!buffer_pool.inner.page_table.contains_key(&PageId(0)));
        for i in 0..3u8 {
            let guard = buffer_pool.fetch_page(PageId(i as u32))?;
            assert_eq!(guard[0], i + 1);
        }

        Ok(())
    }

    #[test]
    fn test_pinned_pages_are_not_evicted() -> Result<()> {
        let (_dir, buffer_pool) = create_test_buffer_pool(2)?;

        let (_p0, g0) = buffer_pool.new_page()?;
        let (_p1, g1) = buffer_pool.new_page()?;

        let result = buffer_pool.new_page();
        assert!(matches!(result, Err(StorageError::BufferPoolFull { frames: 2 })));

        drop(g0);
        let (page_id, _g2) = buffer_pool.new_page()?;
        drop(g1);
        // The failed allocation above must not have extended the file
        assert_eq!(page_id, PageId(2));

        Ok(())
    }

    #[test]
    fn test_flush_all_persists() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.blob");

        {
            let page_manager = PageManager::create(&file_path, PAGE_SIZE)?;
            let buffer_pool =
                BufferPoolManager::new(page_manager, Box::new(lru::LruReplacer::new(4)), 4);
            let (_page_id, mut guard) = buffer_pool.new_page()?;
            guard[7] = 99;
            drop(guard);
            buffer_pool.flush_all()?;
        }

        let mut page_manager = PageManager::open(&file_path, PAGE_SIZE)?;
        let mut buf = vec![0u8; PAGE_SIZE];
        page_manager.read_page(PageId(0), &mut buf)?;
        assert_eq!(buf[7], 99);

        Ok(())
    }

    #[test]
    fn test_fetch_missing_page_releases_frame() -> Result<()> {
        let (_dir, buffer_pool) = create_test_buffer_pool(1)?;

        assert!(matches!(
            buffer_pool.fetch_page(PageId(3)),
            Err(StorageError::PageNotFound(PageId(3)))
        ));
        // The single frame must still be usable
        let (page_id, _guard) = buffer_pool.new_page()?;
        assert_eq!(page_id, PageId(0));

        Ok(())
    }

    #[test]
    fn test_concurrent_readers() -> Result<()> {
        let (_dir, buffer_pool) = create_test_buffer_pool(4)?;
        for i in 0..6u8 {
            let (_page_id, mut guard) = buffer_pool.new_page()?;
            guard.fill(i);
        }

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let pool = buffer_pool.clone();
                std::thread::spawn(move || -> StorageResult<()> {
                    for round in 0..50u32 {
                        let page = (round + t) % 6;
                        let guard = pool.fetch_page(PageId(page))?;
                        assert!(guard.iter().all(|&b| b == page as u8));
                    }
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("reader thread panicked")?;
        }

        Ok(())
    }
}
