use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const DEFAULT_PAGE_SIZE: usize = 8192;
pub const MIN_PAGE_SIZE: usize = 256;
pub const MAX_PAGE_SIZE: usize = 1 << 24;

/// Page-granular access to a single file.
pub struct PageManager {
    file: File,
    page_size: usize,
}

impl PageManager {
    pub fn create(path: &Path, page_size: usize) -> StorageResult<Self> {
        validate_page_size(page_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| StorageError::File {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            file,
            page_size,
        })
    }

    /// Opens an existing file, or creates an empty one if it is missing.
    pub fn open(path: &Path, page_size: usize) -> StorageResult<Self> {
        validate_page_size(page_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| StorageError::File {
                path: path.to_path_buf(),
                source,
            })?;

        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            // A torn tail page from an interrupted grow; round the file up so every page is whole.
            let rounded = (len / page_size as u64 + 1) * page_size as u64;
            log::warn!(
                "{:?}: length {} is not a multiple of page size {}, extending to {}",
                path,
                len,
                page_size,
                rounded
            );
            file.set_len(rounded)?;
        }

        Ok(Self {
            file,
            page_size,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> StorageResult<()> {
        self.check_buffer(buf.len())?;

        let offset = page_id.start_offset(self.page_size);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            return Err(StorageError::PageNotFound(page_id));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;

        Ok(())
    }

    /// Writes a page without syncing; call [`PageManager::sync`] to make it durable.
    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> StorageResult<()> {
        self.check_buffer(data.len())?;

        let offset = page_id.start_offset(self.page_size);
        let file_size = self.file.metadata()?.len();

        // Extend file if necessary
        if offset >= file_size {
            self.file.set_len(offset + self.page_size as u64)?;
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;

        Ok(())
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn num_pages(&self) -> StorageResult<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / self.page_size as u64) as u32)
    }

    pub fn allocate_page(&mut self) -> StorageResult<PageId> {
        let current_pages = self.num_pages()?;
        let new_page_id = PageId(current_pages);

        // Extend file to include new page
        let new_size = (current_pages as u64 + 1) * self.page_size as u64;
        self.file.set_len(new_size)?;

        Ok(new_page_id)
    }

    fn check_buffer(&self, len: usize) -> StorageResult<()> {
        if len != self.page_size {
            return Err(StorageError::BufferSizeMismatch {
                expected: self.page_size,
                actual: len,
            });
        }
        Ok(())
    }
}

pub(crate) fn validate_page_size(page_size: usize) -> StorageResult<()> {
    let reason = if !page_size.is_power_of_two() {
        "must be a power of two"
    } else if page_size < MIN_PAGE_SIZE {
        "below minimum of 256 bytes"
    } else if page_size > MAX_PAGE_SIZE {
        "above maximum of 16 MiB"
    } else {
        return Ok(());
    };
    Err(StorageError::InvalidPageSize { page_size, reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 1024;

    #[test]
    fn test_create_and_open() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.blob");

        {
            let pm = PageManager::create(&file_path, PAGE_SIZE)?;
            assert_eq!(pm.num_pages()?, 0);
            assert_eq!(pm.page_size(), PAGE_SIZE);
        }

        {
            let pm = PageManager::open(&file_path, PAGE_SIZE)?;
            assert_eq!(pm.num_pages()?, 0);
        }

        Ok(())
    }

    #[test]
    fn test_write_and_read_page() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.blob");
        let mut pm = PageManager::create(&file_path, PAGE_SIZE)?;

        let mut write_buf = vec![0u8; PAGE_SIZE];
        write_buf[0] = 42;
        write_buf[PAGE_SIZE - 1] = 24;
        pm.write_page(PageId(0), &write_buf)?;

        let mut read_buf = vec![0u8; PAGE_SIZE];
        pm.read_page(PageId(0), &mut read_buf)?;

        assert_eq!(read_buf[0], 42);
        assert_eq!(read_buf[PAGE_SIZE - 1], 24);

        Ok(())
    }

    #[test]
    fn test_read_nonexistent_page() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.blob");
        let mut pm = PageManager::create(&file_path, PAGE_SIZE)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        let result = pm.read_page(PageId(10), &mut buf);
        assert!(matches!(result, Err(StorageError::PageNotFound(PageId(10)))));

        Ok(())
    }

    #[test]
    fn test_invalid_buffer_size() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.blob");
        let mut pm = PageManager::create(&file_path, PAGE_SIZE)?;

        let mut small_buf = vec![0u8; 100];
        assert!(pm.read_page(PageId(0), &mut small_buf).is_err());
        assert!(pm.write_page(PageId(0), &small_buf).is_err());

        Ok(())
    }

    #[test]
    fn test_invalid_page_size() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.blob");

        for page_size in [0, 100, 128, 3000, MAX_PAGE_SIZE * 2] {
            let result = PageManager::create(&file_path, page_size);
            assert!(matches!(result, Err(StorageError::InvalidPageSize { .. })));
        }

        Ok(())
    }

    #[test]
    fn test_file_growth_and_persistence() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.blob");

        {
            let mut pm = PageManager::create(&file_path, PAGE_SIZE)?;
            let buf = vec![5u8; PAGE_SIZE];
            // Write to page 5 (skipping 0-4)
            pm.write_page(PageId(5), &buf)?;
            pm.sync()?;
            assert_eq!(pm.num_pages()?, 6);
        }

        {
            let mut pm = PageManager::open(&file_path, PAGE_SIZE)?;
            let mut buf = vec![0u8; PAGE_SIZE];
            pm.read_page(PageId(5), &mut buf)?;
            assert!(buf.iter().all(|&b| b == 5));
        }

        Ok(())
    }

    #[test]
    fn test_allocate_page() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.blob");
        let mut pm = PageManager::create(&file_path, PAGE_SIZE)?;

        assert_eq!(pm.allocate_page()?, PageId(0));
        assert_eq!(pm.allocate_page()?, PageId(1));
        assert_eq!(pm.num_pages()?, 2);

        Ok(())
    }

    #[test]
    fn test_open_rounds_up_torn_tail() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.blob");
        std::fs::write(&file_path, vec![1u8; PAGE_SIZE + 10])?;

        let pm = PageManager::open(&file_path, PAGE_SIZE)?;
        assert_eq!(pm.num_pages()?, 2);

        Ok(())
    }
}
