//! Storage header at offset 0.
//!
//! ```text
//! ┌───────────┬─────────────┬───────────────┬─────────────┐
//! │ magic (4) │ version (4) │ page size (4) │ status (4)  │
//! ├───────────┴─────────────┴───────────────┴─────────────┤
//! │ size in bytes (8)       │ records allocated (8)       │
//! │ records deleted (8)     │ records relocated (8)       │
//! │ live payload bytes (8)  │ live capacity bytes (8)     │
//! └─────────────────────────┴─────────────────────────────┘
//! ```

use crate::blob::error::{BlobResult, BlobStorageError};
use crate::blob::stats::BlobStorageStatistics;
use bytes::{Buf, BufMut, BytesMut};

pub const STORAGE_HEADER_SIZE: usize = 64;
pub const STORAGE_MAGIC: u32 = u32::from_le_bytes(*b"BLBS");
pub const STORAGE_VERSION_CURRENT: u32 = 1;

const STATUS_CLOSED_PROPERLY: u32 = 1;
const STATUS_OPENED: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Last session flushed and closed the file.
    ClosedProperly,
    /// A session has the file open, or crashed while it had.
    Opened,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHeader {
    pub version: u32,
    pub page_size: u32,
    pub status: FileStatus,
    pub stats: BlobStorageStatistics,
}

impl StorageHeader {
    pub fn new(page_size: u32) -> Self {
        Self {
            version: STORAGE_VERSION_CURRENT,
            page_size,
            status: FileStatus::Opened,
            stats: BlobStorageStatistics {
                size_in_bytes: STORAGE_HEADER_SIZE as u64,
                ..Default::default()
            },
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(STORAGE_HEADER_SIZE);
        buf.put_u32_le(STORAGE_MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.page_size);
        buf.put_u32_le(match self.status {
            FileStatus::ClosedProperly => STATUS_CLOSED_PROPERLY,
            FileStatus::Opened => STATUS_OPENED,
        });
        buf.put_u64_le(self.stats.size_in_bytes);
        buf.put_u64_le(self.stats.records_allocated);
        buf.put_u64_le(self.stats.records_deleted);
        buf.put_u64_le(self.stats.records_relocated);
        buf.put_u64_le(self.stats.live_payload_bytes);
        buf.put_u64_le(self.stats.live_capacity_bytes);
        buf
    }

    /// Decodes a header. Returns `None` for an all-zero region, which is a
    /// file that was grown but never initialized.
    pub fn decode(mut buf: &[u8]) -> BlobResult<Option<Self>> {
        if buf.len() < STORAGE_HEADER_SIZE {
            return Err(BlobStorageError::Format(format!(
                "storage header truncated: {} of {} bytes",
                buf.len(),
                STORAGE_HEADER_SIZE
            )));
        }
        if buf[..STORAGE_HEADER_SIZE].iter().all(|&b| b == 0) {
            return Ok(None);
        }

        let magic = buf.get_u32_le();
        if magic != STORAGE_MAGIC {
            return Err(BlobStorageError::Format(format!("bad magic {magic:#010x}")));
        }
        let version = buf.get_u32_le();
        if version != STORAGE_VERSION_CURRENT {
            return Err(BlobStorageError::Format(format!(
                "unsupported version {version}, expected {STORAGE_VERSION_CURRENT}"
            )));
        }
        let page_size = buf.get_u32_le();
        let status = match buf.get_u32_le() {
            STATUS_CLOSED_PROPERLY => FileStatus::ClosedProperly,
            STATUS_OPENED => FileStatus::Opened,
            other => {
                return Err(BlobStorageError::Format(format!("unknown file status {other}")));
            }
        };

        let stats = BlobStorageStatistics {
            size_in_bytes: buf.get_u64_le(),
            records_allocated: buf.get_u64_le(),
            records_deleted: buf.get_u64_le(),
            records_relocated: buf.get_u64_le(),
            live_payload_bytes: buf.get_u64_le(),
            live_capacity_bytes: buf.get_u64_le(),
        };

        Ok(Some(Self {
            version,
            page_size,
            status,
            stats,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encodes_to_fixed_size() -> BlobResult<()> {
        let mut header = StorageHeader::new(8192);
        header.status = FileStatus::ClosedProperly;
        header.stats.records_allocated = 7;
        header.stats.records_relocated = 2;
        header.stats.live_payload_bytes = 1000;

        let encoded = header.encode();
        assert_eq!(encoded.len(), STORAGE_HEADER_SIZE);
        assert_eq!(&encoded[..4], b"BLBS");
        assert_eq!(StorageHeader::decode(&encoded)?, Some(header));
        Ok(())
    }

    #[test]
    fn test_zeroed_header_is_uninitialized() -> BlobResult<()> {
        assert_eq!(StorageHeader::decode(&[0u8; STORAGE_HEADER_SIZE])?, None);
        Ok(())
    }

    #[test]
    fn test_rejects_unknown_format() {
        let good = StorageHeader::new(4096).encode();

        assert!(matches!(
            StorageHeader::decode(&good[..20]),
            Err(BlobStorageError::Format(_))
        ));

        let mut bad_magic = good.to_vec();
        bad_magic[0] = b'X';
        assert!(matches!(
            StorageHeader::decode(&bad_magic),
            Err(BlobStorageError::Format(_))
        ));

        let mut bad_version = good.to_vec();
        bad_version[4] = 99;
        assert!(matches!(
            StorageHeader::decode(&bad_version),
            Err(BlobStorageError::Format(_))
        ));
    }
}
