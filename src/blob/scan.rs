use crate::blob::engine::BlobStorage;
use crate::blob::error::BlobResult;
use crate::blob::record::{RecordHeader, RecordId, RecordState};

/// One slot produced by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedRecord {
    pub id: RecordId,
    pub header: RecordHeader,
    /// Present only for `Actual` slots.
    pub payload: Option<Vec<u8>>,
}

impl ScannedRecord {
    pub fn state(&self) -> RecordState {
        self.header.state()
    }
}

/// Iterator returned by [`BlobStorage::records`].
///
/// Stops after the first error, since a slot that cannot be decoded leaves no
/// way to find the next one.
pub struct RecordIter<'a> {
    storage: &'a BlobStorage,
    offset: u64,
    end: u64,
    failed: bool,
}

impl<'a> RecordIter<'a> {
    pub(crate) fn new(storage: &'a BlobStorage, offset: u64, end: u64) -> Self {
        Self {
            storage,
            offset,
            end,
            failed: false,
        }
    }
}

impl Iterator for RecordIter<'_> {
    type Item = BlobResult<ScannedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.end {
            return None;
        }
        match self.storage.scan_slot(self.offset, self.end) {
            Ok(record) => {
                self.offset += record.header.slot_size() as u64;
                Some(Ok(record))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
