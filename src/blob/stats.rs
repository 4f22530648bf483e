use crate::blob::record::RecordHeader;
use std::fmt;

/// Global record counters.
///
/// Kept incrementally by every mutating call and persisted in the storage
/// header on flush. A full scan (see `BlobStorage::scan_statistics`) must
/// always arrive at the same values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobStorageStatistics {
    /// Slots ever allocated, relocation targets included. Padding is not counted.
    pub records_allocated: u64,
    pub records_deleted: u64,
    pub records_relocated: u64,
    pub live_payload_bytes: u64,
    pub live_capacity_bytes: u64,
    /// Offset just past the last slot, storage header included.
    pub size_in_bytes: u64,
}

impl BlobStorageStatistics {
    pub fn live_records_count(&self) -> u64 {
        self.records_allocated
            .saturating_sub(self.records_deleted)
            .saturating_sub(self.records_relocated)
    }

    /// Adds one scanned slot to the totals.
    pub(crate) fn account(&mut self, header: &RecordHeader) {
        match *header {
            RecordHeader::Actual {
                capacity, length, ..
            } => {
                self.records_allocated += 1;
                self.live_payload_bytes += length as u64;
                self.live_capacity_bytes += capacity as u64;
            }
            RecordHeader::Moved { .. } => {
                self.records_allocated += 1;
                self.records_relocated += 1;
            }
            RecordHeader::Deleted { relocated, .. } => {
                self.records_allocated += 1;
                if relocated {
                    self.records_relocated += 1;
                } else {
                    self.records_deleted += 1;
                }
            }
            RecordHeader::Padding { .. } => {}
        }
    }
}

impl fmt::Display for BlobStorageStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} records allocated, {} deleted, {} relocated, {} live",
            self.records_allocated,
            self.records_deleted,
            self.records_relocated,
            self.live_records_count()
        )?;
        write!(
            f,
            "{} bytes live payload, {} bytes live capacity, {} bytes total",
            self.live_payload_bytes, self.live_capacity_bytes, self.size_in_bytes
        )
    }
}
