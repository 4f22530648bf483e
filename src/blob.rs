//! Record-oriented blob storage.
//!
//! Maps small integer [`RecordId`]s to variable-length payloads. The file is a
//! fixed storage header followed by a contiguous run of record slots:
//!
//! ```text
//! ┌──────────────────┬──────────────┬──────────────┬─────┬─────────┬──────────────┐
//! │ storage header   │ slot         │ slot         │ ... │ padding │ slot         │ ...
//! │ (64 bytes)       │ hdr+capacity │ hdr+capacity │     │         │ (next page)  │
//! └──────────────────┴──────────────┴──────────────┴─────┴─────────┴──────────────┘
//! ```
//!
//! A record id is its slot offset divided by 8, so no id → offset index
//! exists and the whole file can be rebuilt from a linear scan. A record that
//! outgrows its slot is copied to a new one and the old slot becomes a
//! redirect, so ids handed out earlier keep working.

pub mod allocation;
pub mod engine;
pub mod error;
pub mod header;
pub mod record;
pub mod scan;
pub mod stats;

pub use allocation::{AllocationStrategy, ExactFit, FixedPercent, SizeBuckets};
pub use engine::BlobStorage;
pub use error::{BlobResult, BlobStorageError};
pub use header::STORAGE_VERSION_CURRENT;
pub use record::{RecordHeader, RecordId, RecordState};
pub use scan::{RecordIter, ScannedRecord};
pub use stats::BlobStorageStatistics;
