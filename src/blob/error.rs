//! Blob storage error types.

use crate::blob::record::RecordId;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobStorageError {
    /// Failure reported by the underlying paged storage. Never retried.
    #[error("I/O error: {0}")]
    Io(#[from] StorageError),

    /// The file is not a blob storage this version understands.
    #[error("Unrecognized storage format: {0}")]
    Format(String),

    #[error("Corrupted record at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    /// The id was never allocated.
    #[error("Record {0} not found")]
    NotFound(RecordId),

    /// The id existed but resolves to a deleted record.
    #[error("Record {0} has been deleted")]
    Deleted(RecordId),

    #[error("Payload of {requested} bytes exceeds maximum record capacity of {max} bytes")]
    Capacity { requested: usize, max: usize },

    /// Record ids are exhausted: the next slot would start past the addressable range.
    #[error("Storage is full: no record id for offset {offset}")]
    StorageFull { offset: u64 },

    #[error("Blob storage is closed")]
    Closed,
}

impl BlobStorageError {
    pub(crate) fn corruption(offset: u64, reason: impl Into<String>) -> Self {
        BlobStorageError::Corruption {
            offset,
            reason: reason.into(),
        }
    }
}

pub type BlobResult<T> = Result<T, BlobStorageError>;
