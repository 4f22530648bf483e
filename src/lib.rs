pub mod blob;
pub mod config;
pub mod storage;

pub use blob::{BlobStorage, BlobStorageError, RecordId};
pub use config::BlobStorageConfig;
