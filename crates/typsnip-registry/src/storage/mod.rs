//! Blob storage backends for rendered artifacts

pub mod blob_storage;

pub use blob_storage::{BlobStorage, MemoryStorage, StorageError};

#[cfg(feature = "fs")]
pub mod fs_storage;

// S3 implementation
#[cfg(feature = "s3")]
pub mod s3_storage;
