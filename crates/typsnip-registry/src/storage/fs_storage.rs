//! Local filesystem blob storage
//!
//! Keys map to paths below a root directory, so `snippets/x.svg` lands at
//! `<root>/snippets/x.svg`.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::blob_storage::{BlobStorage, StorageError, validate_key};

pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Create storage rooted at `root`, creating the directory if needed
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|e| {
            StorageError::Backend(format!("Failed to create '{}': {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, segment| path.join(segment)))
    }
}

#[async_trait]
impl BlobStorage for FsStorage {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::Backend(format!("Failed to create directory for '{}': {}", key, e))
            })?;
        }

        fs::write(&path, data)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to write '{}': {}", key, e)))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            ErrorKind::PermissionDenied => StorageError::AccessDenied(key.to_string()),
            _ => StorageError::Backend(format!("Failed to read '{}': {}", key, e)),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to stat '{}': {}", key, e)))
    }
}
