//! S3-compatible artifact storage using the MinIO client
//!
//! Works with AWS S3, MinIO, and any S3-compatible object storage.

use async_trait::async_trait;
use bytes::Bytes;
use minio::s3::{
    client::Client, creds::StaticProvider, http::BaseUrl, segmented_bytes::SegmentedBytes,
    types::S3Api,
};
use std::str::FromStr;
use tracing::info;

use super::blob_storage::{BlobStorage, StorageError, validate_key};

/// S3-compatible storage implementation using MinIO client
pub struct S3Storage {
    client: Client,
    bucket: String,
}

fn is_not_found(message: &str) -> bool {
    message.contains("NoSuchKey") || message.contains("404")
}

impl S3Storage {
    /// Create a new S3 storage instance
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Create S3 storage from environment variables
    ///
    /// Expects:
    /// - S3_BUCKET
    /// - S3_ACCESS_KEY_ID
    /// - S3_SECRET_ACCESS_KEY
    /// - S3_ENDPOINT_URL (for S3-compatible services like MinIO)
    pub fn from_env() -> Result<Self, StorageError> {
        let var = |name: &str| {
            std::env::var(name).map_err(|_| {
                StorageError::Backend(format!("{} environment variable not set", name))
            })
        };

        let bucket = var("S3_BUCKET")?;
        let access_key = var("S3_ACCESS_KEY_ID")?;
        let secret_key = var("S3_SECRET_ACCESS_KEY")?;
        let endpoint_url = var("S3_ENDPOINT_URL")?;

        let base_url = BaseUrl::from_str(&endpoint_url)
            .map_err(|e| StorageError::Backend(format!("Invalid S3_ENDPOINT_URL: {}", e)))?;

        let creds_provider = StaticProvider::new(&access_key, &secret_key, None);

        let client = Client::new(base_url, Some(Box::new(creds_provider)), None, None)
            .map_err(|e| StorageError::Backend(format!("Failed to create S3 client: {}", e)))?;

        Ok(Self::new(client, bucket))
    }

    /// Ensure bucket exists (create if it doesn't)
    pub async fn ensure_bucket(&self) -> Result<(), StorageError> {
        let response = self
            .client
            .bucket_exists(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                StorageError::Backend(format!("Failed to check bucket '{}': {}", self.bucket, e))
            })?;

        if response.exists {
            return Ok(());
        }

        self.client
            .create_bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                StorageError::Backend(format!("Failed to create bucket '{}': {}", self.bucket, e))
            })?;
        info!("Created artifact bucket '{}'", self.bucket);

        Ok(())
    }
}

#[async_trait]
impl BlobStorage for S3Storage {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        validate_key(key)?;

        let bytes = SegmentedBytes::from(Bytes::from(data));

        self.client
            .put_object(&self.bucket, key, bytes)
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to put file '{}': {}", key, e)))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;

        let response = self
            .client
            .get_object(&self.bucket, key)
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e.to_string()) {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Backend(format!("Failed to get file '{}': {}", key, e))
                }
            })?;

        let content = response.content.to_segmented_bytes().await.map_err(|e| {
            StorageError::Backend(format!("Failed to read file '{}' content: {}", key, e))
        })?;

        Ok(content.to_bytes().to_vec())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;

        match self.client.stat_object(&self.bucket, key).send().await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e.to_string()) => Ok(false),
            Err(e) => Err(StorageError::Backend(format!(
                "Failed to check existence of file '{}': {}",
                key, e
            ))),
        }
    }
}
