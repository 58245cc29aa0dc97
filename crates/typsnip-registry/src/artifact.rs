//! Rendered artifact storage
//!
//! Every successful render is written under a fresh key
//! `<snippetPublicId>-<randomId>`; keys are never reused, so a new render
//! never overwrites an older artifact. Superseded artifacts are not removed.

use std::sync::Arc;

use tracing::info;
use typsnip::entities::new_public_id;

use crate::storage::{BlobStorage, StorageError};

/// Directory of snippet artifacts inside the blob store
pub const ARTIFACT_PREFIX: &str = "snippets";

/// Stores the winning SVG of a render batch
#[derive(Clone)]
pub struct ArtifactStore {
    blobs: Arc<dyn BlobStorage>,
}

impl ArtifactStore {
    pub fn new(blobs: Arc<dyn BlobStorage>) -> Self {
        Self { blobs }
    }

    /// Fresh image key for a snippet
    pub fn new_image_key(snippet_public_id: &str) -> String {
        format!("{}-{}", snippet_public_id, new_public_id())
    }

    /// Blob key holding the SVG of `image`
    pub fn blob_key(image: &str) -> String {
        format!("{}/{}.svg", ARTIFACT_PREFIX, image)
    }

    /// Public URL the site serves `image` under
    pub fn public_url(app_url: &str, image: &str) -> String {
        format!("{}/uploads/{}", app_url.trim_end_matches('/'), Self::blob_key(image))
    }

    /// Store `svg` as a new artifact of the snippet and return its image key
    pub async fn put(&self, snippet_public_id: &str, svg: &str) -> Result<String, StorageError> {
        let image = Self::new_image_key(snippet_public_id);
        self.blobs
            .put(&Self::blob_key(&image), svg.as_bytes().to_vec())
            .await?;
        info!("Stored artifact {} ({} bytes)", image, svg.len());
        Ok(image)
    }

    /// Read the SVG stored for `image`
    pub async fn get(&self, image: &str) -> Result<Vec<u8>, StorageError> {
        if image.contains('/') || image.contains("..") {
            return Err(StorageError::InvalidKey(image.to_string()));
        }
        self.blobs.get(&Self::blob_key(image)).await
    }

    pub async fn exists(&self, image: &str) -> Result<bool, StorageError> {
        self.blobs.exists(&Self::blob_key(image)).await
    }
}
