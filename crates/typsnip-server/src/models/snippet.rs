//! Snippet-related API models

use serde::Serialize;
use time::OffsetDateTime;
use typsnip::{PackageUsage, Snippet, TagSummary};
use typsnip_registry::ArtifactStore;

#[derive(Debug, Serialize)]
pub struct VersionSummary {
    pub version: String,
    pub success: bool,
}

/// Snippet as returned by the API
#[derive(Debug, Serialize)]
pub struct SnippetResponse {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub content: String,
    pub image_url: Option<String>,
    pub is_public: bool,
    pub author: Option<String>,
    pub copy_recommendation: Option<String>,
    pub versions: Vec<VersionSummary>,
    pub packages: Vec<PackageUsage>,
    pub tags: Vec<TagSummary>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SnippetResponse {
    pub fn from_snippet(snippet: Snippet, app_url: &str) -> Self {
        let mut versions: Vec<VersionSummary> = snippet
            .versions
            .iter()
            .map(|v| VersionSummary {
                version: v.version.clone(),
                success: v.success,
            })
            .collect();
        // newest first
        versions.sort_by(|a, b| typsnip::version::compare(&b.version, &a.version));

        Self {
            image_url: snippet
                .image
                .as_deref()
                .map(|image| ArtifactStore::public_url(app_url, image)),
            id: snippet.public_id,
            title: snippet.title,
            description: snippet.description,
            content: snippet.content,
            is_public: snippet.is_public,
            author: snippet.author,
            copy_recommendation: snippet.copy_recommendation,
            versions,
            packages: snippet.packages,
            tags: snippet.tags,
            deleted_at: snippet.deleted_at,
            created_at: snippet.created_at,
            updated_at: snippet.updated_at,
        }
    }
}
