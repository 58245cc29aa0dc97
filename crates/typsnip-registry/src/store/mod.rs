//! Snippet datastore abstraction
//!
//! Relational snippet data is written inside a [`SnippetTransaction`].
//! User budgets are not: stores also implement
//! [`BudgetLedger`](typsnip::BudgetLedger), whose writes land immediately and
//! survive a rollback of the surrounding transaction.

use async_trait::async_trait;
use typsnip::{NewSnippet, PackageRef, Snippet, User, VersionRecord};

use crate::error::Result;
use crate::query::{SnippetPage, SnippetQuery};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemorySnippetStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresSnippetStore;

#[async_trait]
pub trait SnippetStore: Send + Sync {
    /// Open a transaction for one create/update/delete workflow
    async fn begin(&self) -> Result<Box<dyn SnippetTransaction>>;

    /// Load a snippet with its versions, packages and tags
    async fn find_snippet(&self, public_id: &str, with_trashed: bool) -> Result<Option<Snippet>>;

    /// Whether a live snippet other than `excluding` already uses `title`
    /// (case-insensitive)
    async fn title_taken(&self, title: &str, excluding: Option<i64>) -> Result<bool>;

    async fn list_snippets(&self, query: &SnippetQuery) -> Result<SnippetPage>;

    /// Hard-delete every snippet of `owner_id`, trashed ones included.
    /// Returns the number of removed snippets.
    async fn purge_owner(&self, owner_id: i64) -> Result<u64>;
}

/// Unit of work over snippet rows. Dropping an unfinished transaction
/// discards its writes.
#[async_trait]
pub trait SnippetTransaction: Send {
    async fn insert_snippet(&mut self, snippet: &NewSnippet) -> Result<i64>;

    /// Write the scalar columns of `snippet` (title, content, image, flags,
    /// `deleted_at`); relations are synced separately.
    async fn update_snippet(&mut self, snippet: &Snippet) -> Result<()>;

    /// Replace the snippet's tags with the tags named by their public ids.
    /// Unknown ids are ignored.
    async fn sync_tags(&mut self, snippet_id: i64, tag_public_ids: &[String]) -> Result<()>;

    async fn find_package(&mut self, package: &PackageRef) -> Result<Option<i64>>;

    /// Replace the snippet's package relations with `(package id, package version)` pairs
    async fn sync_packages(&mut self, snippet_id: i64, packages: &[(i64, String)]) -> Result<()>;

    async fn list_versions(&mut self, snippet_id: i64) -> Result<Vec<VersionRecord>>;

    /// Create or overwrite the row of `(snippet_id, version)`
    async fn upsert_version(&mut self, snippet_id: i64, version: &str, success: bool) -> Result<()>;

    async fn delete_version(&mut self, version_id: i64) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// Resolves bearer tokens to users
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Option<User>>;
}

/// Hex SHA-256 of an access token, the form tokens are stored in
pub fn hash_token(token: &str) -> String {
    use sha2::{Digest, Sha256};
    Sha256::digest(token.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
