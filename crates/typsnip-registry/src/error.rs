//! Error types for the typsnip registry

use thiserror::Error;
use typsnip::SnippetError;

use crate::storage::blob_storage::StorageError;

/// Datastore errors
#[derive(Error, Debug)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("transaction already finished")]
    TransactionFinished,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => RepoError::NotFound("row".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => RepoError::Duplicate {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
            },
            _ => RepoError::Persistence(err.to_string()),
        }
    }
}

impl From<RepoError> for SnippetError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(what) => SnippetError::NotFound(what),
            other => SnippetError::Storage(other.to_string()),
        }
    }
}

impl From<StorageError> for SnippetError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => SnippetError::NotFound(key),
            other => SnippetError::Storage(other.to_string()),
        }
    }
}

/// Result type for datastore operations
pub type Result<T> = std::result::Result<T, RepoError>;
