//! # Typsnip Registry
//!
//! Persistence and workflows around the typsnip core:
//! - Blob storage for rendered SVG artifacts (memory, filesystem, S3)
//! - Snippet datastore with transactions (memory, PostgreSQL)
//! - [`SnippetService`] create/update/get/list/delete workflows that drive
//!   the multi-version renderer against each user's computation budget
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use typsnip::{HttpRenderClient, RenderSettings};
//! use typsnip_registry::storage::MemoryStorage;
//! use typsnip_registry::store::MemorySnippetStore;
//! use typsnip_registry::{CreateSnippet, SnippetService};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemorySnippetStore::new());
//! let service = SnippetService::new(
//!     store.clone(),
//!     store.clone(),
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(HttpRenderClient::new("http://localhost:3000")?),
//!     RenderSettings::default(),
//! );
//!
//! let mut user = store.create_user("alice")?;
//! let snippet = service
//!     .create(
//!         &mut user,
//!         CreateSnippet {
//!             title: "Striped table".into(),
//!             description: None,
//!             content: "#table(columns: 2, fill: (_, y) => if calc.odd(y) { gray })[a][b]".into(),
//!             is_public: true,
//!             author: None,
//!             copy_recommendation: None,
//!             tags: vec![],
//!             packages: vec![],
//!             versions: vec!["0.13.0".into(), "0.13.1".into()],
//!         },
//!     )
//!     .await?;
//!
//! println!("Rendered snippet {} as {:?}", snippet.public_id, snippet.image);
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod error;
pub mod query;
pub mod service;
pub mod storage;
pub mod store;

pub use artifact::ArtifactStore;
pub use error::RepoError;
pub use query::{PackageFilter, SnippetPage, SnippetQuery, SortBy, SortOrder};
pub use service::{CreateSnippet, SnippetService, UpdateSnippet};
pub use storage::{BlobStorage, MemoryStorage, StorageError};
pub use store::{Authenticator, MemorySnippetStore, SnippetStore, SnippetTransaction};

#[cfg(feature = "fs")]
pub use storage::fs_storage::FsStorage;
#[cfg(feature = "postgres")]
pub use store::PostgresSnippetStore;
#[cfg(feature = "s3")]
pub use storage::s3_storage::S3Storage;
