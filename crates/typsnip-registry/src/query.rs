//! Snippet listing filters
//!
//! A [`SnippetQuery`] is built by chaining value-returning methods and is
//! interpreted by each [`SnippetStore`](crate::store::SnippetStore).

use serde::{Deserialize, Serialize};
use typsnip::{Snippet, version};

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Package a snippet must use, optionally pinned to a package version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFilter {
    pub namespace: String,
    pub name: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnippetQuery {
    pub tags: Vec<String>,
    pub owner_id: Option<i64>,
    pub engine_version: Option<String>,
    pub package: Option<PackageFilter>,
    pub search: Option<String>,
    /// `None` lists public snippets only, `Some(id)` adds that user's private ones
    pub viewer_id: Option<i64>,
    pub with_trashed: bool,
    pub sort_by: SortBy,
    pub order: SortOrder,
    pub page: u32,
    pub limit: u32,
}

impl Default for SnippetQuery {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            owner_id: None,
            engine_version: None,
            package: None,
            search: None,
            viewer_id: None,
            with_trashed: false,
            sort_by: SortBy::default(),
            order: SortOrder::default(),
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl SnippetQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only snippets carrying every tag in `tags` (tag public ids)
    pub fn tagged(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn owned_by(mut self, owner_id: i64) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    /// Only snippets with a successful render in `engine_version`
    pub fn rendered_with(mut self, engine_version: impl Into<String>) -> Self {
        self.engine_version = Some(engine_version.into());
        self
    }

    pub fn using_package(mut self, package: PackageFilter) -> Self {
        self.package = Some(package);
        self
    }

    /// Case-insensitive match on title or description
    pub fn matching(mut self, search: impl Into<String>) -> Self {
        let search = search.into();
        self.search = (!search.trim().is_empty()).then(|| search.trim().to_string());
        self
    }

    pub fn visible_to(mut self, viewer_id: Option<i64>) -> Self {
        self.viewer_id = viewer_id;
        self
    }

    pub fn with_trashed(mut self) -> Self {
        self.with_trashed = true;
        self
    }

    pub fn sorted(mut self, sort_by: SortBy, order: SortOrder) -> Self {
        self.sort_by = sort_by;
        self.order = order;
        self
    }

    /// Pages are 1-based; the limit is clamped to `1..=MAX_PAGE_SIZE`
    pub fn page(mut self, page: u32, limit: u32) -> Self {
        self.page = page.max(1);
        self.limit = limit.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }

    /// In-memory evaluation of every filter except paging and sorting
    pub fn matches(&self, snippet: &Snippet) -> bool {
        if !self.with_trashed && snippet.deleted_at.is_some() {
            return false;
        }

        if !snippet.is_public && self.viewer_id != Some(snippet.created_by_id) {
            return false;
        }

        if self.owner_id.is_some_and(|owner| owner != snippet.created_by_id) {
            return false;
        }

        if !self
            .tags
            .iter()
            .all(|tag| snippet.tags.iter().any(|t| &t.public_id == tag))
        {
            return false;
        }

        if let Some(engine_version) = &self.engine_version {
            let rendered = snippet.versions.iter().any(|v| {
                v.success && v.deleted_at.is_none() && version::same(&v.version, engine_version)
            });
            if !rendered {
                return false;
            }
        }

        if let Some(filter) = &self.package {
            let used = snippet.packages.iter().any(|p| {
                p.namespace == filter.namespace
                    && p.name == filter.name
                    && filter.version.as_ref().is_none_or(|v| &p.version == v)
            });
            if !used {
                return false;
            }
        }

        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let in_title = snippet.title.to_lowercase().contains(&needle);
            let in_description = snippet
                .description
                .as_ref()
                .is_some_and(|d| d.to_lowercase().contains(&needle));
            if !in_title && !in_description {
                return false;
            }
        }

        true
    }
}

/// One page of listed snippets
#[derive(Debug, Clone, Serialize)]
pub struct SnippetPage {
    pub snippets: Vec<Snippet>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}
