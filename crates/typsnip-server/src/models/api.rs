//! Common API types and utilities
use serde::{Deserialize, Serialize};
use typsnip_registry::{PackageFilter, SnippetQuery, SortBy, SortOrder};

use crate::error::{ApiError, Result};

/// Standard pagination response
#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub pagination: PaginationInfo,
}

/// Pagination metadata
#[derive(Debug, Serialize)]
pub struct PaginationInfo {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub has_more: bool,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, page: u32, limit: u32, total: u64) -> Self {
        let seen = u64::from(page.saturating_sub(1)) * u64::from(limit) + data.len() as u64;
        Self {
            data,
            pagination: PaginationInfo {
                page,
                limit,
                total,
                has_more: seen < total,
            },
        }
    }
}

/// Standard API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            message: None,
        }
    }

    pub fn with_message(data: T, message: String) -> Self {
        Self {
            data,
            message: Some(message),
        }
    }
}

/// Query parameters of `GET /v1/snippets`
#[derive(Debug, Default, Deserialize)]
pub struct ListSnippetsQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub search: Option<String>,
    /// Comma separated tag ids
    pub tags: Option<String>,
    /// Only the caller's own snippets
    #[serde(default)]
    pub mine: bool,
    /// Engine version with a successful render
    pub version: Option<String>,
    /// `namespace/name` or `namespace/name:version`, optionally `@`-prefixed
    pub package: Option<String>,
    pub sort_by: Option<SortBy>,
    pub order: Option<SortOrder>,
    #[serde(default)]
    pub with_trashed: bool,
}

/// Parse `@preview/cetz:0.2.2` style package references
pub fn parse_package_filter(raw: &str) -> Result<PackageFilter> {
    let raw = raw.trim().trim_start_matches('@');
    let (path, version) = match raw.split_once(':') {
        Some((path, version)) => (path, Some(version.to_string())),
        None => (raw, None),
    };
    match path.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => Ok(PackageFilter {
            namespace: namespace.to_string(),
            name: name.to_string(),
            version: version.filter(|v| !v.is_empty()),
        }),
        _ => Err(ApiError::bad_request(&format!(
            "Invalid package reference '{}', expected namespace/name[:version]",
            raw
        ))),
    }
}

impl ListSnippetsQuery {
    /// Build the store query; `viewer_id` is needed for `mine`
    pub fn into_query(self, viewer_id: Option<i64>) -> Result<SnippetQuery> {
        let mut query = SnippetQuery::new().page(
            self.page.unwrap_or(1),
            self.limit.unwrap_or(typsnip_registry::query::DEFAULT_PAGE_SIZE),
        );

        if let Some(search) = self.search {
            query = query.matching(search);
        }
        if let Some(tags) = self.tags {
            let tags: Vec<String> = tags
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            query = query.tagged(tags);
        }
        if self.mine {
            let viewer = viewer_id.ok_or(ApiError::Unauthorized)?;
            query = query.owned_by(viewer);
        }
        if let Some(version) = self.version {
            query = query.rendered_with(version);
        }
        if let Some(package) = self.package {
            query = query.using_package(parse_package_filter(&package)?);
        }
        if self.sort_by.is_some() || self.order.is_some() {
            query = query.sorted(self.sort_by.unwrap_or_default(), self.order.unwrap_or_default());
        }
        if self.with_trashed {
            query = query.with_trashed();
        }
        Ok(query)
    }
}
