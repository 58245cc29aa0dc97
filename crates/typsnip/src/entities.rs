//! Core entities: users, snippets, their render versions and package usage

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Length of public identifiers and artifact random suffixes
pub const PUBLIC_ID_LEN: usize = 16;

/// Generate a random 16-character public identifier
pub fn new_public_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(PUBLIC_ID_LEN);
    id
}

/// Entities that are flagged instead of erased
pub trait SoftDelete {
    fn deleted_at(&self) -> Option<OffsetDateTime>;
    fn set_deleted_at(&mut self, at: Option<OffsetDateTime>);
}

pub fn is_deleted<T: SoftDelete>(entity: &T) -> bool {
    entity.deleted_at().is_some()
}

pub fn soft_delete<T: SoftDelete>(entity: &mut T, now: OffsetDateTime) {
    if !is_deleted(entity) {
        entity.set_deleted_at(Some(now));
    }
}

pub fn restore<T: SoftDelete>(entity: &mut T) {
    entity.set_deleted_at(None);
}

macro_rules! impl_soft_delete {
    ($($ty:ty),*) => {
        $(
            impl SoftDelete for $ty {
                fn deleted_at(&self) -> Option<OffsetDateTime> {
                    self.deleted_at
                }

                fn set_deleted_at(&mut self, at: Option<OffsetDateTime>) {
                    self.deleted_at = at;
                }
            }
        )*
    };
}

/// A registered user with a daily computation budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub public_id: String,
    pub username: String,
    /// Remaining render time for the current day, in milliseconds
    pub computation_time: i64,
    /// Next instant at which the budget refills
    #[serde(with = "time::serde::rfc3339")]
    pub computation_time_reset: OffsetDateTime,
    /// Capability strings such as `snippets:create`
    pub capabilities: Vec<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

/// One render attempt record of a snippet for one engine version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: i64,
    pub snippet_id: i64,
    /// Render-engine version, e.g. `0.13.1`
    pub version: String,
    pub success: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A Typst package referenced by `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageRef {
    pub namespace: String,
    pub name: String,
}

/// Package used by a snippet, with the package version (not the engine version)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageUsage {
    pub namespace: String,
    pub name: String,
    pub version: String,
}

impl PackageUsage {
    pub fn package_ref(&self) -> PackageRef {
        PackageRef {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSummary {
    pub public_id: String,
    pub name: String,
}

/// A user-authored piece of Typst source plus its rendered artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snippet {
    pub id: i64,
    pub public_id: String,
    pub title: String,
    pub description: Option<String>,
    pub content: String,
    /// Artifact key of the currently displayed render
    pub image: Option<String>,
    pub is_public: bool,
    pub author: Option<String>,
    pub copy_recommendation: Option<String>,
    pub created_by_id: i64,
    pub versions: Vec<VersionRecord>,
    pub packages: Vec<PackageUsage>,
    pub tags: Vec<TagSummary>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Field values for a snippet row that does not exist yet
#[derive(Debug, Clone)]
pub struct NewSnippet {
    pub public_id: String,
    pub title: String,
    pub description: Option<String>,
    pub content: String,
    pub is_public: bool,
    pub author: Option<String>,
    pub copy_recommendation: Option<String>,
    pub created_by_id: i64,
}

impl_soft_delete!(User, VersionRecord, Snippet);
