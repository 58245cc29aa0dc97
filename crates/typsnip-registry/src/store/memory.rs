//! In-memory snippet store for tests and local development
//!
//! A transaction works on a snapshot of the snippet tables and swaps it in on
//! commit. Transactions run one at a time: `begin` waits until the previous
//! one committed or rolled back. Users live outside the snapshot, so budget
//! writes are never rolled back.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;
use typsnip::entities::new_public_id;
use typsnip::policy::default_capabilities;
use typsnip::{
    BudgetLedger, BudgetState, NewSnippet, PackageRef, PackageUsage, Snippet, SnippetError, TagSummary, User,
    VersionRecord, version,
};
use uuid::Uuid;

use super::{Authenticator, SnippetStore, SnippetTransaction, hash_token};
use crate::error::{RepoError, Result};
use crate::query::{SnippetPage, SnippetQuery, SortBy, SortOrder};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| RepoError::Persistence("lock poisoned".into()))
}

#[derive(Debug, Clone)]
struct PackageUse {
    snippet_id: i64,
    package_id: i64,
    version: String,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    next_id: i64,
    /// Snippet rows without relations
    snippets: BTreeMap<i64, Snippet>,
    versions: BTreeMap<i64, VersionRecord>,
    tags: BTreeMap<i64, TagSummary>,
    snippet_tags: Vec<(i64, i64)>,
    packages: BTreeMap<i64, PackageRef>,
    package_uses: Vec<PackageUse>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn assemble(&self, row: &Snippet) -> Snippet {
        let mut snippet = row.clone();
        snippet.versions = self
            .versions
            .values()
            .filter(|v| v.snippet_id == row.id)
            .cloned()
            .collect();
        snippet.tags = self
            .snippet_tags
            .iter()
            .filter(|(snippet_id, _)| *snippet_id == row.id)
            .filter_map(|(_, tag_id)| self.tags.get(tag_id).cloned())
            .collect();
        snippet.packages = self
            .package_uses
            .iter()
            .filter(|u| u.snippet_id == row.id)
            .filter_map(|u| {
                self.packages.get(&u.package_id).map(|p| PackageUsage {
                    namespace: p.namespace.clone(),
                    name: p.name.clone(),
                    version: u.version.clone(),
                })
            })
            .collect();
        snippet
    }

    fn remove_snippet(&mut self, snippet_id: i64) {
        self.snippets.remove(&snippet_id);
        self.versions.retain(|_, v| v.snippet_id != snippet_id);
        self.snippet_tags.retain(|(s, _)| *s != snippet_id);
        self.package_uses.retain(|u| u.snippet_id != snippet_id);
    }
}

#[derive(Debug, Default)]
struct Accounts {
    next_id: i64,
    users: HashMap<i64, User>,
    /// token hash -> user id
    tokens: HashMap<String, i64>,
}

/// Snippet store kept entirely in process memory
#[derive(Debug, Default, Clone)]
pub struct MemorySnippetStore {
    tables: Arc<Mutex<Tables>>,
    accounts: Arc<Mutex<Accounts>>,
    /// Held by the open transaction and by direct table writes
    writer: Arc<AsyncMutex<()>>,
}

impl MemorySnippetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user with the default capabilities. The budget refills on
    /// first use.
    pub fn create_user(&self, username: &str) -> Result<User> {
        let mut accounts = lock(&self.accounts)?;
        accounts.next_id += 1;
        let user = User {
            id: accounts.next_id,
            public_id: new_public_id(),
            username: username.to_string(),
            computation_time: 0,
            computation_time_reset: OffsetDateTime::UNIX_EPOCH,
            capabilities: default_capabilities(),
            deleted_at: None,
        };
        accounts.users.insert(user.id, user.clone());
        Ok(user)
    }

    /// Insert or replace a user row as-is
    pub fn put_user(&self, user: User) -> Result<()> {
        let mut accounts = lock(&self.accounts)?;
        accounts.next_id = accounts.next_id.max(user.id);
        accounts.users.insert(user.id, user);
        Ok(())
    }

    pub fn user(&self, id: i64) -> Result<Option<User>> {
        Ok(lock(&self.accounts)?.users.get(&id).cloned())
    }

    /// Issue a new access token for `user_id` and return it in plain text
    pub fn issue_token(&self, user_id: i64) -> Result<String> {
        let token = Uuid::new_v4().simple().to_string();
        lock(&self.accounts)?
            .tokens
            .insert(hash_token(&token), user_id);
        Ok(token)
    }

    /// Tables for a write outside a transaction; fails while one is open
    fn direct_write(&self) -> Result<(tokio::sync::MutexGuard<'_, ()>, MutexGuard<'_, Tables>)> {
        let writer = self
            .writer
            .try_lock()
            .map_err(|_| RepoError::Persistence("a transaction is open".into()))?;
        Ok((writer, lock(&self.tables)?))
    }

    pub fn insert_tag(&self, name: &str) -> Result<TagSummary> {
        let (_writer, mut tables) = self.direct_write()?;
        let id = tables.next_id();
        let tag = TagSummary {
            public_id: new_public_id(),
            name: name.to_string(),
        };
        tables.tags.insert(id, tag.clone());
        Ok(tag)
    }

    pub fn insert_package(&self, namespace: &str, name: &str) -> Result<i64> {
        let (_writer, mut tables) = self.direct_write()?;
        let id = tables.next_id();
        tables.packages.insert(
            id,
            PackageRef {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
        );
        Ok(id)
    }
}

#[async_trait]
impl SnippetStore for MemorySnippetStore {
    async fn begin(&self) -> Result<Box<dyn SnippetTransaction>> {
        let writer = self.writer.clone().lock_owned().await;
        let snapshot = lock(&self.tables)?.clone();
        Ok(Box::new(MemoryTransaction {
            shared: self.tables.clone(),
            working: Some(snapshot),
            writer: Some(writer),
        }))
    }

    async fn find_snippet(&self, public_id: &str, with_trashed: bool) -> Result<Option<Snippet>> {
        let tables = lock(&self.tables)?;
        Ok(tables
            .snippets
            .values()
            .find(|s| s.public_id == public_id && (with_trashed || s.deleted_at.is_none()))
            .map(|row| tables.assemble(row)))
    }

    async fn title_taken(&self, title: &str, excluding: Option<i64>) -> Result<bool> {
        let needle = title.to_lowercase();
        Ok(lock(&self.tables)?.snippets.values().any(|s| {
            s.deleted_at.is_none()
                && Some(s.id) != excluding
                && s.title.to_lowercase() == needle
        }))
    }

    async fn list_snippets(&self, query: &SnippetQuery) -> Result<SnippetPage> {
        let tables = lock(&self.tables)?;
        let mut matching: Vec<Snippet> = tables
            .snippets
            .values()
            .map(|row| tables.assemble(row))
            .filter(|s| query.matches(s))
            .collect();

        matching.sort_by(|a, b| {
            let ordering = match query.sort_by {
                SortBy::CreatedAt => a.created_at.cmp(&b.created_at),
                SortBy::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            }
            .then(a.id.cmp(&b.id));
            match query.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = matching.len() as u64;
        let snippets = matching
            .into_iter()
            .skip(usize::try_from(query.offset()).unwrap_or(usize::MAX))
            .take(query.limit as usize)
            .collect();

        Ok(SnippetPage {
            snippets,
            total,
            page: query.page,
            limit: query.limit,
        })
    }

    async fn purge_owner(&self, owner_id: i64) -> Result<u64> {
        let _writer = self.writer.lock().await;
        let mut tables = lock(&self.tables)?;
        let ids: Vec<i64> = tables
            .snippets
            .values()
            .filter(|s| s.created_by_id == owner_id)
            .map(|s| s.id)
            .collect();
        for id in &ids {
            tables.remove_snippet(*id);
        }
        Ok(ids.len() as u64)
    }
}

#[async_trait]
impl BudgetLedger for MemorySnippetStore {
    async fn refill_if_due(
        &self,
        user_id: i64,
        allotment: i64,
        now: OffsetDateTime,
        next_reset: OffsetDateTime,
    ) -> typsnip::Result<BudgetState> {
        let mut accounts = lock(&self.accounts)?;
        let row = accounts
            .users
            .get_mut(&user_id)
            .ok_or_else(|| SnippetError::not_found("user"))?;
        if now >= row.computation_time_reset {
            row.computation_time = allotment;
            row.computation_time_reset = next_reset;
        }
        Ok(BudgetState {
            computation_time: row.computation_time,
            computation_time_reset: row.computation_time_reset,
        })
    }

    async fn charge(&self, user_id: i64, amount: i64) -> typsnip::Result<i64> {
        let mut accounts = lock(&self.accounts)?;
        let row = accounts
            .users
            .get_mut(&user_id)
            .ok_or_else(|| SnippetError::not_found("user"))?;
        row.computation_time = row.computation_time.saturating_sub(amount).max(0);
        Ok(row.computation_time)
    }

    async fn balance(&self, user_id: i64) -> typsnip::Result<i64> {
        lock(&self.accounts)?
            .users
            .get(&user_id)
            .map(|row| row.computation_time)
            .ok_or_else(|| SnippetError::not_found("user"))
    }
}

#[async_trait]
impl Authenticator for MemorySnippetStore {
    async fn authenticate(&self, token: &str) -> Result<Option<User>> {
        let accounts = lock(&self.accounts)?;
        Ok(accounts
            .tokens
            .get(&hash_token(token))
            .and_then(|id| accounts.users.get(id))
            .filter(|user| user.deleted_at.is_none())
            .cloned())
    }
}

struct MemoryTransaction {
    shared: Arc<Mutex<Tables>>,
    working: Option<Tables>,
    /// Released when the transaction finishes or is dropped
    writer: Option<OwnedMutexGuard<()>>,
}

impl MemoryTransaction {
    fn tables(&mut self) -> Result<&mut Tables> {
        self.working.as_mut().ok_or(RepoError::TransactionFinished)
    }
}

#[async_trait]
impl SnippetTransaction for MemoryTransaction {
    async fn insert_snippet(&mut self, new: &NewSnippet) -> Result<i64> {
        let tables = self.tables()?;
        let id = tables.next_id();
        let now = OffsetDateTime::now_utc();
        tables.snippets.insert(
            id,
            Snippet {
                id,
                public_id: new.public_id.clone(),
                title: new.title.clone(),
                description: new.description.clone(),
                content: new.content.clone(),
                image: None,
                is_public: new.is_public,
                author: new.author.clone(),
                copy_recommendation: new.copy_recommendation.clone(),
                created_by_id: new.created_by_id,
                versions: Vec::new(),
                packages: Vec::new(),
                tags: Vec::new(),
                deleted_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn update_snippet(&mut self, snippet: &Snippet) -> Result<()> {
        let row = self
            .tables()?
            .snippets
            .get_mut(&snippet.id)
            .ok_or_else(|| RepoError::NotFound(format!("snippet {}", snippet.public_id)))?;

        row.title = snippet.title.clone();
        row.description = snippet.description.clone();
        row.content = snippet.content.clone();
        row.image = snippet.image.clone();
        row.is_public = snippet.is_public;
        row.author = snippet.author.clone();
        row.copy_recommendation = snippet.copy_recommendation.clone();
        row.deleted_at = snippet.deleted_at;
        row.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn sync_tags(&mut self, snippet_id: i64, tag_public_ids: &[String]) -> Result<()> {
        let tables = self.tables()?;
        let tag_ids: Vec<i64> = tables
            .tags
            .iter()
            .filter(|(_, tag)| tag_public_ids.contains(&tag.public_id))
            .map(|(id, _)| *id)
            .collect();

        tables.snippet_tags.retain(|(s, _)| *s != snippet_id);
        tables
            .snippet_tags
            .extend(tag_ids.into_iter().map(|tag_id| (snippet_id, tag_id)));
        Ok(())
    }

    async fn find_package(&mut self, package: &PackageRef) -> Result<Option<i64>> {
        Ok(self
            .tables()?
            .packages
            .iter()
            .find(|(_, p)| *p == package)
            .map(|(id, _)| *id))
    }

    async fn sync_packages(&mut self, snippet_id: i64, packages: &[(i64, String)]) -> Result<()> {
        let tables = self.tables()?;
        tables.package_uses.retain(|u| u.snippet_id != snippet_id);
        tables
            .package_uses
            .extend(packages.iter().map(|(package_id, version)| PackageUse {
                snippet_id,
                package_id: *package_id,
                version: version.clone(),
            }));
        Ok(())
    }

    async fn list_versions(&mut self, snippet_id: i64) -> Result<Vec<VersionRecord>> {
        Ok(self
            .tables()?
            .versions
            .values()
            .filter(|v| v.snippet_id == snippet_id && v.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn upsert_version(&mut self, snippet_id: i64, engine_version: &str, success: bool) -> Result<()> {
        let tables = self.tables()?;
        let now = OffsetDateTime::now_utc();

        let existing = tables
            .versions
            .values_mut()
            .find(|v| v.snippet_id == snippet_id && version::same(&v.version, engine_version));
        if let Some(row) = existing {
            row.success = success;
            row.deleted_at = None;
            row.updated_at = now;
            return Ok(());
        }

        let id = tables.next_id();
        tables.versions.insert(
            id,
            VersionRecord {
                id,
                snippet_id,
                version: engine_version.to_string(),
                success,
                deleted_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn delete_version(&mut self, version_id: i64) -> Result<()> {
        self.tables()?.versions.remove(&version_id);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let working = self.working.take().ok_or(RepoError::TransactionFinished)?;
        *lock(&self.shared)? = working;
        self.writer.take();
        debug!("Committed in-memory transaction");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.working.take().ok_or(RepoError::TransactionFinished)?;
        self.writer.take();
        debug!("Rolled back in-memory transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_snippet(title: &str, owner: i64) -> NewSnippet {
        NewSnippet {
            public_id: new_public_id(),
            title: title.into(),
            description: None,
            content: "#lorem(20)".into(),
            is_public: true,
            author: None,
            copy_recommendation: None,
            created_by_id: owner,
        }
    }

    #[tokio::test]
    async fn test_commit_and_rollback() {
        let store = MemorySnippetStore::new();

        let mut tx = store.begin().await.unwrap();
        let id = tx.insert_snippet(&new_snippet("Kept", 1)).await.unwrap();
        tx.upsert_version(id, "0.13.0", true).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_snippet(&new_snippet("Dropped", 1)).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(matches!(tx.commit().await, Err(RepoError::TransactionFinished)));

        let page = store.list_snippets(&SnippetQuery::new()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.snippets[0].title, "Kept");
        assert_eq!(page.snippets[0].versions.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_version_overwrites() {
        let store = MemorySnippetStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.insert_snippet(&new_snippet("Versions", 1)).await.unwrap();

        tx.upsert_version(id, "0.13.1", false).await.unwrap();
        tx.upsert_version(id, "0.13.1", true).await.unwrap();

        let versions = tx.list_versions(id).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert!(versions[0].success);
    }

    #[tokio::test]
    async fn test_relations_and_title_check() {
        let store = MemorySnippetStore::new();
        let tag = store.insert_tag("math").unwrap();
        let package = store.insert_package("preview", "cetz").unwrap();

        let snippet = new_snippet("Plots", 1);
        let mut tx = store.begin().await.unwrap();
        let id = tx.insert_snippet(&snippet).await.unwrap();
        tx.sync_tags(id, &[tag.public_id.clone(), "unknown000000000".into()])
            .await
            .unwrap();
        let found = tx
            .find_package(&PackageRef {
                namespace: "preview".into(),
                name: "cetz".into(),
            })
            .await
            .unwrap();
        assert_eq!(found, Some(package));
        tx.sync_packages(id, &[(package, "0.2.2".into())]).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = store.find_snippet(&snippet.public_id, false).await.unwrap().unwrap();
        assert_eq!(loaded.tags, vec![tag]);
        assert_eq!(loaded.packages[0].version, "0.2.2");

        assert!(store.title_taken("PLOTS", None).await.unwrap());
        assert!(!store.title_taken("plots", Some(id)).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_transactions_keep_both_commits() {
        let store = MemorySnippetStore::new();

        let first = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut tx = store.begin().await.unwrap();
                let id = tx.insert_snippet(&new_snippet("First", 1)).await.unwrap();
                tokio::task::yield_now().await;
                tx.commit().await.unwrap();
                id
            })
        };
        let second = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut tx = store.begin().await.unwrap();
                let id = tx.insert_snippet(&new_snippet("Second", 2)).await.unwrap();
                tokio::task::yield_now().await;
                tx.commit().await.unwrap();
                id
            })
        };
        let (first, second) = (first.await.unwrap(), second.await.unwrap());

        assert_ne!(first, second);
        assert_eq!(store.list_snippets(&SnippetQuery::new()).await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_dropped_transaction_releases_writer() {
        let store = MemorySnippetStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_snippet(&new_snippet("Abandoned", 1)).await.unwrap();
        assert!(store.insert_tag("blocked").is_err());
        drop(tx);

        store.insert_tag("free").unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.list_snippets(&SnippetQuery::new()).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_purge_owner() {
        let store = MemorySnippetStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_snippet(&new_snippet("One", 1)).await.unwrap();
        tx.insert_snippet(&new_snippet("Two", 1)).await.unwrap();
        tx.insert_snippet(&new_snippet("Other", 2)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.purge_owner(1).await.unwrap(), 2);
        assert_eq!(store.list_snippets(&SnippetQuery::new()).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_budget_survives_rollback_and_tokens_resolve() {
        let store = MemorySnippetStore::new();
        let mut user = store.create_user("alice").unwrap();

        user.computation_time = 5_000;
        user.computation_time_reset = OffsetDateTime::now_utc() + time::Duration::hours(1);
        store.put_user(user.clone()).unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(store.charge(user.id, 1_234).await.unwrap(), 3_766);
        tx.rollback().await.unwrap();

        assert_eq!(store.user(user.id).unwrap().unwrap().computation_time, 3_766);

        let token = store.issue_token(user.id).unwrap();
        let resolved = store.authenticate(&token).await.unwrap().unwrap();
        assert_eq!(resolved.id, user.id);
        assert!(store.authenticate("bogus").await.unwrap().is_none());
    }
}
