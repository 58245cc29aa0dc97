//! Snippet create/update/delete workflows
//!
//! Each mutating workflow runs in one datastore transaction. Rendering
//! happens while the transaction is open; any error rolls the relational
//! writes back, while budget charges have already been persisted through the
//! ledger and stay spent.

use std::sync::Arc;

use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use typsnip::entities::{new_public_id, soft_delete};
use typsnip::policy::may_act_on;
use typsnip::{
    BudgetLedger, Capability, ComputationBudget, NewSnippet, PackageUsage, RenderBatch,
    RenderSettings, Renderer, Result, Snippet, SnippetError, User, VersionOrchestrator, capable,
    reconcile,
};

use crate::artifact::ArtifactStore;
use crate::query::{SnippetPage, SnippetQuery};
use crate::storage::BlobStorage;
use crate::store::{SnippetStore, SnippetTransaction};

const TITLE_CHARS: (usize, usize) = (3, 60);
const DESCRIPTION_MAX_CHARS: usize = 16_384;
const CONTENT_CHARS: (usize, usize) = (10, 32_768);
const AUTHOR_MAX_CHARS: usize = 100;
const COPY_RECOMMENDATION_MAX_CHARS: usize = 20;
const TAG_ID_CHARS: usize = 16;
const MAX_PACKAGES: usize = 20;
const PACKAGE_NAME_CHARS: (usize, usize) = (1, 255);
const PACKAGE_VERSION_CHARS: (usize, usize) = (1, 12);

fn default_public() -> bool {
    true
}

/// Fields of a new snippet
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSnippet {
    pub title: String,
    pub description: Option<String>,
    pub content: String,
    #[serde(default = "default_public")]
    pub is_public: bool,
    pub author: Option<String>,
    pub copy_recommendation: Option<String>,
    /// Tag public ids
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub packages: Vec<PackageUsage>,
    /// Engine versions to render; empty renders the newest available one
    #[serde(default)]
    pub versions: Vec<String>,
}

/// Partial update; `None` leaves a field untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSnippet {
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub is_public: Option<bool>,
    pub author: Option<String>,
    pub copy_recommendation: Option<String>,
    pub tags: Option<Vec<String>>,
    pub packages: Option<Vec<PackageUsage>>,
    pub versions: Option<Vec<String>>,
}

impl UpdateSnippet {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.content.is_none()
            && self.is_public.is_none()
            && self.author.is_none()
            && self.copy_recommendation.is_none()
            && self.tags.is_none()
            && self.packages.is_none()
            && self.versions.is_none()
    }
}

fn check_chars(field: &str, value: &str, (min, max): (usize, usize)) -> Result<()> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(SnippetError::Validation(format!(
            "{} must be between {} and {} characters",
            field, min, max
        )));
    }
    Ok(())
}

fn check_tags(tags: &[String]) -> Result<()> {
    match tags.iter().find(|t| t.chars().count() != TAG_ID_CHARS) {
        Some(tag) => Err(SnippetError::Validation(format!("invalid tag id '{}'", tag))),
        None => Ok(()),
    }
}

fn check_packages(packages: &[PackageUsage]) -> Result<()> {
    if packages.len() > MAX_PACKAGES {
        return Err(SnippetError::Validation(format!(
            "at most {} packages may be attached",
            MAX_PACKAGES
        )));
    }
    for package in packages {
        check_chars("package namespace", &package.namespace, PACKAGE_NAME_CHARS)?;
        check_chars("package name", &package.name, PACKAGE_NAME_CHARS)?;
        check_chars("package version", &package.version, PACKAGE_VERSION_CHARS)?;
    }
    Ok(())
}

impl CreateSnippet {
    pub fn validate(&self) -> Result<()> {
        check_chars("title", &self.title, TITLE_CHARS)?;
        if let Some(description) = &self.description {
            check_chars("description", description, (0, DESCRIPTION_MAX_CHARS))?;
        }
        check_chars("content", &self.content, CONTENT_CHARS)?;
        if let Some(author) = &self.author {
            check_chars("author", author, (0, AUTHOR_MAX_CHARS))?;
        }
        if let Some(recommendation) = &self.copy_recommendation {
            check_chars("copy recommendation", recommendation, (0, COPY_RECOMMENDATION_MAX_CHARS))?;
        }
        check_tags(&self.tags)?;
        check_packages(&self.packages)
    }
}

impl UpdateSnippet {
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(SnippetError::validation("no fields to update"));
        }
        if let Some(title) = &self.title {
            check_chars("title", title, TITLE_CHARS)?;
        }
        if let Some(description) = &self.description {
            check_chars("description", description, (0, DESCRIPTION_MAX_CHARS))?;
        }
        if let Some(content) = &self.content {
            check_chars("content", content, CONTENT_CHARS)?;
        }
        if let Some(author) = &self.author {
            check_chars("author", author, (0, AUTHOR_MAX_CHARS))?;
        }
        if let Some(recommendation) = &self.copy_recommendation {
            check_chars("copy recommendation", recommendation, (0, COPY_RECOMMENDATION_MAX_CHARS))?;
        }
        if let Some(tags) = &self.tags {
            check_tags(tags)?;
        }
        if let Some(packages) = &self.packages {
            check_packages(packages)?;
        }
        Ok(())
    }
}

/// Entry point for snippet workflows
#[derive(Clone)]
pub struct SnippetService {
    store: Arc<dyn SnippetStore>,
    artifacts: ArtifactStore,
    orchestrator: VersionOrchestrator,
}

impl SnippetService {
    /// `ledger` persists user budgets; usually the same object as `store`.
    pub fn new(
        store: Arc<dyn SnippetStore>,
        ledger: Arc<dyn BudgetLedger>,
        blobs: Arc<dyn BlobStorage>,
        renderer: Arc<dyn Renderer>,
        settings: RenderSettings,
    ) -> Self {
        let budget = ComputationBudget::new(ledger, &settings);
        Self {
            store,
            artifacts: ArtifactStore::new(blobs),
            orchestrator: VersionOrchestrator::new(renderer, budget, settings),
        }
    }

    pub fn settings(&self) -> &RenderSettings {
        self.orchestrator.settings()
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    fn budget(&self) -> &ComputationBudget {
        self.orchestrator.budget()
    }

    /// Map requested versions onto the available list: defaults to the newest
    /// available version, rejects unknown ones, drops duplicates.
    pub fn resolve_versions(&self, requested: &[String]) -> Result<Vec<String>> {
        let settings = self.settings();
        if requested.is_empty() {
            let latest = settings
                .latest_version()
                .ok_or_else(|| SnippetError::validation("no render versions are available"))?;
            return Ok(vec![latest.to_string()]);
        }

        let mut resolved: Vec<String> = Vec::with_capacity(requested.len());
        for wanted in requested {
            let available = settings.canonical_version(wanted).ok_or_else(|| {
                SnippetError::Validation(format!("version {} is not available", wanted))
            })?;
            if !resolved.iter().any(|v| v == available) {
                resolved.push(available.to_string());
            }
        }
        Ok(resolved)
    }

    async fn ensure_title_free(&self, title: &str, excluding: Option<i64>) -> Result<()> {
        if self.store.title_taken(title, excluding).await? {
            return Err(SnippetError::DuplicateTitle(title.to_string()));
        }
        Ok(())
    }

    /// Roll back after a failed workflow step; the step's error wins
    async fn abort(tx: &mut dyn SnippetTransaction, err: &SnippetError) {
        warn!("Rolling back snippet transaction: {}", err);
        if let Err(rollback_err) = tx.rollback().await {
            warn!("Rollback failed: {}", rollback_err);
        }
    }

    async fn load(&self, public_id: &str) -> Result<Snippet> {
        self.store
            .find_snippet(public_id, false)
            .await?
            .ok_or_else(|| SnippetError::NotFound(format!("snippet {}", public_id)))
    }

    /// Create a snippet and render it in every requested version
    pub async fn create(&self, user: &mut User, request: CreateSnippet) -> Result<Snippet> {
        if !capable(user, Capability::SnippetsCreate) {
            return Err(SnippetError::permission_denied("you may not create snippets"));
        }
        self.budget()
            .check_and_maybe_reset(user, OffsetDateTime::now_utc())
            .await?;
        request.validate()?;
        let versions = self.resolve_versions(&request.versions)?;
        self.ensure_title_free(&request.title, None).await?;

        let new = NewSnippet {
            public_id: new_public_id(),
            title: request.title.clone(),
            description: request.description.clone(),
            content: request.content.clone(),
            is_public: request.is_public,
            author: request.author.clone(),
            copy_recommendation: request.copy_recommendation.clone(),
            created_by_id: user.id,
        };

        let mut tx = self.store.begin().await?;
        let result = self
            .apply_create(tx.as_mut(), user, &new, &request, &versions)
            .await;
        if let Err(err) = result {
            Self::abort(tx.as_mut(), &err).await;
            return Err(err);
        }
        tx.commit().await?;

        info!("User {} created snippet {}", user.public_id, new.public_id);
        self.load(&new.public_id).await
    }

    async fn apply_create(
        &self,
        tx: &mut dyn SnippetTransaction,
        user: &mut User,
        new: &NewSnippet,
        request: &CreateSnippet,
        versions: &[String],
    ) -> Result<()> {
        let id = tx.insert_snippet(new).await?;
        tx.sync_tags(id, &request.tags).await?;
        attach_packages(tx, id, &request.packages).await?;

        let batch = self
            .orchestrator
            .render_all(&request.content, versions, user)
            .await?;
        let image = self
            .artifacts
            .put(&new.public_id, &batch.highest_successful.svg)
            .await?;

        let mut row = snippet_row(id, new);
        row.image = Some(image);
        tx.update_snippet(&row).await?;
        record_versions(tx, id, &batch).await
    }

    /// Apply a partial update, re-rendering only what reconciliation asks for
    pub async fn update(
        &self,
        user: &mut User,
        public_id: &str,
        request: UpdateSnippet,
    ) -> Result<Snippet> {
        if !capable(user, Capability::SnippetsEdit) {
            return Err(SnippetError::permission_denied("you may not edit snippets"));
        }
        let snippet = self.load(public_id).await?;
        if !may_act_on(user, snippet.created_by_id) {
            return Err(SnippetError::permission_denied("you may only edit your own snippets"));
        }
        request.validate()?;

        let versions = match &request.versions {
            Some(requested) => Some(self.resolve_versions(requested)?),
            None => None,
        };
        if let Some(title) = &request.title {
            self.ensure_title_free(title, Some(snippet.id)).await?;
        }

        let content_changed = request
            .content
            .as_ref()
            .is_some_and(|content| content != &snippet.content);
        let needs_reconcile = content_changed || versions.is_some();
        if needs_reconcile {
            self.budget()
                .check_and_maybe_reset(user, OffsetDateTime::now_utc())
                .await?;
        }

        let mut tx = self.store.begin().await?;
        let result = self
            .apply_update(tx.as_mut(), user, snippet, &request, versions, content_changed)
            .await;
        if let Err(err) = result {
            Self::abort(tx.as_mut(), &err).await;
            return Err(err);
        }
        tx.commit().await?;

        info!("User {} updated snippet {}", user.public_id, public_id);
        self.load(public_id).await
    }

    async fn apply_update(
        &self,
        tx: &mut dyn SnippetTransaction,
        user: &mut User,
        mut snippet: Snippet,
        request: &UpdateSnippet,
        versions: Option<Vec<String>>,
        content_changed: bool,
    ) -> Result<()> {
        if let Some(title) = &request.title {
            snippet.title = title.clone();
        }
        if let Some(description) = &request.description {
            snippet.description = Some(description.clone());
        }
        if let Some(content) = &request.content {
            snippet.content = content.clone();
        }
        if let Some(is_public) = request.is_public {
            snippet.is_public = is_public;
        }
        if let Some(author) = &request.author {
            snippet.author = Some(author.clone());
        }
        if let Some(recommendation) = &request.copy_recommendation {
            snippet.copy_recommendation = Some(recommendation.clone());
        }
        if let Some(tags) = &request.tags {
            tx.sync_tags(snippet.id, tags).await?;
        }
        if let Some(packages) = &request.packages {
            attach_packages(tx, snippet.id, packages).await?;
        }

        if content_changed || versions.is_some() {
            self.reconcile_versions(tx, user, &mut snippet, versions, content_changed)
                .await?;
        }

        tx.update_snippet(&snippet).await?;
        Ok(())
    }

    async fn reconcile_versions(
        &self,
        tx: &mut dyn SnippetTransaction,
        user: &mut User,
        snippet: &mut Snippet,
        versions: Option<Vec<String>>,
        content_changed: bool,
    ) -> Result<()> {
        let existing = tx.list_versions(snippet.id).await?;
        let requested = match versions {
            Some(requested) => requested,
            None => self.resolve_versions(&[])?,
        };

        let plan = reconcile(&requested, content_changed, &existing)
            .ok_or_else(|| SnippetError::validation("at least one version must be rendered"))?;
        debug!(
            "Reconciled snippet {}: {} to render, {} to delete, highest requested {}",
            snippet.public_id,
            plan.to_render.len(),
            plan.to_delete.len(),
            plan.highest_requested
        );

        for row in &plan.to_delete {
            tx.delete_version(row.id).await?;
        }

        if plan.is_render_free() {
            return Ok(());
        }

        let batch = self
            .orchestrator
            .render_all(&snippet.content, &plan.to_render, user)
            .await?;

        if plan.should_update_image(&batch.highest_successful.version) {
            let image = self
                .artifacts
                .put(&snippet.public_id, &batch.highest_successful.svg)
                .await?;
            snippet.image = Some(image);
        } else {
            info!(
                "Keeping image of snippet {}: best render {} is below requested {}",
                snippet.public_id, batch.highest_successful.version, plan.highest_requested
            );
        }

        record_versions(tx, snippet.id, &batch).await
    }

    /// A live snippet; private ones only for their owner or managers
    pub async fn get(&self, public_id: &str, viewer: Option<&User>) -> Result<Snippet> {
        let snippet = self.load(public_id).await?;
        if !snippet.is_public && !viewer.is_some_and(|u| may_act_on(u, snippet.created_by_id)) {
            return Err(SnippetError::NotFound(format!("snippet {}", public_id)));
        }
        Ok(snippet)
    }

    pub async fn list(&self, viewer: Option<&User>, mut query: SnippetQuery) -> Result<SnippetPage> {
        query.viewer_id = viewer.map(|u| u.id);
        query.with_trashed =
            query.with_trashed && viewer.is_some_and(|u| capable(u, Capability::SnippetsManage));
        if let Some(wanted) = &query.engine_version {
            if let Some(available) = self.settings().canonical_version(wanted) {
                query.engine_version = Some(available.to_string());
            }
        }
        Ok(self.store.list_snippets(&query).await?)
    }

    /// Soft-delete a snippet
    pub async fn delete(&self, user: &User, public_id: &str) -> Result<()> {
        if !capable(user, Capability::SnippetsDelete) {
            return Err(SnippetError::permission_denied("you may not delete snippets"));
        }
        let mut snippet = self.load(public_id).await?;
        if !may_act_on(user, snippet.created_by_id) {
            return Err(SnippetError::permission_denied("you may only delete your own snippets"));
        }

        soft_delete(&mut snippet, OffsetDateTime::now_utc());
        let mut tx = self.store.begin().await?;
        if let Err(err) = tx.update_snippet(&snippet).await {
            let err = SnippetError::from(err);
            Self::abort(tx.as_mut(), &err).await;
            return Err(err);
        }
        tx.commit().await?;

        info!("User {} deleted snippet {}", user.public_id, public_id);
        Ok(())
    }

    /// Remove every snippet of `owner_id` for good
    pub async fn purge_owner(&self, owner_id: i64) -> Result<u64> {
        let removed = self.store.purge_owner(owner_id).await?;
        info!("Purged {} snippet(s) of user {}", removed, owner_id);
        Ok(removed)
    }
}

/// Resolve package references and replace the snippet's package relations.
/// Unknown packages are skipped.
async fn attach_packages(
    tx: &mut dyn SnippetTransaction,
    snippet_id: i64,
    packages: &[PackageUsage],
) -> Result<()> {
    let mut resolved = Vec::with_capacity(packages.len());
    for package in packages {
        match tx.find_package(&package.package_ref()).await? {
            Some(id) => resolved.push((id, package.version.clone())),
            None => warn!(
                "Package @{}/{} is unknown, not attaching it",
                package.namespace, package.name
            ),
        }
    }
    tx.sync_packages(snippet_id, &resolved).await?;
    Ok(())
}

async fn record_versions(
    tx: &mut dyn SnippetTransaction,
    snippet_id: i64,
    batch: &RenderBatch,
) -> Result<()> {
    for result in &batch.results {
        tx.upsert_version(snippet_id, &result.version, result.success)
            .await?;
    }
    Ok(())
}

fn snippet_row(id: i64, new: &NewSnippet) -> Snippet {
    let now = OffsetDateTime::now_utc();
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
    }
}
