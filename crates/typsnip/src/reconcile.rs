//! Update-time reconciliation of recorded versions against requested ones
//!
//! Decides which versions have to be (re-)rendered and which stored version
//! rows are dropped. Metadata-only edits produce an empty plan and cost no
//! render time.

use crate::entities::VersionRecord;
use crate::version;

/// What an update has to do with the snippet's versions
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePlan {
    /// Versions to render, in request order
    pub to_render: Vec<String>,
    /// Stored rows whose version is no longer requested
    pub to_delete: Vec<VersionRecord>,
    /// Newest requested version
    pub highest_requested: String,
    /// Newest version among stored successful rows before the update
    pub old_highest_successful: Option<String>,
    pub highest_version_changed: bool,
}

impl ReconcilePlan {
    /// Nothing to render: no render calls, no budget charge
    pub fn is_render_free(&self) -> bool {
        self.to_render.is_empty()
    }

    /// Whether a batch whose best version is `rendered` may replace the
    /// displayed image. Only a render of the highest requested version may.
    pub fn should_update_image(&self, rendered: &str) -> bool {
        version::same(rendered, &self.highest_requested)
    }
}

/// Compute the reconciliation plan.
///
/// Returns `None` when `requested` is empty; callers substitute the default
/// version before reconciling.
pub fn reconcile(
    requested: &[String],
    content_changed: bool,
    existing: &[VersionRecord],
) -> Option<ReconcilePlan> {
    let requested = version::dedupe(requested);
    let highest_requested = version::highest(requested.iter().map(String::as_str))?.to_string();

    let is_requested = |v: &str| requested.iter().any(|r| version::same(r, v));

    let to_delete: Vec<VersionRecord> = existing
        .iter()
        .filter(|row| !is_requested(&row.version))
        .cloned()
        .collect();

    let old_highest_successful = version::highest(
        existing
            .iter()
            .filter(|row| row.success)
            .map(|row| row.version.as_str()),
    )
    .map(str::to_string);

    let highest_version_changed = match &old_highest_successful {
        Some(old) => !version::same(old, &highest_requested),
        None => true,
    };

    let to_render = requested
        .iter()
        .filter(|v| {
            let row = existing.iter().find(|row| version::same(&row.version, v));
            let new_or_failed = row.is_none_or(|row| !row.success);
            let highest_and_changed =
                version::same(v, &highest_requested) && highest_version_changed;
            let content_changed_for_existing = content_changed && row.is_some();
            new_or_failed || highest_and_changed || content_changed_for_existing
        })
        .cloned()
        .collect();

    Some(ReconcilePlan {
        to_render,
        to_delete,
        highest_requested,
        old_highest_successful,
        highest_version_changed,
    })
}
