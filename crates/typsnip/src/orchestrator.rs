//! Multi-version render orchestration
//!
//! A batch renders one snippet with several engine versions, strictly one at
//! a time and newest first. Each attempt is charged to the user's budget as
//! soon as it returns, so the first success seen is also the highest
//! successful version of the batch.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::budget::ComputationBudget;
use crate::entities::User;
use crate::error::{Result, SnippetError, VersionFailure};
use crate::render::Renderer;
use crate::settings::RenderSettings;
use crate::version;

/// Result of one version within a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionResult {
    pub version: String,
    pub svg: String,
    pub success: bool,
    pub error: Option<String>,
    pub time_used: u64,
}

/// Highest version of a batch that rendered successfully
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HighestSuccessful {
    pub version: String,
    pub svg: String,
}

/// Aggregated outcome of a batch with at least one success
#[derive(Debug, Clone, Serialize)]
pub struct RenderBatch {
    /// Attempted versions in attempt order (newest first)
    pub results: Vec<VersionResult>,
    pub highest_successful: HighestSuccessful,
    pub total_time_used: u64,
}

/// Renders a snippet across engine versions against the user's budget
#[derive(Clone)]
pub struct VersionOrchestrator {
    renderer: Arc<dyn Renderer>,
    budget: ComputationBudget,
    settings: RenderSettings,
}

impl VersionOrchestrator {
    pub fn new(renderer: Arc<dyn Renderer>, budget: ComputationBudget, settings: RenderSettings) -> Self {
        Self {
            renderer,
            budget,
            settings,
        }
    }

    pub fn budget(&self) -> &ComputationBudget {
        &self.budget
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Render `content` with every version in `versions`.
    ///
    /// # Errors
    ///
    /// - [`SnippetError::InsufficientBudget`] when the stored balance cannot
    ///   cover the next version's timeout; versions rendered so far stay charged.
    /// - [`SnippetError::ServiceUnavailable`] straight from the renderer.
    /// - [`SnippetError::RenderFailure`] when no version succeeded.
    pub async fn render_all(
        &self,
        content: &str,
        versions: &[String],
        user: &mut User,
    ) -> Result<RenderBatch> {
        let mut ordered = version::dedupe(versions);
        if ordered.is_empty() {
            return Err(SnippetError::validation("at least one version must be rendered"));
        }
        version::sort_descending(&mut ordered);

        let timeout_ms = self
            .settings
            .timeout_policy
            .per_version(self.settings.render_timeout_ms, ordered.len());

        let mut results: Vec<VersionResult> = Vec::with_capacity(ordered.len());
        let mut highest_successful: Option<HighestSuccessful> = None;
        let mut total_time_used = 0u64;

        for v in &ordered {
            self.budget.refresh(user).await?;
            self.budget.ensure_covers(user, timeout_ms, results.len())?;

            let result = self.renderer.render(content, v, timeout_ms).await?;
            total_time_used += result.time_used;
            self.budget.charge(user, result.time_used).await?;

            info!(
                "Rendered version {} for user {}: success={} time={}ms",
                v, user.public_id, result.success, result.time_used
            );

            if result.success && highest_successful.is_none() {
                highest_successful = Some(HighestSuccessful {
                    version: v.clone(),
                    svg: result.svg.clone(),
                });
            }

            results.push(VersionResult {
                version: v.clone(),
                svg: result.svg,
                success: result.success,
                error: result.error,
                time_used: result.time_used,
            });
        }

        match highest_successful {
            Some(highest_successful) => Ok(RenderBatch {
                results,
                highest_successful,
                total_time_used,
            }),
            None => {
                warn!("No version of the batch rendered for user {}", user.public_id);
                let failures = results
                    .into_iter()
                    .map(|r| VersionFailure {
                        version: r.version,
                        message: r.error.unwrap_or_else(|| "Rendering failed".to_string()),
                    })
                    .collect();
                Err(SnippetError::RenderFailure { failures })
            }
        }
    }
}
