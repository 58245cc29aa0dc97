//! Error types for snippet rendering and bookkeeping
//!
//! Every variant is user-displayable. Render-engine internals (paths, stdin
//! markers) are sanitized before they ever reach a message in here.

use std::fmt;
use thiserror::Error;

/// Main error type for snippet operations
#[derive(Error, Debug)]
pub enum SnippetError {
    /// The render backend could not be reached or answered with something
    /// outside its contract. Fatal to the whole batch.
    #[error("Typst rendering service is unavailable: {0}")]
    ServiceUnavailable(String),

    /// Every attempted version failed to compile or timed out.
    #[error("{}", render_failure_message(.failures))]
    RenderFailure { failures: Vec<VersionFailure> },

    /// The user's computation budget does not cover the requested work.
    #[error("{}", insufficient_budget_message(.stage))]
    InsufficientBudget { stage: BudgetStage },

    #[error("A snippet with the title '{0}' already exists. Please choose a different title.")]
    DuplicateTitle(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Datastore or blob store failure
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Where in an operation the budget ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStage {
    /// Nothing was rendered
    BeforeStart,
    /// `rendered` versions were rendered (and charged) before the stop
    AfterPartial { rendered: usize },
}

/// Diagnostic for a single failed version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionFailure {
    pub version: String,
    pub message: String,
}

impl fmt::Display for VersionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}: {}", self.version, self.message)
    }
}

fn render_failure_message(failures: &[VersionFailure]) -> String {
    let lines = failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n");
    format!("Failed to render snippet in any requested version:\n{}", lines)
}

fn insufficient_budget_message(stage: &BudgetStage) -> String {
    let base = "Insufficient computation time. Please try again tomorrow or request a manual approval from support.";
    match stage {
        BudgetStage::BeforeStart => base.to_string(),
        BudgetStage::AfterPartial { rendered } => {
            format!("{} ({} version(s) were rendered before the budget ran out)", base, rendered)
        }
    }
}

impl SnippetError {
    pub fn not_found(what: &str) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn validation(msg: &str) -> Self {
        Self::Validation(msg.to_string())
    }

    pub fn permission_denied(msg: &str) -> Self {
        Self::PermissionDenied(msg.to_string())
    }

    /// Budget exhausted before or during a batch that had rendered
    /// `rendered` versions so far.
    pub fn insufficient_budget(rendered: usize) -> Self {
        let stage = if rendered == 0 {
            BudgetStage::BeforeStart
        } else {
            BudgetStage::AfterPartial { rendered }
        };
        Self::InsufficientBudget { stage }
    }
}

/// Shorthand result type for snippet operations
pub type Result<T> = std::result::Result<T, SnippetError>;
