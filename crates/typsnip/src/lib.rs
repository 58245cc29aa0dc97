//! Typsnip renders community Typst snippets through an external render
//! service, across several engine versions, against a per-user daily
//! computation budget.
//!
//! The crate holds the orchestration core: version ordering, the render
//! client, budget accounting, the multi-version orchestrator and the
//! update-time reconciler. Persistence lives in `typsnip-registry`.

pub mod budget;
pub mod entities;
pub mod error;
pub mod orchestrator;
pub mod policy;
pub mod reconcile;
pub mod render;
pub mod settings;
pub mod version;

// Re-export core types
pub use budget::{BudgetLedger, BudgetState, ComputationBudget};
pub use entities::{
    NewSnippet, PackageRef, PackageUsage, Snippet, SoftDelete, TagSummary, User, VersionRecord,
};
pub use error::{BudgetStage, Result, SnippetError, VersionFailure};
pub use orchestrator::{HighestSuccessful, RenderBatch, VersionOrchestrator, VersionResult};
pub use policy::{Capability, capable};
pub use reconcile::{ReconcilePlan, reconcile};
pub use render::{HttpRenderClient, RenderResult, Renderer};
pub use settings::{RenderSettings, TimeoutPolicy};

/// Get the library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
