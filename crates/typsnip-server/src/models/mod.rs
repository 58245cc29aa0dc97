//! API models for requests and responses

pub mod api;
pub mod snippet;

// Re-export commonly used types
pub use api::*;
pub use snippet::*;
