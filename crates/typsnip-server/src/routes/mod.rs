//! HTTP route handlers

pub mod snippets;
pub mod uploads;
