//! Server configuration management

use crate::error::{ApiError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use typsnip::{RenderSettings, TimeoutPolicy};

/// Where rendered artifacts are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Fs,
    S3,
}

impl FromStr for StorageBackend {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "fs" | "filesystem" => Ok(Self::Fs),
            "s3" => Ok(Self::S3),
            other => Err(ApiError::Config(format!("Unknown STORAGE_BACKEND '{}'", other))),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to bind to
    pub port: u16,

    /// PostgreSQL URL; the in-memory store is used when absent
    pub database_url: Option<String>,

    /// Base URL of the Typst render service
    pub typst_url: String,

    /// Public base URL artifact links are built from
    pub app_url: String,

    pub storage_backend: StorageBackend,

    /// Root directory of the filesystem artifact backend
    pub storage_path: String,

    /// CORS allowed origins
    pub cors_origins: Vec<String>,

    pub render: RenderSettings,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ApiError::Config(format!("Invalid {} value", name))),
        Err(_) => Ok(default),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let render_defaults = RenderSettings::default();

        let timeout_policy = match std::env::var("TIMEOUT_POLICY") {
            Ok(value) => TimeoutPolicy::from_str(&value).map_err(ApiError::Config)?,
            Err(_) => render_defaults.timeout_policy,
        };

        let available_versions = match std::env::var("AVAILABLE_VERSIONS") {
            Ok(value) => split_list(&value),
            Err(_) => render_defaults.available_versions.clone(),
        };
        if available_versions.is_empty() {
            return Err(ApiError::Config("AVAILABLE_VERSIONS must name at least one version".into()));
        }

        let render = RenderSettings {
            render_timeout_ms: parse_var("RENDER_TIMEOUT_MS", render_defaults.render_timeout_ms)?,
            timeout_policy,
            daily_allotment_ms: parse_var("DAILY_COMPUTATION_MS", render_defaults.daily_allotment_ms)?,
            reset_offset_hours: parse_var("BUDGET_UTC_OFFSET_HOURS", render_defaults.reset_offset_hours)?,
            available_versions,
        };

        Ok(Self {
            host: var_or("HOST", &defaults.host),
            port: parse_var("PORT", defaults.port)?,
            database_url: std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            typst_url: var_or("TYPST_URL", &defaults.typst_url),
            app_url: var_or("APP_URL", &defaults.app_url),
            storage_backend: parse_var("STORAGE_BACKEND", defaults.storage_backend)?,
            storage_path: var_or("STORAGE_PATH", &defaults.storage_path),
            cors_origins: split_list(&var_or("CORS_ORIGINS", "*")),
            render,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            database_url: None,
            typst_url: "http://localhost:3000".to_string(),
            app_url: "http://localhost:8000".to_string(),
            storage_backend: StorageBackend::Memory,
            storage_path: "./storage".to_string(),
            cors_origins: vec!["*".to_string()],
            render: RenderSettings::default(),
        }
    }
}
