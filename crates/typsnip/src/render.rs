//! Client for the external Typst render service
//!
//! The service renders one `(content, version)` pair per call. Its answer is
//! normalized into a [`RenderResult`]: compile errors and timeouts become
//! unsuccessful results, while an unreachable service is an error that aborts
//! the caller's whole batch.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{Result, SnippetError};

/// Extra transport-level slack on top of the logical render timeout
pub const TRANSPORT_GRACE_MS: u64 = 1_000;

/// Outcome of rendering one snippet with one engine version
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderResult {
    /// Rendered SVG document (empty on failure)
    pub svg: String,
    pub version: String,
    /// Render time charged for this attempt, in milliseconds
    pub time_used: u64,
    pub success: bool,
    /// Sanitized, user-displayable error on failure
    pub error: Option<String>,
}

impl RenderResult {
    pub fn failure(version: &str, time_used: u64, error: impl Into<String>) -> Self {
        Self {
            svg: String::new(),
            version: version.to_string(),
            time_used,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Something that can render snippet source with a given engine version
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render `content` with engine `version`, giving the service
    /// `timeout_ms` to finish.
    ///
    /// # Errors
    ///
    /// Returns [`SnippetError::ServiceUnavailable`] when the service cannot be
    /// reached. Content errors and timeouts are *not* errors here.
    async fn render(&self, content: &str, version: &str, timeout_ms: u64) -> Result<RenderResult>;
}

/// Request body understood by the render service
#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
    timeout: u64,
}

#[derive(Debug, Deserialize)]
struct RenderSuccessBody {
    content: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    time: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RenderErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    time: Option<f64>,
}

fn millis(time: Option<f64>, fallback: u64) -> u64 {
    match time {
        Some(t) if t.is_finite() && t >= 0.0 => t.round() as u64,
        _ => fallback,
    }
}

/// HTTP client for the render service's `POST /render` endpoint
#[derive(Debug, Clone)]
pub struct HttpRenderClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRenderClient {
    /// Create a client for the service rooted at `base_url`
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SnippetError::ServiceUnavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/render", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Renderer for HttpRenderClient {
    async fn render(&self, content: &str, version: &str, timeout_ms: u64) -> Result<RenderResult> {
        let request = RenderRequest {
            content,
            version: Some(version),
            timeout: timeout_ms,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .timeout(Duration::from_millis(timeout_ms + TRANSPORT_GRACE_MS))
            .send()
            .await
            .map_err(|e| {
                error!("Error communicating with Typst rendering service: {}", e);
                SnippetError::ServiceUnavailable(
                    "Please try again later and contact support if the issue persists.".to_string(),
                )
            })?;

        let status = response.status();
        debug!("Render service answered {} for version {}", status, version);

        match status {
            StatusCode::OK => {
                let body: RenderSuccessBody = response.json().await.map_err(|e| {
                    error!("Malformed render service response: {}", e);
                    SnippetError::ServiceUnavailable("malformed response from rendering service".to_string())
                })?;

                let echoed = body.version.unwrap_or_else(|| version.to_string());
                if !crate::version::same(&echoed, version) {
                    warn!("Render service echoed version {} for requested {}", echoed, version);
                }

                Ok(RenderResult {
                    svg: body.content,
                    version: echoed,
                    time_used: millis(body.time, timeout_ms),
                    success: true,
                    error: None,
                })
            }
            StatusCode::BAD_REQUEST => {
                let text = response.text().await.unwrap_or_default();
                let body: RenderErrorBody = serde_json::from_str(&text).unwrap_or_default();
                let raw = body
                    .error
                    .or(body.message)
                    .or_else(|| (!text.trim().is_empty()).then(|| text.trim().to_string()))
                    .unwrap_or_else(|| "Rendering failed".to_string());

                Ok(RenderResult::failure(
                    version,
                    millis(body.time, timeout_ms),
                    sanitize_error(&raw),
                ))
            }
            StatusCode::REQUEST_TIMEOUT => Ok(RenderResult::failure(version, timeout_ms, "Rendering timeout")),
            other => {
                error!("Unexpected render service status {}", other);
                Err(SnippetError::ServiceUnavailable(format!(
                    "rendering service answered with status {}",
                    other.as_u16()
                )))
            }
        }
    }
}

/// Replace render-engine path prefixes (`<stdin>:`, `/tmp/x/main.typ:`) in
/// diagnostics with a generic `line:` prefix.
pub fn sanitize_error(message: &str) -> String {
    let message = message.replace("<stdin>:", "line:");

    let mut out = String::with_capacity(message.len());
    let mut rest = message.as_str();

    while let Some(pos) = rest.find(".typ:") {
        let before = &rest[..pos];
        let token_start = before
            .rfind(|c: char| c.is_whitespace() || c == '(' || c == '"' || c == '\'')
            .map(|i| i + before[i..].chars().next().map_or(1, char::len_utf8))
            .unwrap_or(0);

        out.push_str(&before[..token_start]);
        if token_start == pos {
            // a bare ".typ:" with no path in front of it
            out.push_str(".typ:");
        } else {
            out.push_str("line:");
        }
        rest = &rest[pos + ".typ:".len()..];
    }
    out.push_str(rest);

    out
}
