//! Error handling for the API server

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use typsnip::SnippetError;
use typsnip_registry::{RepoError, StorageError};

/// Result type for API operations
pub type Result<T> = std::result::Result<T, ApiError>;

/// API error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Snippet(#[from] SnippetError),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RepoError> for ApiError {
    fn from(err: RepoError) -> Self {
        Self::Snippet(err.into())
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        Self::Snippet(err.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Snippet(err) => match err {
                SnippetError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                SnippetError::RenderFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                SnippetError::InsufficientBudget { .. } => StatusCode::FORBIDDEN,
                SnippetError::DuplicateTitle(_) => StatusCode::CONFLICT,
                SnippetError::NotFound(_) => StatusCode::NOT_FOUND,
                SnippetError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                SnippetError::Validation(_) => StatusCode::BAD_REQUEST,
                SnippetError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Config(_) | ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn bad_request(msg: &str) -> Self {
        Self::BadRequest(msg.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_message = match &self {
            ApiError::Snippet(SnippetError::Storage(_)) => {
                error!("Storage failure: {}", self);
                "Storage error".to_string()
            }
            ApiError::Config(_) | ApiError::Io(_) => {
                error!("Internal failure: {}", self);
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (SnippetError::ServiceUnavailable("down".into()), 503),
            (SnippetError::RenderFailure { failures: vec![] }, 422),
            (SnippetError::insufficient_budget(0), 403),
            (SnippetError::DuplicateTitle("Tables".into()), 409),
            (SnippetError::not_found("snippet"), 404),
            (SnippetError::permission_denied("no"), 403),
            (SnippetError::validation("bad"), 400),
            (SnippetError::Storage("disk".into()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status().as_u16(), status);
        }
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_storage_details_are_hidden() {
        let response = ApiError::from(SnippetError::Storage("db password wrong".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
