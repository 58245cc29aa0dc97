//! Rendered artifact downloads

use crate::{AppState, error::Result};
use axum::{
    Router,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::get,
};
use typsnip::SnippetError;

pub fn router() -> Router<AppState> {
    Router::new().route("/snippets/{file}", get(get_artifact))
}

/// Serve `snippets/{image}.svg`
async fn get_artifact(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<impl IntoResponse> {
    let image = file
        .strip_suffix(".svg")
        .ok_or_else(|| SnippetError::NotFound(file.clone()))?;

    let svg = state.service.artifacts().get(image).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/svg+xml"),
            (header::CACHE_CONTROL, "public, max-age=31536000, immutable"),
        ],
        svg,
    ))
}
