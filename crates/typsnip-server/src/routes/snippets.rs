//! Snippet routes

use crate::{
    AppState,
    auth::{CurrentUser, MaybeUser},
    error::Result,
    models::{ApiResponse, ListSnippetsQuery, PaginatedResponse, SnippetResponse},
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use serde_json::{Value, json};
use tracing::{debug, info};
use typsnip_registry::{CreateSnippet, UpdateSnippet};

/// Create snippet routes
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_snippets))
        .route("/create", post(create_snippet))
        .route("/{id}", get(get_snippet).patch(update_snippet))
        .route("/{id}/delete", delete(delete_snippet))
}

/// List visible snippets with filters and pagination
async fn list_snippets(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    Query(params): Query<ListSnippetsQuery>,
) -> Result<Json<PaginatedResponse<SnippetResponse>>> {
    debug!("Listing snippets with query: {:?}", params);

    let query = params.into_query(viewer.as_ref().map(|u| u.id))?;
    let page = state.service.list(viewer.as_ref(), query).await?;

    let app_url = &state.config.app_url;
    let data = page
        .snippets
        .into_iter()
        .map(|s| SnippetResponse::from_snippet(s, app_url))
        .collect();

    Ok(Json(PaginatedResponse::new(data, page.page, page.limit, page.total)))
}

async fn create_snippet(
    State(state): State<AppState>,
    CurrentUser(mut user): CurrentUser,
    Json(request): Json<CreateSnippet>,
) -> Result<(StatusCode, Json<ApiResponse<SnippetResponse>>)> {
    info!("User {} creates snippet '{}'", user.public_id, request.title);

    let snippet = state.service.create(&mut user, request).await?;
    let response = SnippetResponse::from_snippet(snippet, &state.config.app_url);

    Ok((StatusCode::CREATED, Json(ApiResponse::new(response))))
}

async fn get_snippet(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<SnippetResponse>>> {
    let snippet = state.service.get(&id, viewer.as_ref()).await?;
    Ok(Json(ApiResponse::new(SnippetResponse::from_snippet(
        snippet,
        &state.config.app_url,
    ))))
}

async fn update_snippet(
    State(state): State<AppState>,
    CurrentUser(mut user): CurrentUser,
    Path(id): Path<String>,
    Json(request): Json<UpdateSnippet>,
) -> Result<Json<ApiResponse<SnippetResponse>>> {
    debug!("User {} updates snippet {}", user.public_id, id);

    let snippet = state.service.update(&mut user, &id, request).await?;
    Ok(Json(ApiResponse::new(SnippetResponse::from_snippet(
        snippet,
        &state.config.app_url,
    ))))
}

async fn delete_snippet(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Value>>> {
    state.service.delete(&user, &id).await?;
    Ok(Json(ApiResponse::with_message(
        json!({ "id": id }),
        "Snippet deleted".to_string(),
    )))
}
