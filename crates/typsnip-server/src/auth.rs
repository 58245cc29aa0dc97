//! Bearer token authentication

use axum::{RequestPartsExt, extract::FromRequestParts, http::header, http::request::Parts};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use tracing::debug;
use typsnip::User;

use crate::AppState;
use crate::error::ApiError;

async fn resolve(parts: &mut Parts, state: &AppState) -> Result<User, ApiError> {
    let TypedHeader(Authorization(bearer)) = parts
        .extract::<TypedHeader<Authorization<Bearer>>>()
        .await
        .map_err(|_| ApiError::Unauthorized)?;

    match state.authenticator.authenticate(bearer.token()).await? {
        Some(user) => Ok(user),
        None => {
            debug!("Rejected unknown access token");
            Err(ApiError::Unauthorized)
        }
    }
}

/// The authenticated caller
pub struct CurrentUser(pub User);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        resolve(parts, state).await.map(CurrentUser)
    }
}

/// The caller if a token was sent; a bad token is still rejected
pub struct MaybeUser(pub Option<User>);

impl FromRequestParts<AppState> for MaybeUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if !parts.headers.contains_key(header::AUTHORIZATION) {
            return Ok(MaybeUser(None));
        }
        resolve(parts, state).await.map(|user| MaybeUser(Some(user)))
    }
}
