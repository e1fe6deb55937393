//! Optional static bearer token authentication.
//!
//! When `API_KEY` is unset, every request is accepted — this server is
//! meant to run behind a private network or its own reverse proxy, not as
//! a public-facing multi-tenant API.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    RequestPartsExt,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};

use crate::state::AppState;

/// Extractor that enforces `Authorization: Bearer <API_KEY>` when the
/// server was configured with one. Zero-sized when unauthenticated.
pub struct RequireApiKey;

#[async_trait]
impl FromRequestParts<AppState> for RequireApiKey {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(expected) = &state.config.api_key else {
            return Ok(RequireApiKey);
        };

        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| (StatusCode::UNAUTHORIZED, "missing bearer token"))?;

        if bearer.token() != expected {
            return Err((StatusCode::UNAUTHORIZED, "invalid bearer token"));
        }
        Ok(RequireApiKey)
    }
}
