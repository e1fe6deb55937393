//! Axum router wiring for the OpenAI-compatible batch API.

pub mod batches;
pub mod files;
pub mod health;
pub mod models;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::RequireApiKey;
use crate::state::AppState;

/// Multipart upload cap: generous enough for large JSONL batch files.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let v1 = Router::new()
        .route("/files", post(files::upload).get(files::list))
        .route("/files/:id", get(files::get).delete(files::delete))
        .route("/files/:id/content", get(files::content))
        .route("/batches", post(batches::submit).get(batches::list))
        .route("/batches/:id", get(batches::get))
        .route("/batches/:id/cancel", post(batches::cancel))
        .route("/batches/:id/results", get(batches::results))
        .route("/models", get(models::list))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .route_layer(middleware::from_extractor_with_state::<RequireApiKey, AppState>(state.clone()));

    Router::new()
        .nest("/v1", v1)
        .route("/health", get(health::health))
        .route("/liveness", get(health::liveness))
        .route("/readiness", get(health::readiness))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
