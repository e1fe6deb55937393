//! `/v1/batches` — submit, fetch, list, cancel, and fetch results.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use batch_core::models::BatchJob;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct SubmitBatchRequest {
    pub input_file_id: String,
    pub endpoint: String,
    pub completion_window: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
pub struct ListBatchesQuery {
    pub limit: Option<i64>,
    pub after: Option<String>,
}

/// `completion_window` follows OpenAI's `"24h"`-style shorthand; any other
/// value is rejected rather than silently defaulting.
fn parse_completion_window(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (number, unit) = raw.split_at(raw.len().saturating_sub(1));
    let value: i64 = number.parse().ok()?;
    match unit {
        "h" => Some(value * 3600),
        "d" => Some(value * 86_400),
        "s" => Some(value),
        _ => None,
    }
}

pub async fn submit(State(state): State<AppState>, Json(body): Json<SubmitBatchRequest>) -> ApiResult<Json<BatchJob>> {
    let window = match body.completion_window {
        Some(raw) => Some(
            parse_completion_window(&raw)
                .ok_or_else(|| batch_core::Error::invalid_request(format!("invalid completion_window: {raw}")))?,
        ),
        None => None,
    };

    let batch = state
        .scheduler
        .submit(&body.input_file_id, &body.endpoint, window, body.metadata, Utc::now().timestamp())
        .await?;
    Ok(Json(batch))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<BatchJob>> {
    let batch = state.db.get_batch(&id).await?.ok_or_else(|| batch_core::Error::not_found(&id))?;
    Ok(Json(batch))
}

pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListBatchesQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = q.limit.unwrap_or(20).clamp(1, 100);
    let batches = state.db.list_batches(limit, q.after.as_deref()).await?;
    Ok(Json(serde_json::json!({
        "object": "list",
        "data": batches,
        "has_more": false,
    })))
}

pub async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<BatchJob>> {
    let batch = state.scheduler.cancel(&id, Utc::now().timestamp()).await?;
    Ok(Json(batch))
}

pub async fn results(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<(StatusCode, Vec<u8>)> {
    let batch = state.db.get_batch(&id).await?.ok_or_else(|| batch_core::Error::not_found(&id))?;
    let Some(output_file_id) = batch.output_file_id else {
        return Ok((StatusCode::OK, Vec::new()));
    };
    let bytes = state.blobs.read_bytes(&output_file_id).await?;
    Ok((StatusCode::OK, bytes))
}
