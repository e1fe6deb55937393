//! `/v1/files` — upload, fetch, list, download, and soft-delete JSONL blobs.

use axum::extract::{Multipart, Path, Query, State};
use axum::response::IntoResponse;
use axum::{http::StatusCode, Json};
use serde::Deserialize;

use batch_core::ids;
use batch_core::models::{FileObject, FilePurpose};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ListFilesQuery {
    pub purpose: Option<String>,
    pub limit: Option<i64>,
    pub after: Option<String>,
}

/// `multipart/form-data` with a `file` part and a `purpose` part (must be `batch`).
pub async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult<Json<FileObject>> {
    let mut filename = "upload.jsonl".to_string();
    let mut purpose: Option<FilePurpose> = None;
    let mut contents: Vec<u8> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| batch_core::Error::invalid_request(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "purpose" => {
                let text = field.text().await.unwrap_or_default();
                purpose = text.parse().ok();
            }
            "file" => {
                filename = field.file_name().unwrap_or("upload.jsonl").to_string();
                contents = field
                    .bytes()
                    .await
                    .map_err(|e| batch_core::Error::invalid_request(format!("failed reading file part: {e}")))?
                    .to_vec();
            }
            _ => {}
        }
    }

    let purpose = purpose.ok_or_else(|| batch_core::Error::invalid_request("missing or unknown purpose"))?;
    if purpose != FilePurpose::Batch {
        return Err(batch_core::Error::invalid_request("only purpose=batch uploads are accepted").into());
    }

    let id = ids::new_input_file_id();
    let path = state.blobs.put(&id, &contents).await?;
    let file = FileObject::new(id, purpose, filename, contents.len() as i64, path.display().to_string());
    state.db.create_file(&file).await?;
    Ok(Json(file))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<FileObject>> {
    let file = state.db.get_file(&id).await?.ok_or_else(|| batch_core::Error::not_found(&id))?;
    Ok(Json(file))
}

pub async fn content(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let file = state.db.get_file(&id).await?.ok_or_else(|| batch_core::Error::not_found(&id))?;
    if file.deleted {
        return Err(batch_core::Error::not_found(&id).into());
    }
    let bytes = state.blobs.read_bytes(&id).await?;
    Ok((StatusCode::OK, bytes))
}

pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListFilesQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let purpose = q.purpose.as_deref().and_then(|p| p.parse::<FilePurpose>().ok());
    let limit = q.limit.unwrap_or(20).clamp(1, 100);
    let files = state.db.list_files(purpose, limit, q.after.as_deref()).await?;
    Ok(Json(serde_json::json!({
        "object": "list",
        "data": files,
        "has_more": false,
    })))
}

/// Soft-deletes only: the blob itself is left in place until the retention
/// sweeper hard-deletes it after `cleanup_after_days`.
pub async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<serde_json::Value>> {
    let deleted = state.db.soft_delete_file(&id, chrono::Utc::now().timestamp()).await?;
    if !deleted {
        return Err(ApiError(batch_core::Error::not_found(&id)));
    }
    Ok(Json(serde_json::json!({ "id": id, "deleted": true })))
}
