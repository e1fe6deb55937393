//! `/health`, `/liveness`, `/readiness` — worker heartbeat and queue status.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use batch_core::models::{BatchStatus, WorkerStatus};

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let hb = state.heartbeat.read().await;
    let in_flight = state.db.find_resumable().await?;
    let queue_depth = in_flight
        .iter()
        .filter(|b| matches!(b.status, BatchStatus::Validating | BatchStatus::InProgress))
        .count();

    Ok(Json(serde_json::json!({
        "worker": {
            "status": worker_status_str(hb.status),
            "loaded_model": hb.loaded_model,
            "heartbeat_age_seconds": hb.age_seconds(),
        },
        "queue": {
            "depth": queue_depth,
            "max_depth": state.config.max_queue_depth,
        },
        "degraded": hb.status == WorkerStatus::Dead,
    })))
}

pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    let hb = state.heartbeat.read().await;
    if hb.status == WorkerStatus::Dead {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

fn worker_status_str(status: WorkerStatus) -> &'static str {
    match status {
        WorkerStatus::Idle => "idle",
        WorkerStatus::Busy => "busy",
        WorkerStatus::Loading => "loading",
        WorkerStatus::Unloading => "unloading",
        WorkerStatus::Dead => "dead",
    }
}
