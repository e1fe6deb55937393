//! `/v1/models` — OpenAI-shaped listing of the single model this worker serves.

use axum::extract::State;
use axum::Json;

use crate::state::AppState;

pub async fn list(State(state): State<AppState>) -> Json<serde_json::Value> {
    let hb = state.heartbeat.read().await;
    let loaded = hb.loaded_model.as_deref() == Some(state.config.model_name.as_str());

    Json(serde_json::json!({
        "object": "list",
        "data": [{
            "id": state.config.model_name,
            "object": "model",
            "created": 0,
            "owned_by": "batch-server",
            "loaded": loaded,
        }],
    }))
}
