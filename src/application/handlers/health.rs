use axum::{extract::State, response::Json};
use serde_json::Value;

use crate::AppState;

/// Always 200; the body says whether the store is usable.
pub async fn health_check_handler(State(state): State<AppState>) -> Json<Value> {
    Json(state.health.snapshot().to_json())
}
