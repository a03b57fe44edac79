//! `POST /shutdown` — stop the server gracefully.

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::info;

use crate::AppState;

/// `POST /shutdown` — ask the server to stop. The response is sent before
/// the listener closes; kernels are deleted during shutdown.
pub async fn shutdown(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    info!("Shutdown requested over HTTP");
    state.shutdown.notify_one();
    (StatusCode::ACCEPTED, Json(json!({"success": true})))
}
