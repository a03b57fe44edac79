//! `GET /version`.

use axum::Json;

/// `GET /version` — the server version string.
pub async fn version() -> Json<&'static str> {
    Json(env!("CARGO_PKG_VERSION"))
}
