//! Kernel lifecycle endpoints.
//!
//! | Method | Path                        | Success                    |
//! |--------|-----------------------------|----------------------------|
//! | GET    | `/kernels`                  | 200, `[id, ...]`           |
//! | POST   | `/kernels`                  | 201, kernel record         |
//! | GET    | `/kernels/{id}`             | 200, kernel record         |
//! | DELETE | `/kernels/{id}?now=bool`    | 200, `{"success": true}`   |
//! | POST   | `/kernels/{id}/interrupt`   | 204                        |
//! | POST   | `/kernels/{id}/restart`     | 200, kernel record         |
//! | POST   | `/kernels/{id}/attach`      | 200, kernel record         |
//! | POST   | `/kernels/{id}/detach`      | 200, kernel record         |
//!
//! The `POST /kernels` body is optional; `{}` or no body spawns the default
//! kernel spec.

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use spyder_remote_protocol::{ErrorKind, KernelModel, SpawnRequest};

use crate::error::ApiError;
use crate::AppState;

/// Query parameters for `DELETE /kernels/{id}`.
#[derive(Deserialize)]
pub struct DeleteQuery {
    /// Skip the shutdown request and go straight to signals.
    #[serde(default)]
    pub now: bool,
}

/// `GET /kernels`
pub async fn list_kernels(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.registry.list().await)
}

/// `POST /kernels`
pub async fn create_kernel(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<KernelModel>), ApiError> {
    let request: SpawnRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SpawnRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid spawn request: {e}")))?
    };

    // Run the spawn on its own task so a client that hangs up mid-startup
    // does not leave a half-registered kernel behind.
    let registry = state.registry.clone();
    let spawn =
        tokio::spawn(async move { registry.spawn(request.name.as_deref(), &request.env).await });
    let model = spawn
        .await
        .map_err(|e| ApiError::new(ErrorKind::SpawnFailed, e.to_string()))??;
    Ok((StatusCode::CREATED, Json(model)))
}

/// `GET /kernels/{id}`
pub async fn get_kernel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KernelModel>, ApiError> {
    Ok(Json(state.registry.get(&id).await?))
}

/// `DELETE /kernels/{id}`
pub async fn delete_kernel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<DeleteQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let registry = state.registry.clone();
    let delete = tokio::spawn(async move { registry.delete(&id, query.now).await });
    delete
        .await
        .map_err(|e| ApiError::new(ErrorKind::Io, e.to_string()))??;
    Ok(Json(json!({"success": true})))
}

/// `POST /kernels/{id}/interrupt`
pub async fn interrupt_kernel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.interrupt(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /kernels/{id}/restart`
pub async fn restart_kernel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KernelModel>, ApiError> {
    let registry = state.registry.clone();
    let restart = tokio::spawn(async move { registry.restart(&id).await });
    let model = restart
        .await
        .map_err(|e| ApiError::new(ErrorKind::SpawnFailed, e.to_string()))??;
    Ok(Json(model))
}

/// `POST /kernels/{id}/attach`
pub async fn attach_kernel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KernelModel>, ApiError> {
    Ok(Json(state.registry.attach(&id).await?))
}

/// `POST /kernels/{id}/detach`
pub async fn detach_kernel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KernelModel>, ApiError> {
    Ok(Json(state.registry.detach(&id).await?))
}
