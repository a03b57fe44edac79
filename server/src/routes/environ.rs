//! Environment-variable endpoints backed by [`crate::environ::EnvironStore`].
//!
//! Changes only reach kernels spawned after them.

use std::collections::BTreeMap;

use axum::{
    extract::{rejection::FormRejection, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Form, Json,
};
use serde::Deserialize;
use tracing::info;

use crate::environ::valid_name;
use crate::error::ApiError;
use crate::AppState;

/// Form body of `POST /environ/{name}`.
#[derive(Deserialize)]
pub struct SetVar {
    pub value: String,
}

/// `GET /environ`
pub async fn list_vars(State(state): State<AppState>) -> Json<BTreeMap<String, String>> {
    Json(state.environ.snapshot())
}

/// `GET /environ/{name}` — the value as `text/plain`.
pub async fn get_var(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let value = state
        .environ
        .get(&name)
        .ok_or_else(|| ApiError::not_found(format!("No such variable: {name}")))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], value))
}

/// `POST /environ/{name}` with form field `value`. 201 when the variable is
/// new, 200 when it was replaced.
pub async fn set_var(
    State(state): State<AppState>,
    Path(name): Path<String>,
    form: Result<Form<SetVar>, FormRejection>,
) -> Result<StatusCode, ApiError> {
    let Form(form) = form?;
    if !valid_name(&name) {
        return Err(ApiError::bad_request(format!(
            "Invalid variable name: {name:?}"
        )));
    }
    if form.value.contains('\0') {
        return Err(ApiError::bad_request("Value contains null bytes"));
    }
    let created = state.environ.set(&name, &form.value);
    info!("environ: set {name}");
    Ok(if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    })
}

/// `DELETE /environ/{name}`
pub async fn delete_var(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.environ.remove(&name) {
        info!("environ: removed {name}");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("No such variable: {name}")))
    }
}
