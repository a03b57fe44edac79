//! `GET /kernelspecs` — installed kernel specs.

use axum::{extract::State, Json};
use serde_json::{json, Map, Value};

use crate::AppState;

/// `GET /kernelspecs`
///
/// ```json
/// {"default": "spyder-kernel",
///  "kernelspecs": {"python3": {"argv": [...], "display_name": "...", "language": "python"}}}
/// ```
pub async fn list_kernelspecs(State(state): State<AppState>) -> Json<Value> {
    let registry = state.registry.clone();
    let specs = tokio::task::spawn_blocking(move || registry.specs().list())
        .await
        .unwrap_or_default();

    let kernelspecs: Map<String, Value> = specs
        .into_iter()
        .map(|(name, spec)| {
            (
                name,
                json!({
                    "argv": spec.argv,
                    "display_name": spec.display_name,
                    "language": spec.language,
                    "env": spec.env,
                }),
            )
        })
        .collect();

    Json(json!({
        "default": state.config.kernels.default_kernel_name,
        "kernelspecs": kernelspecs,
    }))
}
