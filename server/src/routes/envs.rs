//! Environment-manager endpoints.
//!
//! Backed by a conda-compatible executable (`envs.manager`, default `conda`)
//! invoked with `--json`:
//!
//! | Endpoint                     | Manager command                                   |
//! |------------------------------|---------------------------------------------------|
//! | `GET /envs`                  | `env list --json`                                 |
//! | `POST /envs`                 | `create -y --json -n NAME [python=V] [PKG ...]`   |
//! | `GET /envs/{name}/packages`  | `list --json -n NAME`                             |
//! | `DELETE /envs/{name}`        | `env remove -y --json -n NAME`                    |
//!
//! A manager that cannot be found is a `ConfigError`; one that exits non-zero
//! or times out is `EnvManagerFailed`. Both are 500.

use std::path::{Path, PathBuf};

use axum::{
    extract::{rejection::JsonRejection, Path as UrlPath, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use spyder_remote_protocol::ErrorKind;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::process::{self, ExecError};
use crate::AppState;

/// Request body for `POST /envs`.
#[derive(Deserialize)]
pub struct CreateEnvRequest {
    pub name: String,
    #[serde(default)]
    pub packages: Vec<String>,
    /// Python version to pin, e.g. `"3.11"`.
    pub python: Option<String>,
}

/// One environment known to the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvInfo {
    pub name: String,
    pub prefix: String,
}

/// Locate `manager` on `PATH` unless it is already a path.
fn find_manager(manager: &str) -> Option<PathBuf> {
    if manager.contains('/') {
        let p = PathBuf::from(manager);
        return p.is_file().then_some(p);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(manager))
        .find(|candidate| candidate.is_file())
}

/// Run the manager and parse its JSON output.
async fn run_manager(state: &AppState, args: &[&str]) -> Result<Value, ApiError> {
    let configured = &state.config.envs.manager;
    let manager = find_manager(configured).ok_or_else(|| {
        ApiError::new(
            ErrorKind::ConfigError,
            format!("Environment manager not found: {configured}"),
        )
    })?;
    let program = manager.to_string_lossy().into_owned();
    let args: Vec<String> = args.iter().map(ToString::to_string).collect();

    let result = process::run_capture(&program, &args, state.config.envs.timeout_ms)
        .await
        .map_err(|e| match e {
            ExecError::SpawnFailed(msg) => ApiError::new(
                ErrorKind::ConfigError,
                format!("Cannot run {configured}: {msg}"),
            ),
            other => ApiError::new(ErrorKind::EnvManagerFailed, other.to_string()),
        })?;

    let parsed: Option<Value> = serde_json::from_str(result.stdout.trim()).ok();
    if result.exit_code != 0 {
        let message = parsed
            .as_ref()
            .and_then(|v| v["message"].as_str().or_else(|| v["error"].as_str()))
            .map_or_else(|| result.stderr.trim().to_string(), ToString::to_string);
        warn!(
            "{configured} {} exited with {}: {message}",
            args.join(" "),
            result.exit_code
        );
        return Err(ApiError::new(ErrorKind::EnvManagerFailed, message));
    }
    parsed.ok_or_else(|| {
        ApiError::new(
            ErrorKind::EnvManagerFailed,
            format!("{configured} returned invalid JSON"),
        )
    })
}

/// Environment name for a prefix: the base install is `base`, everything
/// under an `envs/` directory is its directory name.
fn env_name(prefix: &str) -> String {
    let path = Path::new(prefix);
    let under_envs = path
        .parent()
        .and_then(Path::file_name)
        .is_some_and(|p| p == "envs");
    match path.file_name() {
        Some(name) if under_envs => name.to_string_lossy().into_owned(),
        _ => "base".to_string(),
    }
}

fn parse_env_list(output: &Value) -> Vec<EnvInfo> {
    output["envs"]
        .as_array()
        .map(|envs| {
            envs.iter()
                .filter_map(Value::as_str)
                .map(|prefix| EnvInfo {
                    name: env_name(prefix),
                    prefix: prefix.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn valid_env_name(name: &str) -> bool {
    !name.is_empty()
        && name != "base"
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// A package spec or python version passed to the manager as a positional
/// argument. Anything starting with `-` would be read as an option.
fn valid_package_spec(spec: &str) -> bool {
    !spec.is_empty()
        && !spec.starts_with('-')
        && !spec.chars().any(|c| c.is_whitespace() || c.is_control())
}

async fn list_all(state: &AppState) -> Result<Vec<EnvInfo>, ApiError> {
    Ok(parse_env_list(&run_manager(state, &["env", "list", "--json"]).await?))
}

async fn require_env(state: &AppState, name: &str) -> Result<EnvInfo, ApiError> {
    list_all(state)
        .await?
        .into_iter()
        .find(|e| e.name == name)
        .ok_or_else(|| ApiError::not_found(format!("No such environment: {name}")))
}

/// `GET /envs`
pub async fn list_envs(State(state): State<AppState>) -> Result<Json<Vec<EnvInfo>>, ApiError> {
    Ok(Json(list_all(&state).await?))
}

/// `POST /envs` — 201 with `{name, prefix}`.
pub async fn create_env(
    State(state): State<AppState>,
    request: Result<Json<CreateEnvRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<EnvInfo>), ApiError> {
    let Json(request) = request?;
    if !valid_env_name(&request.name) {
        return Err(ApiError::bad_request(format!(
            "Invalid environment name: {:?}",
            request.name
        )));
    }
    let mut specs = request.python.iter().chain(&request.packages);
    if let Some(bad) = specs.find(|s| !valid_package_spec(s)) {
        return Err(ApiError::bad_request(format!("Invalid package spec: {bad:?}")));
    }
    if list_all(&state).await?.iter().any(|e| e.name == request.name) {
        return Err(ApiError::new(
            ErrorKind::AlreadyExists,
            format!("Environment already exists: {}", request.name),
        ));
    }

    let python = request.python.as_ref().map(|v| format!("python={v}"));
    let mut args = vec!["create", "-y", "--json", "-n", request.name.as_str()];
    args.extend(python.as_deref());
    args.extend(request.packages.iter().map(String::as_str));

    info!("Creating environment {}", request.name);
    let output = run_manager(&state, &args).await?;
    let prefix = output["prefix"]
        .as_str()
        .or_else(|| output["actions"]["PREFIX"].as_str())
        .unwrap_or_default()
        .to_string();
    Ok((
        StatusCode::CREATED,
        Json(EnvInfo {
            name: request.name,
            prefix,
        }),
    ))
}

/// `GET /envs/{name}/packages` — `[{name, version, build, channel}]`.
pub async fn list_packages(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let env = require_env(&state, &name).await?;
    let output = run_manager(&state, &["list", "--json", "-n", env.name.as_str()]).await?;
    let packages = output
        .as_array()
        .map(|pkgs| {
            pkgs.iter()
                .map(|p| {
                    json!({
                        "name": p["name"],
                        "version": p["version"],
                        "build": p["build_string"],
                        "channel": p["channel"],
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(Json(packages))
}

/// `DELETE /envs/{name}` — 204, or 404 when absent.
pub async fn delete_env(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<StatusCode, ApiError> {
    let env = require_env(&state, &name).await?;
    info!("Removing environment {}", env.name);
    run_manager(&state, &["env", "remove", "-y", "--json", "-n", env.name.as_str()]).await?;
    Ok(StatusCode::NO_CONTENT)
}
