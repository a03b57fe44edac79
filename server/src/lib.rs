#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! Remote services for the Spyder IDE.
//!
//! The library holds everything the `spyder-remote-services` binary serves,
//! so integration tests can drive the router in-process:
//! - `kernels` — kernel spec lookup, spawning, supervision
//! - `routes` — HTTP handlers
//! - `auth` — token middleware
//! - `config` — TOML + env configuration
//! - `environ` — environment overlay for spawned kernels
//! - `process` — process groups, signals, captured helper commands

pub mod auth;
pub mod config;
pub mod environ;
pub mod error;
pub mod kernels;
pub mod process;
pub mod routes;
pub mod state;
pub mod util;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
    Extension, Router,
};
use tower_http::trace::TraceLayer;

pub use auth::ServerToken;
pub use config::Config;
pub use error::ApiError;
pub use kernels::KernelRegistry;
pub use state::AppState;

/// Build the full router. Every route requires `token`.
pub fn build_router(state: AppState, token: String) -> Router {
    // base64 inflates file bodies by a third; leave room for the JSON wrapper.
    let body_limit = state.config.files.max_file_size / 3 * 4 + 64 * 1024;

    Router::new()
        .route("/version", get(routes::version::version))
        .route(
            "/kernels",
            get(routes::kernels::list_kernels).post(routes::kernels::create_kernel),
        )
        .route(
            "/kernels/{id}",
            get(routes::kernels::get_kernel).delete(routes::kernels::delete_kernel),
        )
        .route(
            "/kernels/{id}/interrupt",
            post(routes::kernels::interrupt_kernel),
        )
        .route("/kernels/{id}/restart", post(routes::kernels::restart_kernel))
        .route("/kernels/{id}/attach", post(routes::kernels::attach_kernel))
        .route("/kernels/{id}/detach", post(routes::kernels::detach_kernel))
        .route("/kernels/{id}/events", get(routes::events::kernel_events))
        .route("/kernelspecs", get(routes::kernelspecs::list_kernelspecs))
        .route("/environ", get(routes::environ::list_vars))
        .route(
            "/environ/{name}",
            get(routes::environ::get_var)
                .post(routes::environ::set_var)
                .delete(routes::environ::delete_var),
        )
        .route("/files", get(routes::files::get_root))
        .route(
            "/files/{*path}",
            get(routes::files::get_file)
                .put(routes::files::put_file)
                .post(routes::files::post_file)
                .delete(routes::files::delete_file),
        )
        .route(
            "/envs",
            get(routes::envs::list_envs).post(routes::envs::create_env),
        )
        .route("/envs/{name}", delete(routes::envs::delete_env))
        .route("/envs/{name}/packages", get(routes::envs::list_packages))
        .route("/shutdown", post(routes::shutdown::shutdown))
        .layer(middleware::from_fn(auth::require_token))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(Extension(ServerToken(token)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
