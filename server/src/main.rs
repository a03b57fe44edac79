#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # spyder-remote-services
//!
//! Remote half of the Spyder remote-kernel control plane. Runs on the host
//! that executes kernels and exposes one token-protected HTTP endpoint,
//! normally reached by the IDE through an SSH forwarding.
//!
//! ## Subcommands
//!
//! - `spyder-remote-services serve` (default) — run the HTTP server
//! - `spyder-remote-services info` — print the running server's discovery
//!   document
//!
//! ## API surface
//!
//! | Method | Path                       | Description                           |
//! |--------|----------------------------|---------------------------------------|
//! | GET    | `/version`                 | Server version                        |
//! | GET    | `/kernels`                 | Ids of known kernels                  |
//! | POST   | `/kernels`                 | Spawn a kernel                        |
//! | GET    | `/kernels/{id}`            | Kernel record with connection info    |
//! | DELETE | `/kernels/{id}`            | Shut a kernel down                    |
//! | POST   | `/kernels/{id}/interrupt`  | SIGINT                                |
//! | POST   | `/kernels/{id}/restart`    | Restart on the same ports             |
//! | POST   | `/kernels/{id}/attach`     | Count a connected frontend            |
//! | POST   | `/kernels/{id}/detach`     | Uncount a connected frontend          |
//! | GET    | `/kernels/{id}/events`     | SSE stream of state transitions       |
//! | GET    | `/kernelspecs`             | Installed kernel specs                |
//! | GET    | `/environ[/{name}]`        | Environment overlay                   |
//! | POST   | `/environ/{name}`          | Set a variable (form field `value`)   |
//! | DELETE | `/environ/{name}`          | Remove a variable                     |
//! | *      | `/files/{path}`            | Files under the served root           |
//! | *      | `/envs[/{name}]`           | Interpreter environments              |
//! | POST   | `/shutdown`                | Stop the server                       |
//!
//! ## Exit codes
//!
//! `0` normal shutdown, `1` fatal startup failure, `2` invalid arguments or
//! configuration.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, discovery file, shutdown
//! lib.rs           — router assembly
//! auth.rs          — token middleware, constant-time comparison
//! config.rs        — TOML + env-var configuration
//! error.rs         — ApiError → {kind, error} responses
//! environ.rs       — environment overlay
//! process.rs       — process groups, signals, captured commands
//! kernels/
//!   mod.rs         — KernelRegistry (lifecycle, supervision, sweep)
//!   spec.rs        — kernelspec discovery
//!   probe.rs       — ports, readiness, OOM accounting
//!   channels.rs    — IOPub status watcher, shutdown_request
//! routes/          — one module per endpoint group
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use spyder_remote_protocol::ServerInfo;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use spyder_remote_services::{build_router, AppState, Config};

/// Remote kernel and host services for the Spyder IDE.
#[derive(Parser)]
#[command(name = "spyder-remote-services", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default when no subcommand given).
    Serve(ServeArgs),
    /// Print the discovery document of the server running for this user.
    Info {
        /// Directory holding the discovery document.
        #[arg(long)]
        runtime_dir: Option<PathBuf>,
    },
}

#[derive(Args, Default)]
struct ServeArgs {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Address to bind.
    #[arg(long)]
    ip: Option<String>,
    /// Fixed port to bind (disables dynamic port selection).
    #[arg(long)]
    port: Option<u16>,
    /// Directory for the discovery document.
    #[arg(long)]
    runtime_dir: Option<String>,
    /// Token clients must present.
    #[arg(long)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Info { runtime_dir }) => print_info(runtime_dir),
        Some(Commands::Serve(args)) => run_server(args).await,
        None => run_server(ServeArgs::default()).await,
    }
}

fn print_info(runtime_dir: Option<PathBuf>) -> ExitCode {
    let dir = runtime_dir.unwrap_or_else(|| match Config::load(None) {
        Ok(c) => PathBuf::from(c.server.runtime_dir),
        Err(_) => PathBuf::from(Config::default().server.runtime_dir),
    });
    match ServerInfo::discover(&dir) {
        Ok(Some(info)) => match serde_json::to_string(&info) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("spyder-remote-services: {e}");
                ExitCode::FAILURE
            }
        },
        Ok(None) => {
            eprintln!("spyder-remote-services: no server running ({})", dir.display());
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("spyder-remote-services: {}: {e}", dir.display());
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &ServeArgs) -> Result<(Config, u16), spyder_remote_services::config::ConfigError> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(ip) = &args.ip {
        config.server.ip.clone_from(ip);
    }
    if let Some(port) = args.port {
        config.server.port = port;
        config.server.set_dynamic_port = false;
    }
    if let Some(dir) = &args.runtime_dir {
        config.server.runtime_dir.clone_from(dir);
    }
    if let Some(token) = &args.token {
        config.auth.token = Some(token.clone());
    }
    config.validate()?;
    let port = config.bind_port()?;
    Ok((config, port))
}

#[allow(clippy::too_many_lines)]
async fn run_server(args: ServeArgs) -> ExitCode {
    let (config, port) = match load_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("spyder-remote-services: {e}");
            return ExitCode::from(2);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("spyder-remote-services v{} starting", env!("CARGO_PKG_VERSION"));

    let token = config.resolve_token();
    if config.auth.token.is_none() {
        info!("Generated a fresh access token");
    }
    let ip = config.server.ip.clone();
    let runtime_dir = PathBuf::from(&config.server.runtime_dir);
    let sweep_every = std::time::Duration::from_secs(config.kernels.sweep_interval_secs.max(1));

    let state = AppState::new(config);
    let app = build_router(state.clone(), token.clone());

    let addr: SocketAddr = match format!("{ip}:{port}").parse() {
        Ok(a) => a,
        Err(e) => {
            error!("Invalid bind address {ip}:{port}: {e}");
            return ExitCode::from(2);
        }
    };
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };
    let bound = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => {
            error!("Failed to read bound address: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("Listening on {bound}");

    let server_info = ServerInfo {
        port: bound.port(),
        pid: std::process::id(),
        base_url: format!("http://{ip}:{}/", bound.port()),
        token,
        runtime_dir: runtime_dir.to_string_lossy().into_owned(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    match server_info.write() {
        Ok(path) => info!("Wrote {}", path.display()),
        Err(e) => {
            error!("Failed to write server info to {}: {e}", runtime_dir.display());
            return ExitCode::FAILURE;
        }
    }

    // Periodic sweep: forget dead kernels and stop idle ones.
    let registry = state.registry.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = registry.sweep().await;
            if !removed.is_empty() {
                info!("Sweep removed {} kernel(s)", removed.len());
            }
        }
    });

    // Kernels are deleted before the listener drains so that open event
    // streams end and graceful shutdown can complete.
    let shutdown_state = state.clone();
    let shutdown = async move {
        wait_for_shutdown(&shutdown_state).await;
        shutdown_state.registry.shutdown_all().await;
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    info!("Shutting down...");
    sweep_task.abort();
    state.registry.shutdown_all().await;
    remove_server_info(&runtime_dir);

    if let Err(e) = served {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }
    info!("Goodbye");
    ExitCode::SUCCESS
}

async fn wait_for_shutdown(state: &AppState) {
    let ctrl_c = tokio::signal::ctrl_c();
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        () = sigterm => info!("Received SIGTERM"),
        () = state.shutdown.notified() => info!("Shutdown requested"),
    }
}

fn remove_server_info(runtime_dir: &Path) {
    if let Err(e) = ServerInfo::remove(runtime_dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove server info: {e}");
        }
    }
}
