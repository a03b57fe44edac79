#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # spyder-remote-client
//!
//! Command-line driver for the client library.
//!
//! ## Subcommands
//!
//! - `spyder-remote-client open [--name N] [--env K=V ...]` — spawn a remote
//!   kernel, tunnel it and print the local connection descriptor; runs until
//!   Ctrl-C, then shuts the kernel down
//! - `spyder-remote-client list` — ids of the kernels on the server
//! - `spyder-remote-client version` — client and server versions
//!
//! ## Exit codes
//!
//! | Code | Meaning                         |
//! |------|---------------------------------|
//! | 0    | Success                         |
//! | 1    | Remote operation failed         |
//! | 2    | Configuration error             |

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;
use spyder_remote_client::{
    runtime, ClientConfig, ClientError, KernelChannels, Runtime,
};
use spyder_remote_protocol::Channel;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "spyder-remote-client", version, about = "Spyder remote kernel client")]
struct Cli {
    /// JSON config file (defaults to $SPYDER_REMOTE_CONFIG, then env vars)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawn and tunnel a kernel, print its local descriptor
    Open {
        /// Kernel spec name (server default when omitted)
        #[arg(long)]
        name: Option<String>,
        /// Extra environment variable for the kernel, `KEY=VALUE`
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
    },
    /// List kernel ids on the server
    List,
    /// Print client and server versions
    Version,
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ClientConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("spyder-remote-client: configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    if runtime::install_global(Runtime::new(config)).is_err() {
        eprintln!("spyder-remote-client: runtime already installed");
        return ExitCode::FAILURE;
    }
    let Some(rt) = runtime::global() else {
        return ExitCode::FAILURE;
    };

    let result = match cli.command {
        Command::Open { name, env } => open(rt, name, env.into_iter().collect()).await,
        Command::List => list(rt).await,
        Command::Version => version(rt).await,
    };
    rt.shutdown().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("spyder-remote-client: {e} ({})", e.kind());
            ExitCode::FAILURE
        }
    }
}

async fn open(
    rt: &Runtime,
    name: Option<String>,
    env: HashMap<String, String>,
) -> Result<(), ClientError> {
    let kernel = rt.kernel_client().await?;
    kernel.on_state_change(|change| info!("Kernel client {} -> {}", change.from, change.to));

    let cancel = CancellationToken::new();
    let descriptor = tokio::select! {
        result = kernel.open_with(name.as_deref(), &env, cancel.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            kernel.close().await;
            return Err(ClientError::Cancelled);
        }
    };
    let pretty = serde_json::to_string_pretty(&descriptor.to_json())
        .map_err(|e| ClientError::Protocol(e.to_string()))?;
    println!("{pretty}");

    let shell_id = kernel.kernel_id().unwrap_or_default();
    match KernelChannels::connect(&descriptor, &shell_id, rt.router().clone()).await {
        Ok(channels) => {
            let request = channels.message("kernel_info_request", json!({}));
            let reply = tokio::time::timeout(
                rt.config().request_timeout(),
                channels.request(Channel::Shell, &request),
            )
            .await;
            match reply {
                Ok(Ok(reply)) => info!(
                    "Kernel is up: {}",
                    reply.content["implementation"].as_str().unwrap_or("unknown")
                ),
                Ok(Err(e)) => warn!("kernel_info_request failed: {e}"),
                Err(_) => warn!("No kernel_info_reply within the request timeout"),
            }
        }
        Err(e) => warn!("Could not connect kernel channels: {e}"),
    }

    info!("Press Ctrl-C to shut the kernel down");
    let _ = tokio::signal::ctrl_c().await;
    kernel.close().await;
    Ok(())
}

async fn list(rt: &Runtime) -> Result<(), ClientError> {
    for id in rt.services().await?.list_kernels().await? {
        println!("{id}");
    }
    Ok(())
}

async fn version(rt: &Runtime) -> Result<(), ClientError> {
    let server = rt.services().await?.version().await?;
    println!("client {}", env!("CARGO_PKG_VERSION"));
    println!("server {server}");
    Ok(())
}
