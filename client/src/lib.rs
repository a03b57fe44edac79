#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::doc_markdown
)]

//! # spyder-remote-client
//!
//! Local half of the Spyder remote-kernel control plane. Opens one SSH
//! connection to the kernel host, forwards the services endpoint and each
//! kernel's five ports over it, and exposes every remote kernel through a
//! local connection descriptor.
//!
//! ## Architecture
//!
//! ```text
//! runtime.rs    — explicit Runtime: config, tunnels, router, services client
//! config.rs     — ClientConfig, builder, JSON file / env-var loading
//! api.rs        — HTTP client for the remote services endpoint
//! tunnel/       — coalesced SSH port forwardings and the ssh transport
//! kernel.rs     — RemoteKernelClient state machine and heartbeat monitor
//! heartbeat.rs  — heartbeat probes and the miss/grace tracker
//! channels.rs   — the five ZeroMQ sockets of a kernel, IOPub pump
//! router.rs     — Spyder message dispatch by kind and shell
//! error.rs      — ClientError and its ErrorKind mapping
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! Idle -> Requesting -> Tunnelling -> Ready <-> Degraded
//!             |              |          |          |
//!             +--------------+----------+----------+--> Closing -> Closed
//! ```

pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod kernel;
pub mod router;
pub mod runtime;
pub mod tunnel;

pub use api::RemoteServicesClient;
pub use channels::KernelChannels;
pub use config::{ClientConfig, ClientConfigBuilder, ConfigError};
pub use error::ClientError;
pub use heartbeat::{HeartbeatPolicy, HeartbeatProbe, ZmqHeartbeat};
pub use kernel::{ClientState, KernelOptions, RemoteKernelClient, StateChange};
pub use router::{
    Delivery, HandlerResult, HandlerToken, KnownKind, MessageKind, MessageRouter, SpyderMessage,
};
pub use runtime::Runtime;
pub use tunnel::{LeaseHandle, OpenSshTransport, ReconnectPolicy, SshTarget, SshTransport, TunnelManager};
