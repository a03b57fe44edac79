#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

//! Wire-level types shared by the Spyder remote-services server and the
//! client bridge.
//!
//! - `descriptor` — Jupyter connection descriptors (parse, validate, rewrite)
//! - `server_info` — the `jpserver-spyder.json` discovery document
//! - `kernel` — kernel records and state events as they appear over HTTP
//! - `wire` — Jupyter multipart message framing and HMAC signing
//! - `error` — stable error kind tags and the JSON error body

pub mod descriptor;
pub mod error;
pub mod kernel;
pub mod server_info;
pub mod wire;

pub use descriptor::{Channel, ConnectionDescriptor, DescriptorError, PortMapping};
pub use error::{ErrorBody, ErrorKind};
pub use kernel::{DeathReason, ExecutionState, KernelModel, SpawnRequest, StateEvent};
pub use server_info::ServerInfo;

/// Milliseconds since the Unix epoch, saturating to zero on a skewed clock.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
