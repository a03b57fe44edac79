//! Error kind tags and the JSON error body.
//!
//! Every failure that crosses a component boundary carries one of these
//! tags. The HTTP surface reports them as `{"kind": ..., "error": ...}`.

use serde::{Deserialize, Serialize};

/// Stable, short classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    MalformedDescriptor,
    UnknownKernel,
    SpawnFailed,
    StartupTimeout,
    NoSuchKernel,
    TunnelDenied,
    TransportLost,
    NoFreePort,
    ServerUnreachable,
    AuthenticationFailed,
    KernelStartFailed,
    HandlerError,
    ConfigError,
    InvalidRequest,
    PathForbidden,
    NotFound,
    AlreadyExists,
    Io,
    EnvManagerFailed,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedDescriptor => "MalformedDescriptor",
            Self::UnknownKernel => "UnknownKernel",
            Self::SpawnFailed => "SpawnFailed",
            Self::StartupTimeout => "StartupTimeout",
            Self::NoSuchKernel => "NoSuchKernel",
            Self::TunnelDenied => "TunnelDenied",
            Self::TransportLost => "TransportLost",
            Self::NoFreePort => "NoFreePort",
            Self::ServerUnreachable => "ServerUnreachable",
            Self::AuthenticationFailed => "AuthenticationFailed",
            Self::KernelStartFailed => "KernelStartFailed",
            Self::HandlerError => "HandlerError",
            Self::ConfigError => "ConfigError",
            Self::InvalidRequest => "InvalidRequest",
            Self::PathForbidden => "PathForbidden",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::Io => "Io",
            Self::EnvManagerFailed => "EnvManagerFailed",
        }
    }

    /// HTTP status code the server answers with for this kind.
    pub fn status_code(self) -> u16 {
        match self {
            Self::MalformedDescriptor | Self::InvalidRequest => 400,
            Self::AuthenticationFailed => 401,
            Self::PathForbidden => 403,
            Self::UnknownKernel | Self::NoSuchKernel | Self::NotFound => 404,
            Self::AlreadyExists => 409,
            _ => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub error: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            kind,
            error: error.into(),
        }
    }
}
