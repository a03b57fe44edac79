//! Errors surfaced by the client library.
//!
//! Every variant maps to a stable [`ErrorKind`] tag; callers show the tag
//! plus the message and log the rest.

use spyder_remote_protocol::{ErrorBody, ErrorKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    ServerUnreachable(String),
    /// The server rejected the token.
    AuthenticationFailed(String),
    /// The server could not start the requested kernel.
    KernelStartFailed { kind: ErrorKind, message: String },
    /// Any other non-2xx response.
    Server {
        status: u16,
        kind: Option<ErrorKind>,
        message: String,
    },
    /// A response body did not have the promised shape.
    Protocol(String),
    MalformedDescriptor(String),
    TunnelDenied(String),
    TransportLost(String),
    NoFreePort(String),
    /// The caller cancelled an in-flight `open`.
    Cancelled,
    /// The kernel client already reached `closed`.
    Closed,
    /// The operation is not valid in the client's current state.
    InvalidState(String),
    Config(String),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ServerUnreachable(_) => ErrorKind::ServerUnreachable,
            Self::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            Self::KernelStartFailed { .. } => ErrorKind::KernelStartFailed,
            Self::Server { kind, .. } => kind.unwrap_or(ErrorKind::ServerUnreachable),
            Self::Protocol(_) | Self::MalformedDescriptor(_) => ErrorKind::MalformedDescriptor,
            Self::TunnelDenied(_) => ErrorKind::TunnelDenied,
            Self::TransportLost(_) | Self::Cancelled | Self::Closed => ErrorKind::TransportLost,
            Self::NoFreePort(_) => ErrorKind::NoFreePort,
            Self::InvalidState(_) => ErrorKind::InvalidRequest,
            Self::Config(_) => ErrorKind::ConfigError,
        }
    }

    /// Failures worth another attempt during `open`.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ServerUnreachable(_) | Self::TransportLost(_) | Self::NoFreePort(_) => true,
            Self::KernelStartFailed { kind, .. } => matches!(
                kind,
                ErrorKind::SpawnFailed | ErrorKind::StartupTimeout | ErrorKind::KernelStartFailed
            ),
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` if the server answered 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Server { status: 404, .. })
    }

    /// Build an error from a non-2xx status and its body. The body is
    /// expected to be `{kind, error}`; anything else becomes the message.
    pub(crate) fn from_response(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<ErrorBody>(body).ok();
        let message = parsed
            .as_ref()
            .map_or_else(|| body.trim().to_string(), |b| b.error.clone());
        if status == 401 {
            return Self::AuthenticationFailed(message);
        }
        Self::Server {
            status,
            kind: parsed.map(|b| b.kind),
            message,
        }
    }

    /// Reclassify a failed spawn request. Authentication and transport
    /// failures keep their own kind.
    pub(crate) fn into_start_failure(self) -> Self {
        match self {
            Self::Server { kind, message, .. } => Self::KernelStartFailed {
                kind: kind.unwrap_or(ErrorKind::KernelStartFailed),
                message,
            },
            Self::Protocol(message) => Self::KernelStartFailed {
                kind: ErrorKind::MalformedDescriptor,
                message,
            },
            other => other,
        }
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServerUnreachable(e) => write!(f, "server unreachable: {e}"),
            Self::AuthenticationFailed(e) => write!(f, "authentication failed: {e}"),
            Self::KernelStartFailed { kind, message } => {
                write!(f, "kernel start failed ({kind}): {message}")
            }
            Self::Server {
                status, message, ..
            } => write!(f, "HTTP {status}: {message}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::MalformedDescriptor(e) => write!(f, "malformed connection descriptor: {e}"),
            Self::TunnelDenied(e) => write!(f, "tunnel denied: {e}"),
            Self::TransportLost(e) => write!(f, "SSH transport lost: {e}"),
            Self::NoFreePort(e) => write!(f, "no free local port: {e}"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Closed => f.write_str("kernel client is closed"),
            Self::InvalidState(e) => write!(f, "invalid state: {e}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<spyder_remote_protocol::DescriptorError> for ClientError {
    fn from(e: spyder_remote_protocol::DescriptorError) -> Self {
        Self::MalformedDescriptor(e.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        Self::ServerUnreachable(e.to_string())
    }
}
