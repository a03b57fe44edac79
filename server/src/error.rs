//! HTTP error responses.
//!
//! Every handler returns `Result<_, ApiError>`. An [`ApiError`] renders as
//! `{"kind": <tag>, "error": <message>}` with the status code that belongs to
//! its kind, so failures never escape the request loop.

use axum::{
    extract::rejection::{FormRejection, JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use spyder_remote_protocol::{ErrorBody, ErrorKind};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PathForbidden, message)
    }

    /// Map an I/O error from a filesystem operation on `what`.
    pub fn from_io(e: &std::io::Error, what: &str) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(format!("{what}: not found")),
            std::io::ErrorKind::PermissionDenied => {
                Self::forbidden(format!("{what}: permission denied"))
            }
            std::io::ErrorKind::AlreadyExists => {
                Self::new(ErrorKind::AlreadyExists, format!("{what}: already exists"))
            }
            _ => Self::new(ErrorKind::Io, format!("{what}: {e}")),
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        debug!(kind = %self.kind, status = status.as_u16(), "{}", self.message);
        (status, Json(ErrorBody::new(self.kind, self.message))).into_response()
    }
}

// Extractor rejections are reported in the same `{kind, error}` shape as
// every other failure, always as 400.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<FormRejection> for ApiError {
    fn from(rejection: FormRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}
