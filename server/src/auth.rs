//! Token authentication.
//!
//! Every endpoint requires `Authorization: token <token>`. `Bearer <token>`
//! is accepted as well. Rejections are a bare 401 with an
//! `AuthenticationFailed` body, produced before any handler runs, so an
//! unauthenticated caller learns nothing about server state.

use axum::{
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use spyder_remote_protocol::ErrorKind;
use tracing::debug;

use crate::error::ApiError;

/// Axum middleware that rejects requests without a valid token. The expected
/// token is injected via the [`ServerToken`] extension.
pub async fn require_token(request: Request, next: Next) -> Response {
    let Some(expected) = request.extensions().get::<ServerToken>().cloned() else {
        return ApiError::new(ErrorKind::ConfigError, "Server configuration error").into_response();
    };

    let accepted = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_authorization)
        .map(|token| constant_time_eq(expected.0.as_bytes(), token.as_bytes()));

    match accepted {
        Some(true) => next.run(request).await,
        Some(false) => {
            debug!(path = %request.uri().path(), "rejected request with wrong token");
            unauthorized("Invalid token")
        }
        None => unauthorized("Missing or invalid Authorization header"),
    }
}

fn unauthorized(message: &str) -> Response {
    ApiError::new(ErrorKind::AuthenticationFailed, message).into_response()
}

/// Extract the token from `token <t>` or `Bearer <t>`.
fn parse_authorization(header: &str) -> Option<&str> {
    let (scheme, rest) = header.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("token") || scheme.eq_ignore_ascii_case("bearer") {
        Some(rest.trim())
    } else {
        None
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the token length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Extension type carrying the token issued at server start.
#[derive(Clone)]
pub struct ServerToken(pub String);
