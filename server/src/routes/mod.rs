//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. Every handler sits
//! behind the [`crate::auth::require_token`] middleware.

pub mod environ;
pub mod envs;
pub mod events;
pub mod files;
pub mod kernels;
pub mod kernelspecs;
pub mod shutdown;
pub mod version;
