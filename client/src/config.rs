//! Client configuration.
//!
//! Resolved from three fallback sources, tried in order:
//!
//! 1. **JSON file** via `--config <path>`
//! 2. **JSON file** via the `SPYDER_REMOTE_CONFIG` environment variable
//! 3. **Environment variables** `SPYDER_REMOTE_HOST` (required),
//!    `SPYDER_REMOTE_TOKEN`, `SPYDER_REMOTE_USER`, `SPYDER_REMOTE_SERVER_PORT`
//!
//! Programmatic callers use [`ClientConfig::builder`].
//!
//! | Key                     | Default | Meaning                                   |
//! |-------------------------|---------|-------------------------------------------|
//! | `host`                  | -       | SSH host running the remote services      |
//! | `user`                  | none    | SSH user                                  |
//! | `ssh_port`              | none    | SSH port                                  |
//! | `identity_file`         | none    | SSH private key                           |
//! | `server_port`           | none    | Remote server port; discovered if unset   |
//! | `token`                 | none    | Server token; discovered if unset         |
//! | `heartbeat_interval_ms` | 3000    | Kernel heartbeat probe interval           |
//! | `missed_heartbeats`     | 3       | Misses before a kernel counts as degraded |
//! | `degraded_grace_secs`   | 300     | Degraded time before the client closes    |
//! | `spawn_timeout_secs`    | 30      | Timeout for `POST /kernels`               |
//! | `request_timeout_secs`  | 5       | Timeout for every other request           |
//! | `open_attempts`         | 3       | Attempts for spawn and tunnel setup       |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::heartbeat::HeartbeatPolicy;
use crate::tunnel::SshTarget;

/// Command run over SSH to read the remote discovery document.
pub const DEFAULT_INFO_COMMAND: &str = "spyder-remote-services info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub user: Option<String>,
    pub ssh_port: Option<u16>,
    pub identity_file: Option<String>,
    pub server_port: Option<u16>,
    pub token: Option<String>,
    pub info_command: String,
    pub heartbeat_interval_ms: u64,
    pub missed_heartbeats: u32,
    pub degraded_grace_secs: u64,
    pub spawn_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub open_attempts: u32,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: None,
            ssh_port: None,
            identity_file: None,
            server_port: None,
            token: None,
            info_command: DEFAULT_INFO_COMMAND.to_string(),
            heartbeat_interval_ms: 3000,
            missed_heartbeats: 3,
            degraded_grace_secs: 300,
            spawn_timeout_secs: 30,
            request_timeout_secs: 5,
            open_attempts: 3,
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn builder(host: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: Self {
                host: host.into(),
                ..Self::default()
            },
        }
    }

    /// Load from `path`, else `$SPYDER_REMOTE_CONFIG`, else the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = if let Some(path) = path {
            Self::from_file(&expand_tilde(path))?
        } else if let Ok(path) = std::env::var("SPYDER_REMOTE_CONFIG") {
            Self::from_file(&expand_tilde(Path::new(&path)))?
        } else {
            Self::from_env()?
        };
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))
    }

    fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("SPYDER_REMOTE_HOST").map_err(|_| {
            ConfigError::Missing(
                "no config found: pass --config, set SPYDER_REMOTE_CONFIG, or set SPYDER_REMOTE_HOST",
            )
        })?;
        let mut config = Self {
            host,
            ..Self::default()
        };
        config.token = std::env::var("SPYDER_REMOTE_TOKEN").ok();
        config.user = std::env::var("SPYDER_REMOTE_USER").ok();
        if let Ok(port) = std::env::var("SPYDER_REMOTE_SERVER_PORT") {
            config.server_port = Some(port.parse().map_err(|_| {
                ConfigError::Invalid(format!("SPYDER_REMOTE_SERVER_PORT: not a port: {port}"))
            })?);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.missed_heartbeats == 0 {
            return Err(ConfigError::Invalid("missed_heartbeats must be at least 1".into()));
        }
        if self.open_attempts == 0 {
            return Err(ConfigError::Invalid("open_attempts must be at least 1".into()));
        }
        if self.token.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::Invalid("token must not be empty".into()));
        }
        Ok(())
    }

    pub fn ssh_target(&self) -> SshTarget {
        SshTarget {
            host: self.host.clone(),
            user: self.user.clone(),
            port: self.ssh_port,
            identity_file: self
                .identity_file
                .as_deref()
                .map(|p| expand_tilde(Path::new(p))),
        }
    }

    pub fn heartbeat_policy(&self) -> HeartbeatPolicy {
        HeartbeatPolicy {
            interval: Duration::from_millis(self.heartbeat_interval_ms),
            missed_limit: self.missed_heartbeats,
            degraded_grace: Duration::from_secs(self.degraded_grace_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }
}

/// Builder for [`ClientConfig`]; every recognised option has a setter.
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.config.user = Some(user.into());
        self
    }

    #[must_use]
    pub fn ssh_port(mut self, port: u16) -> Self {
        self.config.ssh_port = Some(port);
        self
    }

    #[must_use]
    pub fn identity_file(mut self, path: impl Into<String>) -> Self {
        self.config.identity_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn server_port(mut self, port: u16) -> Self {
        self.config.server_port = Some(port);
        self
    }

    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn info_command(mut self, command: impl Into<String>) -> Self {
        self.config.info_command = command.into();
        self
    }

    #[must_use]
    pub fn heartbeat(mut self, interval: Duration, missed: u32) -> Self {
        self.config.heartbeat_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self.config.missed_heartbeats = missed;
        self
    }

    #[must_use]
    pub fn degraded_grace_secs(mut self, secs: u64) -> Self {
        self.config.degraded_grace_secs = secs;
        self
    }

    #[must_use]
    pub fn spawn_timeout_secs(mut self, secs: u64) -> Self {
        self.config.spawn_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn open_attempts(mut self, attempts: u32) -> Self {
        self.config.open_attempts = attempts;
        self
    }

    #[must_use]
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Read(String),
    Parse(String),
    Missing(&'static str),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read(e) => write!(f, "failed to read config file {e}"),
            Self::Parse(e) => write!(f, "invalid config file {e}"),
            Self::Missing(e) => f.write_str(e),
            Self::Invalid(e) => write!(f, "invalid config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for crate::ClientError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Expand a leading `~/` to `$HOME`.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}
