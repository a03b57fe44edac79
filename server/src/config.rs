//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags** — applied by `main.rs` after loading
//! 2. **Environment variables** — `SPYDER_REMOTE_TOKEN`,
//!    `SPYDER_REMOTE_RUNTIME_DIR`, `SPYDER_REMOTE_IP`
//! 3. **Config file** — path via `--config <path>`, or
//!    `spyder-remote-services.toml` in CWD
//! 4. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! ip = "127.0.0.1"
//! port = 0
//! set_dynamic_port = true
//! port_env = "SPYDER_REMOTE_PORT"
//! runtime_dir = "/run/user/1000/jupyter"
//!
//! [auth]
//! token = "your-secret-token"   # generated at startup when omitted
//!
//! [kernels]
//! default_kernel_name = "spyder-kernel"
//! kernel_dirs = []
//! python = "python3"
//! startup_timeout_secs = 30
//! shutdown_grace_secs = 5
//! sweep_interval_secs = 600
//! idle_timeout_secs = 3600
//!
//! [files]
//! root = "/home/user"
//! max_file_size = 2097152  # 2 MB
//!
//! [envs]
//! manager = "conda"
//! timeout_ms = 600000
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "spyder-remote-services.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub kernels: KernelsConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub envs: EnvsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and discovery settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind (default `127.0.0.1`). Override with `SPYDER_REMOTE_IP`.
    #[serde(default = "default_ip")]
    pub ip: String,
    /// Port used when `set_dynamic_port` is false and `port_env` is unset.
    #[serde(default)]
    pub port: u16,
    /// Bind to an OS-assigned port (default true).
    #[serde(default = "default_set_dynamic_port")]
    pub set_dynamic_port: bool,
    /// Environment variable consulted for the port when `set_dynamic_port`
    /// is false (default `SPYDER_REMOTE_PORT`).
    #[serde(default = "default_port_env")]
    pub port_env: String,
    /// Directory holding `jpserver-spyder.json`. Override with
    /// `SPYDER_REMOTE_RUNTIME_DIR`.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Token expected in `Authorization: token <t>`. Override with
    /// `SPYDER_REMOTE_TOKEN`. A random token is generated when unset.
    pub token: Option<String>,
}

/// Kernel spawning and supervision.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelsConfig {
    /// Spec used when `POST /kernels` names none (default `spyder-kernel`).
    #[serde(default = "default_kernel_name")]
    pub default_kernel_name: String,
    /// Extra directories searched for `kernels/<name>/kernel.json`, ahead of
    /// the standard Jupyter data directories.
    #[serde(default)]
    pub kernel_dirs: Vec<String>,
    /// Interpreter for the built-in `spyder-kernel` spec (default `python3`).
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// Wait between shutdown stages: request, SIGTERM, SIGKILL (default 5).
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Idle-kernel sweep period (default 600).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Kernels with zero connections idle this long are shut down (default 3600).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

/// File-service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FilesConfig {
    /// Directory the `/files` surface is rooted at (default `$HOME`).
    #[serde(default = "default_files_root")]
    pub root: String,
    /// Maximum file size in bytes for reads and writes (default 2 MB).
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
}

/// Environment-manager settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvsConfig {
    /// Conda-compatible executable (default `conda`).
    #[serde(default = "default_env_manager")]
    pub manager: String,
    #[serde(default = "default_env_timeout_ms")]
    pub timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_set_dynamic_port() -> bool {
    true
}
fn default_port_env() -> String {
    "SPYDER_REMOTE_PORT".to_string()
}
fn default_runtime_dir() -> String {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !dir.is_empty() {
            return format!("{dir}/jupyter");
        }
    }
    format!("{}/.local/share/jupyter/runtime", home_dir())
}
fn default_kernel_name() -> String {
    "spyder-kernel".to_string()
}
fn default_python() -> String {
    "python3".to_string()
}
fn default_startup_timeout_secs() -> u64 {
    30
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_sweep_interval_secs() -> u64 {
    600
}
fn default_idle_timeout_secs() -> u64 {
    3600
}
fn default_files_root() -> String {
    home_dir()
}
fn default_max_file_size() -> usize {
    2 * 1024 * 1024 // 2 MB
}
fn default_env_manager() -> String {
    "conda".to_string()
}
fn default_env_timeout_ms() -> u64 {
    600_000
}
fn default_log_level() -> String {
    "info".to_string()
}

fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| "/".to_string())
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: 0,
            set_dynamic_port: default_set_dynamic_port(),
            port_env: default_port_env(),
            runtime_dir: default_runtime_dir(),
        }
    }
}

impl Default for KernelsConfig {
    fn default() -> Self {
        Self {
            default_kernel_name: default_kernel_name(),
            kernel_dirs: Vec::new(),
            python: default_python(),
            startup_timeout_secs: default_startup_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            root: default_files_root(),
            max_file_size: default_max_file_size(),
        }
    }
}

impl Default for EnvsConfig {
    fn default() -> Self {
        Self {
            manager: default_env_manager(),
            timeout_ms: default_env_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Startup configuration was rejected. The binary exits with code 2.
#[derive(Debug)]
pub enum ConfigError {
    Read(PathBuf, std::io::Error),
    Parse(PathBuf, String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(p, e) => write!(f, "Failed to read config file {}: {e}", p.display()),
            ConfigError::Parse(p, e) => {
                write!(f, "Failed to parse config file {}: {e}", p.display())
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise looks for
    /// `spyder-remote-services.toml` in the current directory, falling back
    /// to compiled defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Config::default(),
        };

        if let Ok(token) = std::env::var("SPYDER_REMOTE_TOKEN") {
            config.auth.token = Some(token);
        }
        if let Ok(dir) = std::env::var("SPYDER_REMOTE_RUNTIME_DIR") {
            config.server.runtime_dir = dir;
        }
        if let Ok(ip) = std::env::var("SPYDER_REMOTE_IP") {
            config.server.ip = ip;
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.token.as_deref() == Some("") {
            return Err(ConfigError::Invalid("auth.token must not be empty".into()));
        }
        if self.kernels.default_kernel_name.is_empty() {
            return Err(ConfigError::Invalid(
                "kernels.default_kernel_name must not be empty".into(),
            ));
        }
        if self.server.ip.parse::<std::net::IpAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "server.ip is not an IP address: {}",
                self.server.ip
            )));
        }
        Ok(())
    }

    /// Port to bind: 0 when dynamic, otherwise `$port_env` if set, else
    /// `server.port`.
    pub fn bind_port(&self) -> Result<u16, ConfigError> {
        if self.server.set_dynamic_port {
            return Ok(0);
        }
        match std::env::var(&self.server.port_env) {
            Ok(raw) => raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{} is not a port: {raw:?}", self.server.port_env))
            }),
            Err(_) => Ok(self.server.port),
        }
    }

    /// The configured token, or a freshly generated one.
    pub fn resolve_token(&self) -> String {
        self.auth
            .token
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
    }
}
