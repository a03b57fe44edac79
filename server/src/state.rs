//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Notify;

use crate::config::Config;
use crate::environ::EnvironStore;
use crate::kernels::{KernelRegistry, RegistryConfig, SpecSearch};

/// Shared application state for the services server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started.
    pub start_time: Instant,
    /// Every kernel spawned by this server.
    pub registry: KernelRegistry,
    /// Environment overlay handed to newly spawned kernels.
    pub environ: EnvironStore,
    /// Signalled by `POST /shutdown`.
    pub shutdown: Arc<Notify>,
    /// Current number of SSE connections (for connection limiting).
    pub sse_connections: Arc<AtomicU32>,
}

impl AppState {
    /// Build the state for `config`, seeding the environment overlay from
    /// this process. Must be called inside a Tokio runtime.
    pub fn new(config: Config) -> Self {
        Self::with_environ(config, EnvironStore::from_process())
    }

    pub fn with_environ(config: Config, environ: EnvironStore) -> Self {
        let specs = SpecSearch::new(&config.kernels.kernel_dirs, &config.kernels.python);
        let registry =
            KernelRegistry::new(RegistryConfig::from_config(&config), specs, environ.clone());
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            environ,
            shutdown: Arc::new(Notify::new()),
            sse_connections: Arc::new(AtomicU32::new(0)),
        }
    }
}
