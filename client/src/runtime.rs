//! The explicit [`Runtime`]: one SSH transport, the tunnels over it, the
//! message router and a lazily connected services client.
//!
//! Pass a `Runtime` (cheap to clone) to whatever needs kernels. The
//! process-wide instance behind [`global`] exists for outer boundaries such
//! as a signal handler and is never consulted by the library itself.
//!
//! ## Services discovery
//!
//! When the config names both `server_port` and `token` they are used as
//! given. Otherwise `info_command` runs on the remote host over the SSH
//! connection and the last line of its output is parsed as the server's
//! `ServerInfo` document. Explicit config values win over discovered ones.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use spyder_remote_protocol::ServerInfo;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::api::RemoteServicesClient;
use crate::config::ClientConfig;
use crate::kernel::{KernelOptions, RemoteKernelClient};
use crate::router::MessageRouter;
use crate::tunnel::{LeaseHandle, OpenSshTransport, SshTransport, TransportError, TunnelManager};
use crate::ClientError;

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: ClientConfig,
    tunnels: Arc<TunnelManager>,
    router: MessageRouter,
    services: OnceCell<Arc<RemoteServicesClient>>,
    server_lease: Mutex<Option<LeaseHandle>>,
    kernels: Mutex<Vec<RemoteKernelClient>>,
}

impl Runtime {
    /// Runtime that reaches `config.host` with the system `ssh` binary.
    pub fn new(config: ClientConfig) -> Self {
        let transport = Arc::new(OpenSshTransport::new(config.ssh_target()));
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn SshTransport>) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                tunnels: Arc::new(TunnelManager::new(transport)),
                router: MessageRouter::new(),
                services: OnceCell::new(),
                server_lease: Mutex::new(None),
                kernels: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.inner.tunnels
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    /// The services client, connecting (and discovering) on first use.
    /// A failed attempt is not cached.
    pub async fn services(&self) -> Result<Arc<RemoteServicesClient>, ClientError> {
        self.inner
            .services
            .get_or_try_init(|| self.connect_services())
            .await
            .cloned()
    }

    async fn connect_services(&self) -> Result<Arc<RemoteServicesClient>, ClientError> {
        let config = &self.inner.config;
        let (port, token) = match (config.server_port, config.token.clone()) {
            (Some(port), Some(token)) => (port, token),
            (port, token) => {
                let info = self.discover().await?;
                (port.unwrap_or(info.port), token.unwrap_or(info.token))
            }
        };

        let (local_port, lease) = self.inner.tunnels.lease("127.0.0.1", port).await?;
        let api = RemoteServicesClient::new(
            &format!("http://127.0.0.1:{local_port}"),
            &token,
            config.request_timeout(),
            config.spawn_timeout(),
        );
        let api = match api {
            Ok(api) => api,
            Err(e) => {
                self.inner.tunnels.release(&lease).await;
                return Err(e);
            }
        };
        *lock(&self.inner.server_lease) = Some(lease);
        info!("Remote services on {}:{port} reachable at {}", config.host, api.base_url());
        Ok(Arc::new(api))
    }

    /// Ask the remote host for the running server's discovery document.
    pub async fn discover(&self) -> Result<ServerInfo, ClientError> {
        let tunnels = &self.inner.tunnels;
        tunnels.connect().await?;
        let command = &self.inner.config.info_command;
        debug!("Discovering remote services with `{command}`");
        // A non-zero exit (no server running) surfaces as `Lost`.
        let stdout = tunnels
            .transport()
            .exec(command)
            .await
            .map_err(|e| match e {
                TransportError::Lost(message) => ClientError::ServerUnreachable(message),
                other => other.into(),
            })?;
        parse_server_info(&stdout)
    }

    pub fn kernel_options(&self) -> KernelOptions {
        let config = &self.inner.config;
        KernelOptions {
            open_attempts: config.open_attempts,
            heartbeat: config.heartbeat_policy(),
            request_timeout: config.request_timeout(),
            ..KernelOptions::default()
        }
    }

    /// A fresh, idle kernel client sharing this runtime's tunnels. It is
    /// closed by [`Runtime::shutdown`].
    pub async fn kernel_client(&self) -> Result<RemoteKernelClient, ClientError> {
        let api = self.services().await?;
        let client = RemoteKernelClient::new(api, Arc::clone(&self.inner.tunnels), self.kernel_options());
        lock(&self.inner.kernels).push(client.clone());
        Ok(client)
    }

    /// Close every kernel client, then the services forwarding and the SSH
    /// connection.
    pub async fn shutdown(&self) {
        let kernels = std::mem::take(&mut *lock(&self.inner.kernels));
        for kernel in kernels {
            kernel.close().await;
        }
        let lease = lock(&self.inner.server_lease).take();
        if let Some(lease) = lease {
            self.inner.tunnels.release(&lease).await;
        }
        self.inner.tunnels.close().await;
        info!("Runtime for {} shut down", self.inner.config.host);
    }
}

/// Install the process-wide runtime. Fails (returning it) if one is set.
pub fn install_global(runtime: Runtime) -> Result<(), Runtime> {
    GLOBAL.set(runtime)
}

pub fn global() -> Option<&'static Runtime> {
    GLOBAL.get()
}

fn parse_server_info(stdout: &str) -> Result<ServerInfo, ClientError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .ok_or_else(|| ClientError::ServerUnreachable("no running remote services found".into()))?;
    serde_json::from_str(line)
        .map_err(|e| ClientError::Protocol(format!("invalid server info: {e}")))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
