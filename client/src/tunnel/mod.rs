//! Coalesced, refcounted port forwardings over one SSH connection.
//!
//! Every `(remote_host, remote_port)` pair has at most one live forwarding.
//! Each [`TunnelManager::lease`] on a pair shares its local port and bumps
//! a refcount; the forwarding is cancelled when the last lease is released.
//!
//! ## Reconnection
//!
//! [`TunnelManager::recover`] reconnects a dropped transport with
//! exponential backoff and re-opens every live forwarding on its original
//! local port, so descriptors handed out earlier stay valid. When every
//! attempt fails the manager is invalidated: outstanding leases are
//! forgotten and further leases fail with `TransportLost`.
//!
//! The table lock is only held to read or commit state, never across a
//! reconnect attempt or a backoff sleep. Recoveries themselves are
//! serialized by a separate lock.

mod ssh;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::ClientError;

pub use ssh::{OpenSshTransport, SshTarget, SshTransport, TransportError};

/// Fresh local ports tried when the picked one is taken before ssh binds it.
const PORT_ATTEMPTS: usize = 3;

/// Backoff for [`TunnelManager::recover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            attempts: 5,
        }
    }
}

/// A caller's claim on a forwarding. Carries only an id and the target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseHandle {
    id: u64,
    pub remote_host: String,
    pub remote_port: u16,
}

type Target = (String, u16);

struct Tunnel {
    local_port: u16,
    refcount: usize,
}

#[derive(Default)]
struct Table {
    tunnels: HashMap<Target, Tunnel>,
    leases: HashMap<u64, Target>,
    connected: bool,
    invalid: bool,
}

pub struct TunnelManager {
    transport: Arc<dyn SshTransport>,
    table: Mutex<Table>,
    recovery: Mutex<()>,
    next_lease: AtomicU64,
    policy: ReconnectPolicy,
}

impl TunnelManager {
    pub fn new(transport: Arc<dyn SshTransport>) -> Self {
        Self::with_policy(transport, ReconnectPolicy::default())
    }

    pub fn with_policy(transport: Arc<dyn SshTransport>, policy: ReconnectPolicy) -> Self {
        Self {
            transport,
            table: Mutex::new(Table::default()),
            recovery: Mutex::new(()),
            next_lease: AtomicU64::new(1),
            policy,
        }
    }

    pub fn transport(&self) -> &Arc<dyn SshTransport> {
        &self.transport
    }

    /// Lease a forwarding to `remote_host:remote_port`, opening it if no
    /// other lease holds one. Returns the local port and the handle.
    pub async fn lease(
        &self,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(u16, LeaseHandle), ClientError> {
        let mut table = self.table.lock().await;
        self.ensure_connected(&mut table).await?;

        let target = (remote_host.to_string(), remote_port);
        let local_port = if let Some(tunnel) = table.tunnels.get_mut(&target) {
            tunnel.refcount += 1;
            tunnel.local_port
        } else {
            let local_port = self.open_forward(remote_host, remote_port).await?;
            table.tunnels.insert(
                target.clone(),
                Tunnel {
                    local_port,
                    refcount: 1,
                },
            );
            info!("Forwarding 127.0.0.1:{local_port} -> {remote_host}:{remote_port}");
            local_port
        };

        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        table.leases.insert(id, target);
        debug!("Lease {id} on {remote_host}:{remote_port} (local {local_port})");
        Ok((
            local_port,
            LeaseHandle {
                id,
                remote_host: remote_host.to_string(),
                remote_port,
            },
        ))
    }

    /// Open the SSH connection now instead of on the first lease.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut table = self.table.lock().await;
        self.ensure_connected(&mut table).await
    }

    async fn ensure_connected(&self, table: &mut Table) -> Result<(), ClientError> {
        if table.invalid {
            return Err(ClientError::TransportLost(
                "SSH connection was lost and could not be re-established".into(),
            ));
        }
        if !table.connected {
            self.transport.connect().await?;
            table.connected = true;
        }
        Ok(())
    }

    /// Drop a lease. The forwarding is cancelled with its last lease.
    /// Releasing the same handle twice is a no-op.
    pub async fn release(&self, handle: &LeaseHandle) {
        let mut table = self.table.lock().await;
        let Some(target) = table.leases.remove(&handle.id) else {
            return;
        };
        let Some(tunnel) = table.tunnels.get_mut(&target) else {
            return;
        };
        tunnel.refcount = tunnel.refcount.saturating_sub(1);
        if tunnel.refcount > 0 {
            debug!("Released lease {} ({} left on {}:{})", handle.id, tunnel.refcount, target.0, target.1);
            return;
        }
        let local_port = tunnel.local_port;
        table.tunnels.remove(&target);
        if let Err(e) = self
            .transport
            .cancel_forward(local_port, &target.0, target.1)
            .await
        {
            warn!("Failed to cancel forwarding {local_port} -> {}:{}: {e}", target.0, target.1);
        }
        info!("Closed forwarding 127.0.0.1:{local_port} -> {}:{}", target.0, target.1);
    }

    /// Number of live forwardings.
    pub async fn open_forwardings(&self) -> usize {
        self.table.lock().await.tunnels.len()
    }

    /// Local port currently serving `handle`, if it is still live.
    pub async fn local_port(&self, handle: &LeaseHandle) -> Option<u16> {
        let table = self.table.lock().await;
        let target = table.leases.get(&handle.id)?;
        table.tunnels.get(target).map(|t| t.local_port)
    }

    /// Check the transport and, if it dropped, reconnect and re-open every
    /// live forwarding.
    pub async fn recover(&self) -> Result<(), ClientError> {
        let _recovering = self.recovery.lock().await;
        {
            let table = self.table.lock().await;
            if table.invalid {
                return Err(ClientError::TransportLost("SSH connection already invalidated".into()));
            }
            if !table.connected {
                return Ok(());
            }
        }
        if self.transport.is_alive().await {
            return Ok(());
        }
        warn!(
            "SSH connection lost; {} forwarding(s) broken, reconnecting",
            self.open_forwardings().await
        );

        let mut delay = self.policy.base;
        let mut last = String::new();
        for attempt in 1..=self.policy.attempts {
            match self.reestablish().await {
                Ok(()) => {
                    info!("SSH connection re-established (attempt {attempt})");
                    return Ok(());
                }
                Err(e) => {
                    warn!("Reconnect attempt {attempt}/{} failed: {e}", self.policy.attempts);
                    last = e.to_string();
                }
            }
            if attempt < self.policy.attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.policy.cap);
            }
        }

        error!("Giving up on SSH connection: {last}");
        let mut table = self.table.lock().await;
        table.tunnels.clear();
        table.leases.clear();
        table.connected = false;
        table.invalid = true;
        Err(ClientError::TransportLost(last))
    }

    /// Reconnect, then re-open a snapshot of the live forwardings. Any that
    /// were released in the meantime are cancelled again.
    async fn reestablish(&self) -> Result<(), TransportError> {
        self.transport.connect().await?;
        let snapshot: Vec<(Target, u16)> = {
            let table = self.table.lock().await;
            table
                .tunnels
                .iter()
                .map(|(target, tunnel)| (target.clone(), tunnel.local_port))
                .collect()
        };
        for ((host, port), local_port) in &snapshot {
            self.transport.open_forward(*local_port, host, *port).await?;
        }

        let table = self.table.lock().await;
        for (target, local_port) in &snapshot {
            let live = table
                .tunnels
                .get(target)
                .is_some_and(|t| t.local_port == *local_port);
            if !live {
                debug!("Forwarding {local_port} -> {}:{} released during recovery", target.0, target.1);
                if let Err(e) = self
                    .transport
                    .cancel_forward(*local_port, &target.0, target.1)
                    .await
                {
                    debug!("Cancel {local_port}:{}:{} failed: {e}", target.0, target.1);
                }
            }
        }
        Ok(())
    }

    /// Tear down every forwarding and the SSH connection. Further leases
    /// fail with `TransportLost`.
    pub async fn close(&self) {
        let mut table = self.table.lock().await;
        if table.invalid {
            return;
        }
        for ((host, port), tunnel) in table.tunnels.drain() {
            if let Err(e) = self
                .transport
                .cancel_forward(tunnel.local_port, &host, port)
                .await
            {
                debug!("Cancel {}:{host}:{port} failed: {e}", tunnel.local_port);
            }
        }
        table.leases.clear();
        if table.connected {
            self.transport.disconnect().await;
        }
        table.connected = false;
        table.invalid = true;
    }

    async fn open_forward(&self, remote_host: &str, remote_port: u16) -> Result<u16, ClientError> {
        let mut last = String::new();
        for _ in 0..PORT_ATTEMPTS {
            let local_port = pick_local_port()?;
            match self
                .transport
                .open_forward(local_port, remote_host, remote_port)
                .await
            {
                Ok(()) => return Ok(local_port),
                Err(TransportError::AddressInUse(e)) => {
                    debug!("Local port {local_port} taken, picking another: {e}");
                    last = e;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ClientError::NoFreePort(format!(
            "{PORT_ATTEMPTS} local ports were taken before ssh could bind them: {last}"
        )))
    }
}

/// Ask the OS for an ephemeral port by binding to port 0.
fn pick_local_port() -> Result<u16, ClientError> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| ClientError::NoFreePort(e.to_string()))?;
    listener
        .local_addr()
        .map(|a| a.port())
        .map_err(|e| ClientError::NoFreePort(e.to_string()))
}
