//! Local representative of one remote kernel.
//!
//! ```text
//! idle → requesting → tunnelling → ready ⇄ degraded → closing → closed
//! ```
//!
//! [`RemoteKernelClient::open`] asks the server for a kernel, leases one
//! tunnel per channel and returns a descriptor pointing at the local ends.
//! A heartbeat task then watches the kernel: three missed probes make it
//! `degraded` (and trigger a tunnel recovery), an echo makes it `ready`
//! again, and staying degraded past the grace period closes the client.
//!
//! Closing always releases every tunnel lease, whether or not the remote
//! `DELETE` succeeded. `closed` is final.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use spyder_remote_protocol::{ConnectionDescriptor, KernelModel, PortMapping};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::RemoteServicesClient;
use crate::heartbeat::{HeartbeatPolicy, HeartbeatProbe, HeartbeatTracker, Verdict, ZmqHeartbeat};
use crate::tunnel::{LeaseHandle, TunnelManager};
use crate::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Idle,
    Requesting,
    Tunnelling,
    Ready,
    Degraded,
    Closing,
    Closed,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Requesting => "requesting",
            Self::Tunnelling => "tunnelling",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transition, as delivered to [`RemoteKernelClient::on_state_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ClientState,
    pub to: ClientState,
}

/// Builds the heartbeat probe for a freshly opened local descriptor.
pub type ProbeFactory = Arc<dyn Fn(&ConnectionDescriptor) -> Box<dyn HeartbeatProbe> + Send + Sync>;

type Callback = Arc<dyn Fn(StateChange) + Send + Sync>;

#[derive(Clone)]
pub struct KernelOptions {
    /// Attempts for the spawn request and for tunnel setup, each.
    pub open_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub retry_base: Duration,
    pub heartbeat: HeartbeatPolicy,
    /// Timeout for the best-effort `DELETE` while closing.
    pub request_timeout: Duration,
    pub probe: ProbeFactory,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            open_attempts: 3,
            retry_base: Duration::from_secs(1),
            heartbeat: HeartbeatPolicy::default(),
            request_timeout: Duration::from_secs(5),
            probe: Arc::new(|d: &ConnectionDescriptor| -> Box<dyn HeartbeatProbe> {
                Box::new(ZmqHeartbeat::new(d))
            }),
        }
    }
}

struct Session {
    state: ClientState,
    kernel: Option<KernelModel>,
    local: Option<ConnectionDescriptor>,
    leases: Vec<LeaseHandle>,
    monitor: Option<JoinHandle<()>>,
}

struct Inner {
    api: Arc<RemoteServicesClient>,
    tunnels: Arc<TunnelManager>,
    options: KernelOptions,
    session: Mutex<Session>,
    state_tx: watch::Sender<ClientState>,
    changes: mpsc::UnboundedSender<StateChange>,
    callbacks: Arc<Mutex<Vec<Callback>>>,
    abort_open: CancellationToken,
}

/// Cheap to clone; clones share one kernel.
#[derive(Clone)]
pub struct RemoteKernelClient {
    inner: Arc<Inner>,
}

impl RemoteKernelClient {
    /// Must be called inside a Tokio runtime.
    pub fn new(
        api: Arc<RemoteServicesClient>,
        tunnels: Arc<TunnelManager>,
        options: KernelOptions,
    ) -> Self {
        let (changes, rx) = mpsc::unbounded_channel();
        let callbacks: Arc<Mutex<Vec<Callback>>> = Arc::default();
        tokio::spawn(dispatch_changes(rx, Arc::clone(&callbacks)));
        let (state_tx, _) = watch::channel(ClientState::Idle);
        Self {
            inner: Arc::new(Inner {
                api,
                tunnels,
                options,
                session: Mutex::new(Session {
                    state: ClientState::Idle,
                    kernel: None,
                    local: None,
                    leases: Vec::new(),
                    monitor: None,
                }),
                state_tx,
                changes,
                callbacks,
                abort_open: CancellationToken::new(),
            }),
        }
    }

    /// Non-blocking snapshot of the current state.
    pub fn status(&self) -> ClientState {
        self.inner.lock().state
    }

    /// Register `callback` for every later transition. Transitions are
    /// delivered one at a time, in the order they happened.
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(StateChange) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// The server's record of the kernel, once spawned.
    pub fn kernel(&self) -> Option<KernelModel> {
        self.inner.lock().kernel.clone()
    }

    pub fn kernel_id(&self) -> Option<String> {
        self.inner.lock().kernel.as_ref().map(|k| k.id.clone())
    }

    /// The descriptor with local ports, while ready or degraded.
    pub fn local_descriptor(&self) -> Option<ConnectionDescriptor> {
        self.inner.lock().local.clone()
    }

    /// Spawn a kernel of spec `name` and tunnel it. See
    /// [`Self::open_with`].
    pub async fn open(&self, name: Option<&str>) -> Result<ConnectionDescriptor, ClientError> {
        self.open_with(name, &HashMap::new(), CancellationToken::new())
            .await
    }

    /// Spawn and tunnel a kernel, returning its local descriptor.
    ///
    /// Cancelling `cancel` (or calling [`Self::close`]) while this runs
    /// moves the client to `closing`: leases already taken are released and
    /// a kernel already spawned is deleted on a best-effort basis.
    pub async fn open_with(
        &self,
        name: Option<&str>,
        env: &HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<ConnectionDescriptor, ClientError> {
        {
            let mut session = self.inner.lock();
            match session.state {
                ClientState::Idle => self.inner.transition(&mut session, ClientState::Requesting),
                ClientState::Ready | ClientState::Degraded => {
                    return session
                        .local
                        .clone()
                        .ok_or_else(|| ClientError::InvalidState("no local descriptor".into()));
                }
                ClientState::Requesting | ClientState::Tunnelling => {
                    return Err(ClientError::InvalidState("open already in progress".into()));
                }
                ClientState::Closing | ClientState::Closed => return Err(ClientError::Closed),
            }
        }

        let mut guard = OpenGuard {
            client: self,
            armed: true,
        };
        let result = tokio::select! {
            r = self.establish(name, env) => r,
            () = cancel.cancelled() => Err(ClientError::Cancelled),
            () = self.inner.abort_open.cancelled() => Err(ClientError::Cancelled),
        };
        guard.armed = false;

        let result = result.and_then(|local| {
            let mut session = self.inner.lock();
            if session.state != ClientState::Tunnelling {
                return Err(ClientError::Closed);
            }
            session.local = Some(local.clone());
            let probe = (self.inner.options.probe)(&local);
            session.monitor = Some(tokio::spawn(monitor_heartbeat(
                Arc::downgrade(&self.inner),
                probe,
                self.inner.options.heartbeat,
            )));
            self.inner.transition(&mut session, ClientState::Ready);
            Ok(local)
        });
        match result {
            Ok(local) => {
                info!("Kernel ready on local ports {:?}", local.ports());
                Ok(local)
            }
            Err(e) => {
                warn!("Opening kernel failed: {e}");
                self.finish_close().await;
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        name: Option<&str>,
        env: &HashMap<String, String>,
    ) -> Result<ConnectionDescriptor, ClientError> {
        let attempts = self.inner.options.open_attempts.max(1);
        let base = self.inner.options.retry_base;

        let kernel = retry("spawn", attempts, base, || {
            self.inner.api.spawn_kernel(name, env)
        })
        .await?;
        info!("Kernel {} ({}) spawned, pid {}", kernel.id, kernel.name, kernel.pid);
        let remote = kernel.connection.clone();
        let id = kernel.id.clone();
        {
            let mut session = self.inner.lock();
            session.kernel = Some(kernel);
            self.inner.transition(&mut session, ClientState::Tunnelling);
        }

        let local = retry("tunnel", attempts, base, || self.install_tunnels(&remote)).await?;

        if let Err(e) = self.inner.api.attach_kernel(&id).await {
            warn!("Failed to attach to kernel {id}: {e}");
        }
        Ok(local)
    }

    /// Lease one forwarding per channel and rewrite the descriptor to them.
    async fn install_tunnels(&self, remote: &ConnectionDescriptor) -> Result<ConnectionDescriptor, ClientError> {
        self.release_leases().await;
        let host = match remote.ip.as_str() {
            "0.0.0.0" | "" => "127.0.0.1",
            ip => ip,
        };
        let mut mapping = remote.ports();
        for (channel, port) in remote.ports().iter() {
            let (local_port, handle) = self.inner.tunnels.lease(host, port).await?;
            self.inner.lock().leases.push(handle);
            mapping.set(channel, local_port);
        }
        Ok(local_descriptor(remote, &mapping))
    }

    async fn release_leases(&self) {
        let leases = std::mem::take(&mut self.inner.lock().leases);
        for lease in &leases {
            self.inner.tunnels.release(lease).await;
        }
    }

    /// Shut the kernel down and release its tunnels. Idempotent and safe
    /// from any state; returns once the client is `closed`.
    pub async fn close(&self) {
        let mut closed = self.inner.state_tx.subscribe();
        let tear_down = {
            let mut session = self.inner.lock();
            match session.state {
                ClientState::Closed => return,
                ClientState::Closing => false,
                ClientState::Requesting | ClientState::Tunnelling => {
                    // The pending open performs the teardown.
                    self.inner.abort_open.cancel();
                    false
                }
                ClientState::Idle | ClientState::Ready | ClientState::Degraded => {
                    self.inner.transition(&mut session, ClientState::Closing);
                    true
                }
            }
        };
        if tear_down {
            self.finish_close().await;
        } else {
            let _ = closed.wait_for(|s| *s == ClientState::Closed).await;
        }
    }

    /// `closing → closed`. The teardown runs as its own task so that it
    /// completes even if the caller stops waiting.
    async fn finish_close(&self) {
        let (kernel, leases, monitor) = {
            let mut session = self.inner.lock();
            if session.state == ClientState::Closed {
                return;
            }
            if session.state != ClientState::Closing {
                self.inner.transition(&mut session, ClientState::Closing);
            }
            session.local = None;
            (
                session.kernel.clone(),
                std::mem::take(&mut session.leases),
                session.monitor.take(),
            )
        };
        if let Some(monitor) = monitor {
            monitor.abort();
        }

        let inner = Arc::clone(&self.inner);
        let teardown = tokio::spawn(async move {
            if let Some(kernel) = &kernel {
                match tokio::time::timeout(
                    inner.options.request_timeout,
                    inner.api.delete_kernel(&kernel.id, false),
                )
                .await
                {
                    Ok(Ok(())) => info!("Kernel {} deleted", kernel.id),
                    Ok(Err(e)) if e.is_not_found() => debug!("Kernel {} already gone", kernel.id),
                    Ok(Err(e)) => warn!("Failed to delete kernel {}: {e}", kernel.id),
                    Err(_) => warn!("Timed out deleting kernel {}", kernel.id),
                }
            }
            for lease in &leases {
                inner.tunnels.release(lease).await;
            }
            let mut session = inner.lock();
            inner.transition(&mut session, ClientState::Closed);
        });
        if let Err(e) = teardown.await {
            error!("Kernel teardown task failed: {e}");
        }
    }

    /// `POST /kernels/{id}/interrupt`
    pub async fn interrupt(&self) -> Result<(), ClientError> {
        let id = self.live_kernel_id()?;
        self.inner.api.interrupt_kernel(&id).await
    }

    /// Restart the remote kernel. Ports are kept, so tunnels stay up.
    pub async fn restart(&self) -> Result<KernelModel, ClientError> {
        let id = self.live_kernel_id()?;
        let model = self.inner.api.restart_kernel(&id).await?;
        self.inner.lock().kernel = Some(model.clone());
        Ok(model)
    }

    fn live_kernel_id(&self) -> Result<String, ClientError> {
        let session = self.inner.lock();
        match session.state {
            ClientState::Ready | ClientState::Degraded => session
                .kernel
                .as_ref()
                .map(|k| k.id.clone())
                .ok_or_else(|| ClientError::InvalidState("no kernel".into())),
            ClientState::Closing | ClientState::Closed => Err(ClientError::Closed),
            state => Err(ClientError::InvalidState(format!("kernel is {state}"))),
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record a transition. Callers hold the session lock, which keeps the
    /// queued changes in order.
    fn transition(&self, session: &mut Session, to: ClientState) {
        let from = session.state;
        if from == to || from == ClientState::Closed {
            return;
        }
        session.state = to;
        info!("Kernel client {from} -> {to}");
        self.state_tx.send_replace(to);
        let _ = self.changes.send(StateChange { from, to });
    }

    /// Transition only if the client is still in `from`.
    fn transition_from(&self, from: ClientState, to: ClientState) -> bool {
        let mut session = self.lock();
        if session.state != from {
            return false;
        }
        self.transition(&mut session, to);
        true
    }
}

async fn dispatch_changes(
    mut rx: mpsc::UnboundedReceiver<StateChange>,
    callbacks: Arc<Mutex<Vec<Callback>>>,
) {
    while let Some(change) = rx.recv().await {
        let callbacks = callbacks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(change);
        }
        if change.to == ClientState::Closed {
            return;
        }
    }
}

async fn retry<T, F, Fut>(what: &str, attempts: u32, base: Duration, mut op: F) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ClientError>>,
{
    let mut delay = base;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts && e.is_transient() => {
                warn!("{what} attempt {attempt}/{attempts} failed: {e}; retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(30));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn local_descriptor(remote: &ConnectionDescriptor, mapping: &PortMapping) -> ConnectionDescriptor {
    remote.with_ports(mapping).with_ip("127.0.0.1")
}

async fn monitor_heartbeat(
    inner: Weak<Inner>,
    mut probe: Box<dyn HeartbeatProbe>,
    policy: HeartbeatPolicy,
) {
    let mut tracker = HeartbeatTracker::new(policy);
    let mut ticker = tokio::time::interval(policy.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let echoed = probe.ping(policy.interval).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match tracker.record(echoed, Instant::now()) {
            Some(Verdict::Degraded) => {
                warn!("Kernel missed {} heartbeats", tracker.missed());
                if !inner.transition_from(ClientState::Ready, ClientState::Degraded) {
                    return;
                }
                if let Err(e) = inner.tunnels.recover().await {
                    error!("Tunnels could not be recovered: {e}");
                    spawn_close(inner);
                    return;
                }
            }
            Some(Verdict::Recovered) => {
                info!("Kernel heartbeat recovered");
                inner.transition_from(ClientState::Degraded, ClientState::Ready);
            }
            Some(Verdict::Expired) => {
                warn!(
                    "Kernel degraded for more than {:?}; closing",
                    policy.degraded_grace
                );
                spawn_close(inner);
                return;
            }
            None => {}
        }
    }
}

/// Tears the client down if an `open` future is dropped before it
/// finishes.
struct OpenGuard<'a> {
    client: &'a RemoteKernelClient,
    armed: bool,
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let client = self.client.clone();
            handle.spawn(async move { client.finish_close().await });
        }
    }
}

/// Close from inside the monitor task, which `close` itself aborts.
fn spawn_close(inner: Arc<Inner>) {
    let client = RemoteKernelClient { inner };
    tokio::spawn(async move { client.close().await });
}
