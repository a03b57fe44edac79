//! Kernel lifecycle management.
//!
//! [`KernelRegistry`] is the single authority for spawning, inspecting, and
//! destroying kernel processes on this host.
//!
//! | Operation     | Effect                                                      |
//! |---------------|-------------------------------------------------------------|
//! | `spawn`       | resolve spec, write connection file, start, wait for ports  |
//! | `get`/`list`  | snapshot one record / ids ascending by creation             |
//! | `delete`      | shutdown request → SIGTERM → SIGKILL, then forget the record |
//! | `interrupt`   | SIGINT to the kernel's process group                        |
//! | `restart`     | stop and start again on the same id and ports               |
//! | `attach`/`detach` | count frontends connected to the kernel                 |
//! | `subscribe`   | stream of state transitions until the record is deleted     |
//! | `sweep`       | drop dead records, shut down idle unattended kernels        |
//!
//! ## State machine
//!
//! `starting → idle ⇄ busy → dead`. `dead` is terminal and carries a reason:
//! `shutdown` (requested), `timeout` (never became ready), `oom` (SIGKILL
//! while the cgroup OOM counter rose), otherwise `crash`. The per-kernel
//! connection directory is removed on entry to `dead`.
//!
//! ## Concurrency
//!
//! The id map sits behind an `RwLock`; `get` and `list` take it shared.
//! Each record has its own `Mutex` that serializes its state mutations.
//! Background workers (exit watchers, IOPub watchers) never touch records
//! directly: they push [`RegistryEvent`]s into a bounded channel drained by a
//! single supervisor task.

pub mod channels;
pub mod probe;
pub mod spec;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::{Duration, Instant};

use spyder_remote_protocol::{
    epoch_millis, ConnectionDescriptor, DeathReason, ErrorKind, ExecutionState, KernelModel,
    StateEvent,
};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::environ::EnvironStore;
use crate::error::ApiError;
use crate::process;
use crate::util::expand_tilde;
pub use spec::{KernelSpec, SpecSearch};

/// Depth of the worker → supervisor queue.
const EVENT_QUEUE_DEPTH: usize = 64;
/// Buffered state events per subscriber before it starts lagging.
const NOTICE_CAPACITY: usize = 64;
const READY_POLL: Duration = Duration::from_millis(100);

/// Registry settings derived from [`Config`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub ip: String,
    pub default_kernel_name: String,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub idle_timeout: Duration,
    pub working_dir: PathBuf,
}

impl RegistryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ip: config.server.ip.clone(),
            default_kernel_name: config.kernels.default_kernel_name.clone(),
            startup_timeout: Duration::from_secs(config.kernels.startup_timeout_secs),
            shutdown_grace: Duration::from_secs(config.kernels.shutdown_grace_secs),
            idle_timeout: Duration::from_secs(config.kernels.idle_timeout_secs),
            working_dir: PathBuf::from(expand_tilde(&config.files.root).as_ref()),
        }
    }
}

/// Errors returned by [`KernelRegistry`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No kernel spec with this name.
    UnknownKernel(String),
    /// The process could not be started or exited during startup.
    SpawnFailed(String),
    /// The process did not bind its ports within the startup timeout.
    StartupTimeout(String),
    /// No record with this id.
    NoSuchKernel(String),
    /// The kernel is dead and cannot take the requested action.
    Dead(String),
    /// Signal delivery failed.
    Signal(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownKernel(_) => ErrorKind::UnknownKernel,
            Self::SpawnFailed(_) => ErrorKind::SpawnFailed,
            Self::StartupTimeout(_) => ErrorKind::StartupTimeout,
            Self::NoSuchKernel(_) => ErrorKind::NoSuchKernel,
            Self::Dead(_) => ErrorKind::InvalidRequest,
            Self::Signal(_) => ErrorKind::Io,
        }
    }
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownKernel(name) => write!(f, "No such kernel spec: {name}"),
            Self::SpawnFailed(e) => write!(f, "Failed to start kernel: {e}"),
            Self::StartupTimeout(id) => write!(f, "Kernel {id} did not become ready in time"),
            Self::NoSuchKernel(id) => write!(f, "No such kernel: {id}"),
            Self::Dead(id) => write!(f, "Kernel {id} is dead"),
            Self::Signal(e) => write!(f, "Failed to signal kernel: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        ApiError::new(e.kind(), e.to_string())
    }
}

/// Messages from background workers to the supervisor task.
#[derive(Debug)]
pub(crate) enum RegistryEvent {
    Exited {
        id: String,
        generation: u64,
        code: Option<i32>,
        signal: Option<i32>,
    },
    Status {
        id: String,
        generation: u64,
        state: ExecutionState,
    },
    Activity {
        id: String,
        generation: u64,
    },
}

#[derive(Debug, Clone)]
enum Notice {
    State(StateEvent),
    Removed,
}

/// Ordered state transitions of one kernel, starting with its current state.
pub struct Subscription {
    first: Option<StateEvent>,
    rx: broadcast::Receiver<Notice>,
}

impl Subscription {
    /// Next transition, or `None` once the record has been deleted.
    pub async fn next(&mut self) -> Option<StateEvent> {
        if let Some(first) = self.first.take() {
            return Some(first);
        }
        loop {
            match self.rx.recv().await {
                Ok(Notice::State(ev)) => return Some(ev),
                Ok(Notice::Removed) | Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("state subscriber lagged by {n} events");
                }
            }
        }
    }
}

struct KernelRecord {
    name: String,
    pid: u32,
    descriptor: ConnectionDescriptor,
    connection_dir: PathBuf,
    connection_file: PathBuf,
    argv: Vec<String>,
    env: HashMap<String, String>,
    created: u64,
    last_activity: Instant,
    last_activity_ms: u64,
    execution_state: ExecutionState,
    connections: u32,
    reason: Option<DeathReason>,
    /// Bumped on every (re)start so events from a previous process are ignored.
    generation: u64,
    shutdown_requested: bool,
    oom_baseline: Option<u64>,
    watchers: Vec<JoinHandle<()>>,
}

impl KernelRecord {
    fn model(&self, id: &str) -> KernelModel {
        KernelModel {
            id: id.to_string(),
            name: self.name.clone(),
            pid: self.pid,
            connection: self.descriptor.clone(),
            execution_state: self.execution_state,
            connections: self.connections,
            last_activity: self.last_activity_ms,
            created: self.created,
            reason: self.reason,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_ms = epoch_millis();
    }
}

struct KernelSlot {
    id: String,
    seq: u64,
    record: Mutex<KernelRecord>,
    notices: broadcast::Sender<Notice>,
}

impl KernelSlot {
    /// Move to `state`, notifying subscribers. No-op from `dead` or when
    /// already in `state`.
    fn transition(
        &self,
        rec: &mut KernelRecord,
        state: ExecutionState,
        reason: Option<DeathReason>,
    ) -> bool {
        if rec.execution_state == state || rec.execution_state.is_dead() {
            return false;
        }
        debug!(
            kernel = %self.id,
            "{} -> {}",
            rec.execution_state.as_str(),
            state.as_str()
        );
        rec.execution_state = state;
        rec.reason = reason;
        let _ = self.notices.send(Notice::State(StateEvent {
            kernel_id: self.id.clone(),
            execution_state: state,
            reason,
            timestamp: epoch_millis(),
        }));
        true
    }
}

struct Inner {
    config: RegistryConfig,
    specs: SpecSearch,
    environ: EnvironStore,
    kernels: RwLock<HashMap<String, Arc<KernelSlot>>>,
    next_seq: AtomicU64,
    reserved_ports: std::sync::Mutex<HashSet<u16>>,
    events: mpsc::Sender<RegistryEvent>,
}

/// Catalog of the kernels running on this host.
///
/// Cloneable; all clones share the same state. Must be created inside a
/// Tokio runtime (it starts the supervisor task).
#[derive(Clone)]
pub struct KernelRegistry {
    inner: Arc<Inner>,
}

impl KernelRegistry {
    pub fn new(config: RegistryConfig, specs: SpecSearch, environ: EnvironStore) -> Self {
        let (events, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let inner = Arc::new(Inner {
            config,
            specs,
            environ,
            kernels: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            reserved_ports: std::sync::Mutex::new(HashSet::new()),
            events,
        });
        tokio::spawn(supervise(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn specs(&self) -> &SpecSearch {
        &self.inner.specs
    }

    /// Spawn a kernel from spec `name` (the default spec when `None`) and wait
    /// until it listens on all five ports.
    ///
    /// The kernel's environment is the `/environ` overlay as of now, then
    /// the spec's `env`, then `env_overrides`.
    pub async fn spawn(
        &self,
        name: Option<&str>,
        env_overrides: &HashMap<String, String>,
    ) -> Result<KernelModel, RegistryError> {
        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.inner.config.default_kernel_name)
            .to_string();
        let spec = self
            .inner
            .specs
            .find(&name)
            .ok_or_else(|| RegistryError::UnknownKernel(name.clone()))?;

        let id = Uuid::new_v4().to_string();
        let ports = {
            let mut reserved = self.reserved();
            let ports = probe::allocate_ports(&self.inner.config.ip, &reserved)
                .map_err(|e| RegistryError::SpawnFailed(format!("no free ports: {e}")))?;
            reserved.extend(ports.iter().map(|(_, p)| p));
            ports
        };
        let descriptor = ConnectionDescriptor::generate(&self.inner.config.ip, ports, &name);
        let connection_dir = std::env::temp_dir().join(format!("spyder-kernel-{id}"));
        let connection_file = connection_dir.join(format!("kernel-{id}.json"));

        let mut env: HashMap<String, String> = self.inner.environ.snapshot().into_iter().collect();
        env.extend(spec.env.clone());
        env.extend(env_overrides.clone());

        let now = epoch_millis();
        let mut record = KernelRecord {
            name: name.clone(),
            pid: 0,
            descriptor,
            connection_dir,
            argv: spec.command(&connection_file),
            connection_file,
            env,
            created: now,
            last_activity: Instant::now(),
            last_activity_ms: now,
            execution_state: ExecutionState::Starting,
            connections: 0,
            reason: None,
            generation: 0,
            shutdown_requested: false,
            oom_baseline: None,
            watchers: Vec::new(),
        };

        if let Err(e) = self.start_process(&id, &mut record).await {
            self.release_ports(&record.descriptor);
            let _ = tokio::fs::remove_dir_all(&record.connection_dir).await;
            warn!("Kernel {id} ({name}) failed to start: {e}");
            return Err(e);
        }
        let pid = record.pid;

        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let slot = Arc::new(KernelSlot {
            id: id.clone(),
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            record: Mutex::new(record),
            notices,
        });
        self.inner
            .kernels
            .write()
            .await
            .insert(id.clone(), slot.clone());
        info!("Kernel {id} ({name}) spawned, pid {pid}");

        match self.await_ready(&slot).await {
            Ok(model) => {
                info!("Kernel {id} ready");
                Ok(model)
            }
            Err(e) => {
                warn!("Kernel {id} failed during startup: {e}");
                let _ = process::signal_group(pid, libc::SIGKILL);
                self.remove_slot(&slot).await;
                Err(e)
            }
        }
    }

    /// Snapshot of one record.
    pub async fn get(&self, id: &str) -> Result<KernelModel, RegistryError> {
        let slot = self.slot(id).await?;
        let rec = slot.record.lock().await;
        Ok(rec.model(id))
    }

    /// Ids of all records, ascending by creation.
    pub async fn list(&self) -> Vec<String> {
        let kernels = self.inner.kernels.read().await;
        let mut ids: Vec<(u64, String)> = kernels
            .values()
            .map(|s| (s.seq, s.id.clone()))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Shut a kernel down and forget it.
    ///
    /// Unless `now` is set, a `shutdown_request` is tried first and given the
    /// grace period. Then SIGTERM, another grace period, and SIGKILL.
    /// Deleting a kernel whose process already exited succeeds.
    pub async fn delete(&self, id: &str, now: bool) -> Result<(), RegistryError> {
        let slot = self.slot(id).await?;
        let (pid, descriptor, alive) = {
            let mut rec = slot.record.lock().await;
            rec.shutdown_requested = true;
            (
                rec.pid,
                rec.descriptor.clone(),
                !rec.execution_state.is_dead(),
            )
        };

        if alive {
            self.stop_process(id, pid, &descriptor, now).await;
            let mut rec = slot.record.lock().await;
            self.mark_dead(&slot, &mut rec, DeathReason::Shutdown).await;
        }
        self.remove_slot(&slot).await;
        info!("Kernel {id} deleted");
        Ok(())
    }

    /// Send SIGINT to the kernel's process group.
    pub async fn interrupt(&self, id: &str) -> Result<(), RegistryError> {
        let slot = self.slot(id).await?;
        let mut rec = slot.record.lock().await;
        if rec.execution_state.is_dead() {
            return Err(RegistryError::Dead(id.to_string()));
        }
        process::signal_group(rec.pid, libc::SIGINT)
            .map_err(|e| RegistryError::Signal(e.to_string()))?;
        rec.touch();
        info!("Kernel {id} interrupted");
        Ok(())
    }

    /// Stop the kernel process and start it again with the same id,
    /// connection file, and ports.
    pub async fn restart(&self, id: &str) -> Result<KernelModel, RegistryError> {
        let slot = self.slot(id).await?;
        let (pid, descriptor) = {
            let mut rec = slot.record.lock().await;
            if rec.execution_state.is_dead() {
                return Err(RegistryError::Dead(id.to_string()));
            }
            rec.generation += 1;
            for w in rec.watchers.drain(..) {
                w.abort();
            }
            (rec.pid, rec.descriptor.clone())
        };

        info!("Restarting kernel {id}");
        self.stop_process(id, pid, &descriptor, true).await;

        {
            let mut rec = slot.record.lock().await;
            slot.transition(&mut rec, ExecutionState::Starting, None);
            if let Err(e) = self.start_process(id, &mut rec).await {
                self.mark_dead(&slot, &mut rec, DeathReason::Crash).await;
                return Err(e);
            }
        }
        self.await_ready(&slot).await
    }

    /// Record a frontend connecting to the kernel.
    pub async fn attach(&self, id: &str) -> Result<KernelModel, RegistryError> {
        let slot = self.slot(id).await?;
        let mut rec = slot.record.lock().await;
        rec.connections += 1;
        rec.touch();
        Ok(rec.model(id))
    }

    /// Record a frontend disconnecting from the kernel.
    pub async fn detach(&self, id: &str) -> Result<KernelModel, RegistryError> {
        let slot = self.slot(id).await?;
        let mut rec = slot.record.lock().await;
        rec.connections = rec.connections.saturating_sub(1);
        rec.touch();
        Ok(rec.model(id))
    }

    /// Follow a kernel's state transitions. The stream yields the current
    /// state first and ends when the record is deleted.
    pub async fn subscribe(&self, id: &str) -> Result<Subscription, RegistryError> {
        let slot = self.slot(id).await?;
        let rx = slot.notices.subscribe();
        let rec = slot.record.lock().await;
        Ok(Subscription {
            first: Some(StateEvent {
                kernel_id: id.to_string(),
                execution_state: rec.execution_state,
                reason: rec.reason,
                timestamp: epoch_millis(),
            }),
            rx,
        })
    }

    /// Remove dead records and shut down kernels that have had no
    /// connections and no activity for the idle timeout. Returns the ids
    /// removed.
    pub async fn sweep(&self) -> Vec<String> {
        let slots: Vec<Arc<KernelSlot>> = self.inner.kernels.read().await.values().cloned().collect();
        let mut dead = Vec::new();
        let mut idle = Vec::new();
        for slot in slots {
            let rec = slot.record.lock().await;
            if rec.execution_state.is_dead() {
                drop(rec);
                dead.push(slot);
            } else if rec.connections == 0
                && rec.last_activity.elapsed() >= self.inner.config.idle_timeout
            {
                idle.push(slot.id.clone());
            }
        }

        let mut removed = Vec::with_capacity(dead.len() + idle.len());
        for slot in dead {
            self.remove_slot(&slot).await;
            info!("Swept dead kernel {}", slot.id);
            removed.push(slot.id.clone());
        }
        for id in idle {
            info!(
                "Kernel {id} idle for over {}s with no connections, shutting down",
                self.inner.config.idle_timeout.as_secs()
            );
            if self.delete(&id, false).await.is_ok() {
                removed.push(id);
            }
        }
        removed
    }

    /// Delete every kernel (server shutdown).
    pub async fn shutdown_all(&self) {
        let ids = self.list().await;
        if ids.is_empty() {
            return;
        }
        let count = ids.len();
        futures::future::join_all(ids.iter().map(|id| self.delete(id, false))).await;
        info!("Shut down {count} kernel(s)");
    }

    async fn slot(&self, id: &str) -> Result<Arc<KernelSlot>, RegistryError> {
        self.inner
            .kernels
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NoSuchKernel(id.to_string()))
    }

    fn reserved(&self) -> std::sync::MutexGuard<'_, HashSet<u16>> {
        self.inner
            .reserved_ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn release_ports(&self, descriptor: &ConnectionDescriptor) {
        let mut reserved = self.reserved();
        for (_, port) in descriptor.ports().iter() {
            reserved.remove(&port);
        }
    }

    /// Write the connection file and start the process for `rec`, wiring an
    /// exit watcher into the supervisor queue.
    async fn start_process(&self, id: &str, rec: &mut KernelRecord) -> Result<(), RegistryError> {
        tokio::fs::create_dir_all(&rec.connection_dir)
            .await
            .map_err(|e| RegistryError::SpawnFailed(format!("connection dir: {e}")))?;
        tokio::fs::write(&rec.connection_file, rec.descriptor.serialize())
            .await
            .map_err(|e| RegistryError::SpawnFailed(format!("connection file: {e}")))?;

        let mut child = process::spawn_kernel(id, &rec.argv, &rec.env, &self.inner.config.working_dir)
            .map_err(|e| {
                RegistryError::SpawnFailed(format!(
                    "{}: {e}",
                    rec.argv.first().map_or("<empty argv>", String::as_str)
                ))
            })?;

        rec.generation += 1;
        rec.pid = child.id().unwrap_or(0);
        rec.oom_baseline = probe::oom_kill_count();
        rec.shutdown_requested = false;
        rec.touch();

        let events = self.inner.events.clone();
        let generation = rec.generation;
        let kernel_id = id.to_string();
        tokio::spawn(async move {
            use std::os::unix::process::ExitStatusExt;
            let (code, signal) = match child.wait().await {
                Ok(status) => (status.code(), status.signal()),
                Err(e) => {
                    warn!(kernel = %kernel_id, "wait failed: {e}");
                    (None, None)
                }
            };
            let _ = events
                .send(RegistryEvent::Exited {
                    id: kernel_id,
                    generation,
                    code,
                    signal,
                })
                .await;
        });
        Ok(())
    }

    /// Poll until the kernel listens on every port, it dies, or the startup
    /// timeout passes.
    async fn await_ready(&self, slot: &Arc<KernelSlot>) -> Result<KernelModel, RegistryError> {
        let deadline = tokio::time::Instant::now() + self.inner.config.startup_timeout;
        loop {
            let descriptor = {
                let rec = slot.record.lock().await;
                if rec.execution_state.is_dead() {
                    let why = rec.reason.map_or("unknown", DeathReason::as_str);
                    return Err(RegistryError::SpawnFailed(format!(
                        "kernel exited during startup ({why})"
                    )));
                }
                rec.descriptor.clone()
            };

            if probe::ports_listening(&descriptor.ip, &descriptor.ports()).await {
                let mut rec = slot.record.lock().await;
                if rec.execution_state.is_dead() {
                    continue;
                }
                if rec.execution_state == ExecutionState::Starting {
                    slot.transition(&mut rec, ExecutionState::Idle, None);
                }
                rec.touch();
                let watcher = tokio::spawn(channels::watch_iopub(
                    slot.id.clone(),
                    rec.generation,
                    descriptor,
                    self.inner.events.clone(),
                ));
                rec.watchers.push(watcher);
                return Ok(rec.model(&slot.id));
            }

            if tokio::time::Instant::now() >= deadline {
                let mut rec = slot.record.lock().await;
                let _ = process::signal_group(rec.pid, libc::SIGKILL);
                self.mark_dead(slot, &mut rec, DeathReason::Timeout).await;
                return Err(RegistryError::StartupTimeout(slot.id.clone()));
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn stop_process(&self, id: &str, pid: u32, descriptor: &ConnectionDescriptor, now: bool) {
        let grace = self.inner.config.shutdown_grace;
        if !now {
            if channels::request_shutdown(descriptor, Duration::from_secs(1)).await {
                debug!(kernel = %id, "shutdown_request sent");
                if process::wait_gone(pid, grace).await {
                    return;
                }
            } else {
                debug!(kernel = %id, "shutdown_request not delivered");
            }
        }
        if process::signal_group(pid, libc::SIGTERM).is_ok() && process::wait_gone(pid, grace).await {
            return;
        }
        warn!("Kernel {id} did not exit after SIGTERM, sending SIGKILL");
        let _ = process::signal_group(pid, libc::SIGKILL);
        process::wait_gone(pid, Duration::from_secs(2)).await;
    }

    async fn mark_dead(&self, slot: &KernelSlot, rec: &mut KernelRecord, reason: DeathReason) {
        if rec.execution_state.is_dead() {
            return;
        }
        for w in rec.watchers.drain(..) {
            w.abort();
        }
        slot.transition(rec, ExecutionState::Dead, Some(reason));
        self.release_ports(&rec.descriptor);
        match tokio::fs::remove_dir_all(&rec.connection_dir).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!("Failed to remove {}: {e}", rec.connection_dir.display());
            }
            _ => {}
        }
        info!("Kernel {} dead ({})", slot.id, reason.as_str());
    }

    async fn remove_slot(&self, slot: &Arc<KernelSlot>) {
        let mut kernels = self.inner.kernels.write().await;
        if kernels.get(&slot.id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            kernels.remove(&slot.id);
        }
        drop(kernels);
        let _ = slot.notices.send(Notice::Removed);
    }

    async fn apply(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Exited {
                id,
                generation,
                code,
                signal,
            } => {
                let Ok(slot) = self.slot(&id).await else {
                    return;
                };
                let mut rec = slot.record.lock().await;
                if rec.generation != generation || rec.execution_state.is_dead() {
                    return;
                }
                let reason = classify_exit(rec.shutdown_requested, signal, rec.oom_baseline);
                if reason == DeathReason::Shutdown {
                    info!("Kernel {id} exited (code {code:?})");
                } else {
                    warn!("Kernel {id} exited unexpectedly (code {code:?}, signal {signal:?})");
                }
                self.mark_dead(&slot, &mut rec, reason).await;
            }
            RegistryEvent::Status {
                id,
                generation,
                state,
            } => {
                let Ok(slot) = self.slot(&id).await else {
                    return;
                };
                let mut rec = slot.record.lock().await;
                if rec.generation != generation {
                    return;
                }
                rec.touch();
                if state != ExecutionState::Dead {
                    slot.transition(&mut rec, state, None);
                }
            }
            RegistryEvent::Activity { id, generation } => {
                let Ok(slot) = self.slot(&id).await else {
                    return;
                };
                let mut rec = slot.record.lock().await;
                if rec.generation == generation {
                    rec.touch();
                }
            }
        }
    }
}

/// Supervisor loop. Holds only a weak reference so dropping the last
/// registry handle ends it.
async fn supervise(inner: Weak<Inner>, mut rx: mpsc::Receiver<RegistryEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        KernelRegistry { inner }.apply(event).await;
    }
}

fn classify_exit(
    shutdown_requested: bool,
    signal: Option<i32>,
    oom_baseline: Option<u64>,
) -> DeathReason {
    if shutdown_requested {
        return DeathReason::Shutdown;
    }
    if signal == Some(libc::SIGKILL) {
        if let (Some(before), Some(after)) = (oom_baseline, probe::oom_kill_count()) {
            if after > before {
                return DeathReason::Oom;
            }
        }
    }
    DeathReason::Crash
}
