//! Shared fakes: an in-memory SSH transport, a scripted heartbeat probe and
//! a stand-in services server on a loopback port.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use spyder_remote_client::heartbeat::HeartbeatProbe;
use spyder_remote_client::kernel::ProbeFactory;
use spyder_remote_client::tunnel::{SshTransport, TransportError};
use spyder_remote_client::{HeartbeatPolicy, KernelOptions, RemoteServicesClient};
use spyder_remote_protocol::{ConnectionDescriptor, ExecutionState, KernelModel, PortMapping};

pub const TOKEN: &str = "test-token";

// ---------------------------------------------------------------------------
// SSH transport
// ---------------------------------------------------------------------------

type Forward = (u16, String, u16);

#[derive(Default)]
pub struct FakeTransport {
    pub connects: AtomicUsize,
    pub opens: AtomicUsize,
    pub cancels: AtomicUsize,
    pub disconnects: AtomicUsize,
    /// Next N `open_forward` calls fail with `AddressInUse`.
    pub busy_ports: AtomicU32,
    /// Every `open_forward` fails with `Denied`.
    pub deny: AtomicBool,
    /// Flip to simulate a dropped connection.
    pub dead: AtomicBool,
    /// Next N `connect` calls fail with `Lost`.
    pub failing_connects: AtomicU32,
    pub exec_output: Mutex<String>,
    forwards: Mutex<HashSet<Forward>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn active_forwards(&self) -> usize {
        self.forwards.lock().unwrap().len()
    }

    pub fn forwards_to(&self, remote_port: u16) -> Vec<u16> {
        self.forwards
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, rp)| *rp == remote_port)
            .map(|(lp, _, _)| *lp)
            .collect()
    }
}

#[async_trait]
impl SshTransport for FakeTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Lost("connection refused".into()));
        }
        self.dead.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn open_forward(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.deny.load(Ordering::SeqCst) {
            return Err(TransportError::Denied(
                "administratively prohibited: open failed".into(),
            ));
        }
        if self
            .busy_ports
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::AddressInUse(format!(
                "bind 127.0.0.1:{local_port}: Address already in use"
            )));
        }
        self.forwards
            .lock()
            .unwrap()
            .insert((local_port, remote_host.to_string(), remote_port));
        Ok(())
    }

    async fn cancel_forward(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), TransportError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.forwards
            .lock()
            .unwrap()
            .remove(&(local_port, remote_host.to_string(), remote_port));
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    async fn exec(&self, _command: &str) -> Result<String, TransportError> {
        Ok(self.exec_output.lock().unwrap().clone())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.forwards.lock().unwrap().clear();
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Replies from a shared script; `true` once the script runs out.
pub struct FakeProbe {
    script: Arc<Mutex<VecDeque<bool>>>,
    fallback: bool,
}

#[async_trait]
impl HeartbeatProbe for FakeProbe {
    async fn ping(&mut self, _timeout: Duration) -> bool {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

/// Options with millisecond timings and a scripted probe.
pub fn fast_options(script: Vec<bool>, fallback: bool) -> KernelOptions {
    let script = Arc::new(Mutex::new(VecDeque::from(script)));
    let probe: ProbeFactory = Arc::new(move |_: &ConnectionDescriptor| -> Box<dyn HeartbeatProbe> {
        Box::new(FakeProbe {
            script: Arc::clone(&script),
            fallback,
        })
    });
    KernelOptions {
        open_attempts: 3,
        retry_base: Duration::from_millis(10),
        heartbeat: HeartbeatPolicy {
            interval: Duration::from_millis(20),
            missed_limit: 2,
            degraded_grace: Duration::from_millis(200),
        },
        request_timeout: Duration::from_secs(2),
        probe,
    }
}

// ---------------------------------------------------------------------------
// Services server
// ---------------------------------------------------------------------------

pub const REMOTE_PORTS: PortMapping = PortMapping {
    shell: 50001,
    iopub: 50002,
    stdin: 50003,
    control: 50004,
    hb: 50005,
};

#[derive(Default)]
pub struct MockState {
    /// Next N spawns answer 500 `SpawnFailed`.
    pub failing_spawns: AtomicU32,
    /// Spawns answer 400 `MalformedDescriptor` (not retryable).
    pub reject_spawns: AtomicBool,
    /// Delay before answering a spawn.
    pub spawn_delay_ms: AtomicU32,
    pub spawns: AtomicUsize,
    pub attaches: AtomicUsize,
    pub kernels: Mutex<HashMap<String, KernelModel>>,
    pub deleted: Mutex<Vec<String>>,
}

pub struct MockServer {
    pub state: Arc<MockState>,
    pub base_url: String,
}

impl MockServer {
    pub fn api(&self) -> Arc<RemoteServicesClient> {
        self.api_with_token(TOKEN)
    }

    pub fn api_with_token(&self, token: &str) -> Arc<RemoteServicesClient> {
        Arc::new(
            RemoteServicesClient::new(
                &self.base_url,
                token,
                Duration::from_secs(2),
                Duration::from_secs(2),
            )
            .unwrap(),
        )
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.deleted.lock().unwrap().clone()
    }
}

fn error(status: StatusCode, kind: &str, message: &str) -> Response {
    (status, Json(json!({"kind": kind, "error": message}))).into_response()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("token {TOKEN}"))
}

async fn spawn(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "AuthenticationFailed", "invalid token");
    }
    let delay = state.spawn_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
    }
    state.spawns.fetch_add(1, Ordering::SeqCst);
    if state.reject_spawns.load(Ordering::SeqCst) {
        return error(StatusCode::BAD_REQUEST, "MalformedDescriptor", "bad kernel spec");
    }
    if state
        .failing_spawns
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "SpawnFailed",
            "No such file or directory (os error 2)",
        );
    }
    let id = uuid::Uuid::new_v4().to_string();
    let model = KernelModel {
        id: id.clone(),
        name: "spyder-kernel".into(),
        pid: 4242,
        connection: ConnectionDescriptor::generate("0.0.0.0", REMOTE_PORTS, "spyder-kernel"),
        execution_state: ExecutionState::Idle,
        connections: 0,
        last_activity: 0,
        created: 0,
        reason: None,
    };
    state.kernels.lock().unwrap().insert(id, model.clone());
    Json(model).into_response()
}

async fn list(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "AuthenticationFailed", "invalid token");
    }
    let ids: Vec<String> = state.kernels.lock().unwrap().keys().cloned().collect();
    Json(ids).into_response()
}

async fn delete(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Response {
    state.deleted.lock().unwrap().push(id.clone());
    match state.kernels.lock().unwrap().remove(&id) {
        Some(_) => Json(json!({"success": true})).into_response(),
        None => error(StatusCode::NOT_FOUND, "UnknownKernel", &id),
    }
}

async fn attach(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Response {
    state.attaches.fetch_add(1, Ordering::SeqCst);
    let mut kernels = state.kernels.lock().unwrap();
    match kernels.get_mut(&id) {
        Some(model) => {
            model.connections += 1;
            Json(model.clone()).into_response()
        }
        None => error(StatusCode::NOT_FOUND, "UnknownKernel", &id),
    }
}

async fn restart(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Response {
    let mut kernels = state.kernels.lock().unwrap();
    match kernels.get_mut(&id) {
        Some(model) => {
            model.pid += 1;
            Json(model.clone()).into_response()
        }
        None => error(StatusCode::NOT_FOUND, "UnknownKernel", &id),
    }
}

/// Serve the stand-in on an ephemeral loopback port.
pub async fn mock_server() -> MockServer {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/version", get(|| async { Json("0.3.0") }))
        .route("/kernels", get(list).post(spawn))
        .route("/kernels/{id}", axum::routing::delete(delete))
        .route("/kernels/{id}/attach", post(attach))
        .route("/kernels/{id}/restart", post(restart))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    MockServer {
        state,
        base_url: format!("http://{addr}"),
    }
}

/// A base URL nothing listens on.
pub fn dead_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
