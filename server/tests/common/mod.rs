#![allow(dead_code)]

use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use spyder_remote_services::environ::EnvironStore;
use spyder_remote_services::{build_router, AppState, Config};
use tower::ServiceExt;

pub const TOKEN: &str = "test-token";

/// Binds the five ports named in the connection file and idles. Dies on
/// SIGTERM like a real kernel.
const FAKE_KERNEL: &str = r#"
import json, socket, sys, time
path = sys.argv[sys.argv.index("-f") + 1]
with open(path) as f:
    info = json.load(f)
held = []
for key in ("shell_port", "iopub_port", "stdin_port", "control_port", "hb_port"):
    s = socket.socket(socket.AF_INET, socket.SOCK_STREAM)
    s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)
    s.bind((info["ip"], info[key]))
    s.listen(16)
    held.append(s)
while True:
    time.sleep(1)
"#;

pub struct TestServer {
    pub dir: PathBuf,
    pub state: AppState,
    pub app: Router,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("srs-{tag}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Config rooted in a scratch directory, with a `spyder-kernel` spec that
/// runs the fake kernel.
pub fn test_config(dir: &Path) -> Config {
    let script = dir.join("fake_kernel.py");
    std::fs::write(&script, FAKE_KERNEL).unwrap();

    let spec_dir = dir.join("share/kernels/spyder-kernel");
    std::fs::create_dir_all(&spec_dir).unwrap();
    let spec = serde_json::json!({
        "argv": ["python3", script.to_string_lossy(), "-f", "{connection_file}"],
        "display_name": "Fake Spyder kernel",
        "language": "python",
    });
    std::fs::write(spec_dir.join("kernel.json"), spec.to_string()).unwrap();

    let files_root = dir.join("home");
    std::fs::create_dir_all(&files_root).unwrap();

    let mut config = Config::default();
    config.server.runtime_dir = dir.join("runtime").to_string_lossy().into_owned();
    config.kernels.kernel_dirs = vec![dir.join("share").to_string_lossy().into_owned()];
    config.kernels.startup_timeout_secs = 15;
    config.kernels.shutdown_grace_secs = 1;
    config.files.root = files_root.to_string_lossy().into_owned();
    config.envs.manager = dir.join("no-such-manager").to_string_lossy().into_owned();
    config
}

pub fn server_with(dir: PathBuf, config: Config) -> TestServer {
    let state = AppState::with_environ(config, EnvironStore::from_process());
    let app = build_router(state.clone(), TOKEN.to_string());
    TestServer { dir, state, app }
}

pub fn server(tag: &str) -> TestServer {
    let dir = scratch_dir(tag);
    let config = test_config(&dir);
    server_with(dir, config)
}

pub fn python3_available() -> bool {
    let found = std::process::Command::new("python3")
        .arg("-c")
        .arg("pass")
        .status()
        .is_ok_and(|s| s.success());
    if !found {
        eprintln!("python3 not available, skipping kernel process test");
    }
    found
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn text(&self) -> String {
        String::from_utf8(self.body.clone()).unwrap()
    }
}

pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<(&str, String)>,
) -> Reply {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(t) = token {
        builder = builder.header("authorization", format!("token {t}"));
    }
    let request = match body {
        Some((content_type, b)) => builder
            .header("content-type", content_type)
            .body(Body::from(b))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    Reply {
        status,
        headers,
        body,
    }
}

pub async fn call(app: &Router, method: &str, uri: &str) -> Reply {
    send(app, method, uri, Some(TOKEN), None).await
}

pub async fn call_json(app: &Router, method: &str, uri: &str, body: serde_json::Value) -> Reply {
    send(
        app,
        method,
        uri,
        Some(TOKEN),
        Some(("application/json", body.to_string())),
    )
    .await
}
