//! The SSH side of tunnelling.
//!
//! [`OpenSshTransport`] drives the system `ssh` binary: one `ControlMaster`
//! process holds the authenticated connection and every forwarding is
//! added or cancelled through its control socket (`ssh -O forward`,
//! `ssh -O cancel`). Tests substitute their own [`SshTransport`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Failure reported by a transport operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Authentication failed or the server refused the forwarding.
    Denied(String),
    /// The local listen port was taken between picking and binding it.
    AddressInUse(String),
    /// The control connection is gone.
    Lost(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Denied(e) => write!(f, "denied: {e}"),
            Self::AddressInUse(e) => write!(f, "address in use: {e}"),
            Self::Lost(e) => write!(f, "connection lost: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<TransportError> for crate::ClientError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Denied(m) => Self::TunnelDenied(m),
            TransportError::AddressInUse(m) => Self::NoFreePort(m),
            TransportError::Lost(m) => Self::TransportLost(m),
        }
    }
}

/// One authenticated SSH connection able to carry local forwardings.
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Establish the connection. Called again to reconnect after a loss.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Forward `127.0.0.1:local_port` to `remote_host:remote_port` as seen
    /// from the SSH server.
    async fn open_forward(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), TransportError>;

    async fn cancel_forward(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), TransportError>;

    async fn is_alive(&self) -> bool;

    /// Run a command on the remote host and return its stdout.
    async fn exec(&self, command: &str) -> Result<String, TransportError>;

    async fn disconnect(&self);
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
}

impl SshTarget {
    /// `user@host`, or just `host`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

pub struct OpenSshTransport {
    target: SshTarget,
    control_path: PathBuf,
    connect_timeout: Duration,
    master: Mutex<Option<Child>>,
}

impl OpenSshTransport {
    pub fn new(target: SshTarget) -> Self {
        let control_path = std::env::temp_dir().join(format!(
            "spyder-ssh-{}.sock",
            uuid::Uuid::new_v4().simple()
        ));
        Self {
            target,
            control_path,
            connect_timeout: Duration::from_secs(15),
            master: Mutex::new(None),
        }
    }

    /// `ssh` with the options shared by the master and every client.
    fn ssh_command(&self) -> Command {
        let mut command = Command::new("ssh");
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .args(["-o", "BatchMode=yes", "-o"])
            .arg(format!("ControlPath={}", self.control_path.display()));
        if let Some(port) = self.target.port {
            command.arg("-p").arg(port.to_string());
        }
        if let Some(identity) = &self.target.identity_file {
            command.arg("-i").arg(identity);
        }
        command
    }

    /// Run `ssh -O <op>` against the control socket.
    async fn control(&self, op: &str, forward: Option<String>) -> Result<String, TransportError> {
        let mut command = self.ssh_command();
        command.args(["-O", op]);
        if let Some(spec) = forward {
            command.arg("-L").arg(spec);
        }
        command.arg(self.target.destination());
        run(&mut command).await
    }

    async fn check(&self) -> bool {
        self.control("check", None).await.is_ok()
    }
}

#[async_trait]
impl SshTransport for OpenSshTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut master = self.master.lock().await;
        if let Some(mut old) = master.take() {
            let _ = old.start_kill();
            let _ = old.wait().await;
        }
        let _ = std::fs::remove_file(&self.control_path);

        let destination = self.target.destination();
        info!("Opening SSH control connection to {destination}");
        let mut child = self
            .ssh_command()
            .stdout(Stdio::null())
            .args(["-N", "-o", "ControlMaster=yes", "-o", "ControlPersist=no"])
            .args(["-o", "ExitOnForwardFailure=yes", "-o", "ServerAliveInterval=15"])
            .args(["-o", "ConnectTimeout=10"])
            .arg(&destination)
            .spawn()
            .map_err(|e| TransportError::Lost(format!("failed to run ssh: {e}")))?;

        let deadline = Instant::now() + self.connect_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                let message = format!("ssh exited with {status}: {}", stderr.trim());
                warn!("SSH connection to {destination} failed: {message}");
                return Err(match classify(&stderr) {
                    TransportError::AddressInUse(_) | TransportError::Lost(_) => {
                        TransportError::Lost(message)
                    }
                    TransportError::Denied(_) => TransportError::Denied(message),
                });
            }
            if self.check().await {
                debug!("SSH control socket ready at {}", self.control_path.display());
                *master = Some(child);
                return Ok(());
            }
            if Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(TransportError::Lost(format!(
                    "timed out after {:?} connecting to {destination}",
                    self.connect_timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn open_forward(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), TransportError> {
        self.control(
            "forward",
            Some(forward_spec(local_port, remote_host, remote_port)),
        )
        .await
        .map(|_| ())
    }

    async fn cancel_forward(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), TransportError> {
        self.control(
            "cancel",
            Some(forward_spec(local_port, remote_host, remote_port)),
        )
        .await
        .map(|_| ())
    }

    async fn is_alive(&self) -> bool {
        {
            let mut master = self.master.lock().await;
            match master.as_mut().map(Child::try_wait) {
                Some(Ok(None)) => {}
                _ => return false,
            }
        }
        self.check().await
    }

    async fn exec(&self, command: &str) -> Result<String, TransportError> {
        let mut ssh = self.ssh_command();
        ssh.arg(self.target.destination()).arg(command);
        run(&mut ssh).await
    }

    async fn disconnect(&self) {
        let _ = self.control("exit", None).await;
        if let Some(mut child) = self.master.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        let _ = std::fs::remove_file(&self.control_path);
        info!("Closed SSH control connection to {}", self.target.destination());
    }
}

fn forward_spec(local_port: u16, remote_host: &str, remote_port: u16) -> String {
    format!("127.0.0.1:{local_port}:{remote_host}:{remote_port}")
}

async fn run(command: &mut Command) -> Result<String, TransportError> {
    let output = command
        .output()
        .await
        .map_err(|e| TransportError::Lost(format!("failed to run ssh: {e}")))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(classify(&String::from_utf8_lossy(&output.stderr)))
    }
}

/// Sort an `ssh` error message into a transport failure.
fn classify(stderr: &str) -> TransportError {
    let message = stderr.trim().to_string();
    if message.contains("Address already in use") || message.contains("cannot listen") {
        TransportError::AddressInUse(message)
    } else if message.contains("Permission denied")
        || message.contains("administratively prohibited")
        || message.contains("Host key verification failed")
        || message.contains("forwarding request failed")
    {
        TransportError::Denied(message)
    } else {
        TransportError::Lost(message)
    }
}
