//! Host-side probes used while supervising kernels: port allocation,
//! readiness, and cgroup OOM accounting.

use std::collections::HashSet;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use spyder_remote_protocol::PortMapping;
use tokio::net::TcpStream;

/// Pick five distinct free ports on `ip`, avoiding `reserved`.
///
/// All five listeners are held open together so the OS cannot hand the same
/// port out twice, then dropped before the kernel binds them.
pub fn allocate_ports(ip: &str, reserved: &HashSet<u16>) -> std::io::Result<PortMapping> {
    let mut held = Vec::with_capacity(5);
    let mut ports = Vec::with_capacity(5);
    let mut attempts = 0;
    while ports.len() < 5 {
        attempts += 1;
        if attempts > 50 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "could not find five unreserved ports",
            ));
        }
        let listener = TcpListener::bind((ip, 0))?;
        let port = listener.local_addr()?.port();
        if reserved.contains(&port) || ports.contains(&port) {
            continue;
        }
        ports.push(port);
        held.push(listener);
    }
    drop(held);
    Ok(PortMapping {
        shell: ports[0],
        iopub: ports[1],
        stdin: ports[2],
        control: ports[3],
        hb: ports[4],
    })
}

/// Whether every port in `ports` accepts a TCP connection.
pub async fn ports_listening(ip: &str, ports: &PortMapping) -> bool {
    for (_, port) in ports.iter() {
        let Ok(addr) = format!("{ip}:{port}").parse::<SocketAddr>() else {
            return false;
        };
        match tokio::time::timeout(Duration::from_millis(250), TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {}
            _ => return false,
        }
    }
    true
}

/// Current `oom_kill` counter of this process's cgroup (v2 only).
pub fn oom_kill_count() -> Option<u64> {
    let cgroup = std::fs::read_to_string("/proc/self/cgroup").ok()?;
    let path = cgroup.lines().find_map(|l| l.strip_prefix("0::"))?;
    let events =
        std::fs::read_to_string(format!("/sys/fs/cgroup{}/memory.events", path.trim())).ok()?;
    parse_oom_kill(&events)
}

fn parse_oom_kill(events: &str) -> Option<u64> {
    events.lines().find_map(|l| {
        let (key, value) = l.split_once(' ')?;
        (key == "oom_kill").then(|| value.trim().parse().ok()).flatten()
    })
}
