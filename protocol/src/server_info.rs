//! The `jpserver-spyder.json` discovery document.
//!
//! The server writes one of these into its runtime directory when it binds so
//! that clients on the same host can find it. A document whose `pid` no
//! longer names a live process is stale: [`ServerInfo::discover`] removes it
//! and reports nothing.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub const SERVER_INFO_FILE: &str = "jpserver-spyder.json";

static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub port: u16,
    pub pid: u32,
    pub base_url: String,
    pub token: String,
    pub runtime_dir: String,
    pub version: String,
}

impl ServerInfo {
    pub fn path_in(runtime_dir: &Path) -> PathBuf {
        runtime_dir.join(SERVER_INFO_FILE)
    }

    /// Write the document atomically (temp file + rename) with mode 0600.
    pub fn write(&self) -> io::Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let dir = Path::new(&self.runtime_dir);
        std::fs::create_dir_all(dir)?;
        let target = Self::path_in(dir);
        let seq = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp = dir.join(format!(".{SERVER_INFO_FILE}.{}.{seq}.tmp", std::process::id()));

        let body = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        std::fs::write(&temp, body)?;
        if let Err(e) = std::fs::set_permissions(&temp, std::fs::Permissions::from_mode(0o600))
            .and_then(|()| std::fs::rename(&temp, &target))
        {
            let _ = std::fs::remove_file(&temp);
            return Err(e);
        }
        Ok(target)
    }

    /// Read the document in `runtime_dir`, removing it if it is stale or
    /// unreadable. `Ok(None)` means no live server was found.
    pub fn discover(runtime_dir: &Path) -> io::Result<Option<Self>> {
        let path = Self::path_in(runtime_dir);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice::<Self>(&bytes) {
            Ok(info) if info.is_alive() => Ok(Some(info)),
            _ => {
                remove_if_present(&path)?;
                Ok(None)
            }
        }
    }

    /// Remove the document from `runtime_dir`. Missing is not an error.
    pub fn remove(runtime_dir: &Path) -> io::Result<()> {
        remove_if_present(&Self::path_in(runtime_dir))
    }

    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Whether `pid` names a live process. A process owned by another user
/// (`EPERM`) counts as alive.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
