//! Kernel records and lifecycle events as exchanged over HTTP.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::descriptor::ConnectionDescriptor;

/// Execution state of a kernel. `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Starting,
    Idle,
    Busy,
    Dead,
}

impl ExecutionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Dead => "dead",
        }
    }

    /// Parse the `execution_state` field of a Jupyter `status` message.
    /// Jupyter's transient states (`restarting`, `terminating`, ...) map to
    /// `None`.
    pub fn from_status(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }

    pub fn is_dead(self) -> bool {
        self == Self::Dead
    }
}

/// Why a kernel reached `dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeathReason {
    Shutdown,
    Crash,
    Oom,
    Timeout,
}

impl DeathReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::Crash => "crash",
            Self::Oom => "oom",
            Self::Timeout => "timeout",
        }
    }
}

/// Snapshot of a kernel record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelModel {
    pub id: String,
    pub name: String,
    pub pid: u32,
    pub connection: ConnectionDescriptor,
    pub execution_state: ExecutionState,
    pub connections: u32,
    /// Epoch milliseconds of the last observed kernel activity.
    pub last_activity: u64,
    /// Epoch milliseconds when the kernel was spawned.
    pub created: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DeathReason>,
}

/// Body of `POST /kernels`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Kernel spec name; the server default applies when absent.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// One lifecycle transition of a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEvent {
    pub kernel_id: String,
    pub execution_state: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DeathReason>,
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_names() {
        assert_eq!(serde_json::to_value(ExecutionState::Busy).unwrap(), "busy");
        assert_eq!(serde_json::to_value(DeathReason::Oom).unwrap(), "oom");
        assert_eq!(ExecutionState::from_status("idle"), Some(ExecutionState::Idle));
        assert_eq!(ExecutionState::from_status("restarting"), None);
    }

    #[test]
    fn test_spawn_request_defaults() {
        let req: SpawnRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.name, None);
        assert!(req.env.is_empty());

        let req: SpawnRequest =
            serde_json::from_str(r#"{"name":"spyder-kernel","env":{"FOO":"1"}}"#).unwrap();
        assert_eq!(req.name.as_deref(), Some("spyder-kernel"));
        assert_eq!(req.env["FOO"], "1");
    }

    #[test]
    fn test_reason_omitted_when_alive() {
        let ev = StateEvent {
            kernel_id: "k".into(),
            execution_state: ExecutionState::Idle,
            reason: None,
            timestamp: 1,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert!(v.get("reason").is_none());
        assert_eq!(v["execution_state"], "idle");
    }
}
