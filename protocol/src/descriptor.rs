//! Jupyter connection descriptors.
//!
//! A [`ConnectionDescriptor`] is the JSON document that tells a frontend how
//! to reach a kernel's five ZeroMQ channels. On the wire it carries exactly
//! these keys:
//!
//! | key                | type   | notes                                   |
//! |--------------------|--------|-----------------------------------------|
//! | `shell_port`       | number | 1-65535                                 |
//! | `iopub_port`       | number | 1-65535                                 |
//! | `stdin_port`       | number | 1-65535                                 |
//! | `control_port`     | number | 1-65535                                 |
//! | `hb_port`          | number | 1-65535                                 |
//! | `ip`               | string |                                         |
//! | `key`              | string | HMAC key, may be empty                  |
//! | `transport`        | string | `tcp` or `ipc`                          |
//! | `signature_scheme` | string | defaults to `hmac-sha256` when absent   |
//! | `kernel_name`      | string | defaults to empty when absent           |
//!
//! Unknown keys are ignored on input and never written on output. With the
//! `tcp` transport the five ports must be mutually distinct.

use serde::{Deserialize, Serialize};
use serde_json::json;

pub const DEFAULT_SIGNATURE_SCHEME: &str = "hmac-sha256";

/// One of the five kernel channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Shell,
    IoPub,
    Stdin,
    Control,
    Heartbeat,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Shell,
        Channel::IoPub,
        Channel::Stdin,
        Channel::Control,
        Channel::Heartbeat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::IoPub => "iopub",
            Self::Stdin => "stdin",
            Self::Control => "control",
            Self::Heartbeat => "hb",
        }
    }
}

/// A port for each channel. Used both to read a descriptor's ports and to
/// replace them (remote ports to locally tunnelled ports).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub shell: u16,
    pub iopub: u16,
    pub stdin: u16,
    pub control: u16,
    pub hb: u16,
}

impl PortMapping {
    pub fn get(&self, channel: Channel) -> u16 {
        match channel {
            Channel::Shell => self.shell,
            Channel::IoPub => self.iopub,
            Channel::Stdin => self.stdin,
            Channel::Control => self.control,
            Channel::Heartbeat => self.hb,
        }
    }

    pub fn set(&mut self, channel: Channel, port: u16) {
        match channel {
            Channel::Shell => self.shell = port,
            Channel::IoPub => self.iopub = port,
            Channel::Stdin => self.stdin = port,
            Channel::Control => self.control = port,
            Channel::Heartbeat => self.hb = port,
        }
    }

    /// Exchange the ports of two channels.
    #[must_use]
    pub fn swapped(mut self, a: Channel, b: Channel) -> Self {
        let pa = self.get(a);
        let pb = self.get(b);
        self.set(a, pb);
        self.set(b, pa);
        self
    }

    /// Build a mapping by looking up each channel's port.
    pub fn from_fn(mut f: impl FnMut(Channel) -> u16) -> Self {
        Self {
            shell: f(Channel::Shell),
            iopub: f(Channel::IoPub),
            stdin: f(Channel::Stdin),
            control: f(Channel::Control),
            hb: f(Channel::Heartbeat),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, u16)> + '_ {
        Channel::ALL.into_iter().map(|c| (c, self.get(c)))
    }

    fn duplicate(&self) -> Option<u16> {
        let mut seen = Vec::with_capacity(5);
        for (_, port) in self.iter() {
            if seen.contains(&port) {
                return Some(port);
            }
            seen.push(port);
        }
        None
    }
}

/// Errors from [`ConnectionDescriptor::parse`] and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// Not JSON, or a required key is missing or has the wrong type.
    Json(String),
    /// A port field is zero.
    ZeroPort(Channel),
    /// Two channels share a port under the `tcp` transport.
    DuplicatePort(u16),
}

impl std::fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(e) => write!(f, "malformed connection descriptor: {e}"),
            Self::ZeroPort(c) => write!(f, "malformed connection descriptor: {}_port is 0", c.as_str()),
            Self::DuplicatePort(p) => {
                write!(f, "malformed connection descriptor: port {p} used by more than one channel")
            }
        }
    }
}

impl std::error::Error for DescriptorError {}

impl DescriptorError {
    pub fn kind(&self) -> crate::ErrorKind {
        crate::ErrorKind::MalformedDescriptor
    }
}

fn default_signature_scheme() -> String {
    DEFAULT_SIGNATURE_SCHEME.to_string()
}

/// How to reach a kernel. Cheap to clone, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
    pub ip: String,
    pub key: String,
    pub transport: String,
    #[serde(default = "default_signature_scheme")]
    pub signature_scheme: String,
    #[serde(default)]
    pub kernel_name: String,
}

impl ConnectionDescriptor {
    /// Build a `tcp` descriptor with a fresh random HMAC key.
    pub fn generate(ip: &str, ports: PortMapping, kernel_name: &str) -> Self {
        Self {
            shell_port: ports.shell,
            iopub_port: ports.iopub,
            stdin_port: ports.stdin,
            control_port: ports.control,
            hb_port: ports.hb,
            ip: ip.to_string(),
            key: uuid::Uuid::new_v4().simple().to_string(),
            transport: "tcp".to_string(),
            signature_scheme: default_signature_scheme(),
            kernel_name: kernel_name.to_string(),
        }
    }

    /// Parse and validate a descriptor from raw JSON bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let d: Self =
            serde_json::from_slice(bytes).map_err(|e| DescriptorError::Json(e.to_string()))?;
        d.validate()?;
        Ok(d)
    }

    /// Serialize to JSON with exactly the ten descriptor keys.
    pub fn serialize(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "shell_port": self.shell_port,
            "iopub_port": self.iopub_port,
            "stdin_port": self.stdin_port,
            "control_port": self.control_port,
            "hb_port": self.hb_port,
            "ip": self.ip,
            "key": self.key,
            "transport": self.transport,
            "signature_scheme": self.signature_scheme,
            "kernel_name": self.kernel_name,
        })
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        let ports = self.ports();
        for (channel, port) in ports.iter() {
            if port == 0 {
                return Err(DescriptorError::ZeroPort(channel));
            }
        }
        if self.transport == "tcp" {
            if let Some(port) = ports.duplicate() {
                return Err(DescriptorError::DuplicatePort(port));
            }
        }
        Ok(())
    }

    pub fn ports(&self) -> PortMapping {
        PortMapping {
            shell: self.shell_port,
            iopub: self.iopub_port,
            stdin: self.stdin_port,
            control: self.control_port,
            hb: self.hb_port,
        }
    }

    pub fn port(&self, channel: Channel) -> u16 {
        self.ports().get(channel)
    }

    /// A copy of this descriptor with every port replaced from `mapping`.
    #[must_use]
    pub fn with_ports(&self, mapping: &PortMapping) -> Self {
        Self {
            shell_port: mapping.shell,
            iopub_port: mapping.iopub,
            stdin_port: mapping.stdin,
            control_port: mapping.control,
            hb_port: mapping.hb,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_ip(&self, ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            ..self.clone()
        }
    }

    /// ZeroMQ endpoint for a channel, e.g. `tcp://127.0.0.1:5555`.
    pub fn endpoint(&self, channel: Channel) -> String {
        let port = self.port(channel);
        if self.transport == "ipc" {
            format!("ipc://{}-{port}", self.ip)
        } else {
            format!("{}://{}:{port}", self.transport, self.ip)
        }
    }

    pub fn hmac_key(&self) -> &[u8] {
        self.key.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConnectionDescriptor {
        ConnectionDescriptor::generate(
            "127.0.0.1",
            PortMapping {
                shell: 50001,
                iopub: 50002,
                stdin: 50003,
                control: 50004,
                hb: 50005,
            },
            "spyder-kernel",
        )
    }

    #[test]
    fn test_parse_serialize_round_trip() {
        let d = sample();
        let parsed = ConnectionDescriptor::parse(&d.serialize()).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn test_parse_jupyter_file() {
        let raw = br#"{
            "shell_port": 53794, "iopub_port": 53795, "stdin_port": 53796,
            "control_port": 53797, "hb_port": 53798, "ip": "127.0.0.1",
            "key": "a0436f6c-1916-498b-8eb9-e81ab9368e84",
            "transport": "tcp", "signature_scheme": "hmac-sha256",
            "kernel_name": "python3", "jupyter_session": "/tmp/x.ipynb"
        }"#;
        let d = ConnectionDescriptor::parse(raw).unwrap();
        assert_eq!(d.iopub_port, 53795);
        assert_eq!(d.kernel_name, "python3");
        let out: serde_json::Value = serde_json::from_slice(&d.serialize()).unwrap();
        assert!(out.get("jupyter_session").is_none());
        assert_eq!(out.as_object().unwrap().len(), 10);
    }

    #[test]
    fn test_parse_defaults_scheme_and_name() {
        let raw = br#"{"shell_port": 1, "iopub_port": 2, "stdin_port": 3,
            "control_port": 4, "hb_port": 5, "ip": "10.0.0.2", "key": "",
            "transport": "tcp"}"#;
        let d = ConnectionDescriptor::parse(raw).unwrap();
        assert_eq!(d.signature_scheme, DEFAULT_SIGNATURE_SCHEME);
        assert_eq!(d.kernel_name, "");
    }

    #[test]
    fn test_parse_rejects_missing_field() {
        let raw = br#"{"shell_port": 1, "iopub_port": 2, "stdin_port": 3,
            "control_port": 4, "ip": "127.0.0.1", "key": "k", "transport": "tcp"}"#;
        assert!(matches!(
            ConnectionDescriptor::parse(raw),
            Err(DescriptorError::Json(_))
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ConnectionDescriptor::parse(b"not json").is_err());
        assert!(ConnectionDescriptor::parse(b"[]").is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_port() {
        let raw = br#"{"shell_port": 70000, "iopub_port": 2, "stdin_port": 3,
            "control_port": 4, "hb_port": 5, "ip": "127.0.0.1", "key": "k",
            "transport": "tcp"}"#;
        assert!(ConnectionDescriptor::parse(raw).is_err());
    }

    #[test]
    fn test_duplicate_ports_rejected_for_tcp_only() {
        let mut d = sample();
        d.hb_port = d.shell_port;
        assert_eq!(
            ConnectionDescriptor::parse(&d.serialize()),
            Err(DescriptorError::DuplicatePort(50001))
        );
        d.transport = "ipc".to_string();
        assert!(ConnectionDescriptor::parse(&d.serialize()).is_ok());
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut d = sample();
        d.stdin_port = 0;
        assert_eq!(d.validate(), Err(DescriptorError::ZeroPort(Channel::Stdin)));
    }

    #[test]
    fn test_with_ports_identity() {
        let d = sample();
        assert_eq!(d.with_ports(&d.ports()), d);
    }

    #[test]
    fn test_with_ports_swap_twice_is_identity() {
        let d = sample();
        for a in Channel::ALL {
            for b in Channel::ALL {
                let once = d.with_ports(&d.ports().swapped(a, b));
                let twice = once.with_ports(&once.ports().swapped(a, b));
                assert_eq!(twice, d);
            }
        }
    }

    #[test]
    fn test_with_ports_keeps_key_and_ip() {
        let d = sample();
        let local = d.with_ports(&PortMapping::from_fn(|c| d.port(c) + 1000));
        assert_eq!(local.shell_port, 51001);
        assert_eq!(local.hb_port, 51005);
        assert_eq!(local.key, d.key);
        assert_eq!(local.ip, d.ip);
    }

    #[test]
    fn test_endpoint() {
        let d = sample();
        assert_eq!(d.endpoint(Channel::IoPub), "tcp://127.0.0.1:50002");
        let ipc = ConnectionDescriptor {
            transport: "ipc".to_string(),
            ip: "/tmp/kernel".to_string(),
            ..d
        };
        assert_eq!(ipc.endpoint(Channel::Heartbeat), "ipc:///tmp/kernel-50005");
    }

    #[test]
    fn test_generated_key_is_fresh() {
        assert_ne!(sample().key, sample().key);
        assert!(!sample().key.is_empty());
    }
}
