//! Kernel heartbeat probing.
//!
//! A [`HeartbeatProbe`] sends one ping on the kernel's `hb` channel; the
//! [`HeartbeatTracker`] turns the stream of results into state verdicts.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use spyder_remote_protocol::{Channel, ConnectionDescriptor};
use tracing::trace;
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    /// Consecutive misses before the kernel counts as degraded.
    pub missed_limit: u32,
    /// How long a degraded kernel may stay degraded.
    pub degraded_grace: Duration,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            missed_limit: 3,
            degraded_grace: Duration::from_secs(300),
        }
    }
}

#[async_trait]
pub trait HeartbeatProbe: Send {
    /// One ping. `true` when the kernel echoed within `timeout`.
    async fn ping(&mut self, timeout: Duration) -> bool;
}

/// Echo probe over a REQ socket on the `hb` channel.
pub struct ZmqHeartbeat {
    endpoint: String,
    socket: Option<ReqSocket>,
}

impl ZmqHeartbeat {
    pub fn new(descriptor: &ConnectionDescriptor) -> Self {
        Self {
            endpoint: descriptor.endpoint(Channel::Heartbeat),
            socket: None,
        }
    }
}

#[async_trait]
impl HeartbeatProbe for ZmqHeartbeat {
    async fn ping(&mut self, timeout: Duration) -> bool {
        let endpoint = self.endpoint.clone();
        let slot = &mut self.socket;
        let exchange = async move {
            if slot.is_none() {
                let mut socket = ReqSocket::new();
                socket.connect(&endpoint).await.ok()?;
                *slot = Some(socket);
            }
            let socket = slot.as_mut()?;
            socket.send(ZmqMessage::from("ping")).await.ok()?;
            socket.recv().await.ok()
        };
        let echoed = matches!(tokio::time::timeout(timeout, exchange).await, Ok(Some(_)));
        if !echoed {
            // A REQ socket is stuck after an unanswered request.
            trace!("heartbeat on {} missed", self.endpoint);
            self.socket = None;
        }
        echoed
    }
}

/// What a probe result means for the client's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Degraded,
    Recovered,
    /// Degraded for longer than the grace period.
    Expired,
}

#[derive(Debug)]
pub struct HeartbeatTracker {
    policy: HeartbeatPolicy,
    missed: u32,
    degraded_since: Option<Instant>,
}

impl HeartbeatTracker {
    pub fn new(policy: HeartbeatPolicy) -> Self {
        Self {
            policy,
            missed: 0,
            degraded_since: None,
        }
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Feed one probe result observed at `now`.
    pub fn record(&mut self, echoed: bool, now: Instant) -> Option<Verdict> {
        if echoed {
            self.missed = 0;
            return self.degraded_since.take().map(|_| Verdict::Recovered);
        }
        self.missed = self.missed.saturating_add(1);
        match self.degraded_since {
            None if self.missed >= self.policy.missed_limit => {
                self.degraded_since = Some(now);
                Some(Verdict::Degraded)
            }
            Some(since) if now.duration_since(since) >= self.policy.degraded_grace => {
                Some(Verdict::Expired)
            }
            _ => None,
        }
    }
}
