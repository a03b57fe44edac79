//! The five ZeroMQ sockets of one kernel, connected to a local descriptor.
//!
//! `shell`, `control` and `stdin` are DEALER sockets used request/reply
//! style. `iopub` is a SUB socket drained by a pump task that verifies each
//! message's signature, hands Spyder messages to the [`MessageRouter`] and
//! rebroadcasts everything to [`KernelChannels::subscribe_iopub`] callers.
//! Heartbeats go through [`crate::heartbeat::ZmqHeartbeat`].

use bytes::Bytes;
use spyder_remote_protocol::wire::{JupyterMessage, Signer, WireError};
use spyder_remote_protocol::{Channel, ConnectionDescriptor};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use zeromq::{DealerSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use crate::router::{Delivery, MessageRouter};
use crate::ClientError;

const IOPUB_BUFFER: usize = 256;

pub struct KernelChannels {
    shell_id: String,
    session: String,
    signer: Signer,
    shell: Mutex<DealerSocket>,
    control: Mutex<DealerSocket>,
    stdin: Mutex<DealerSocket>,
    iopub: broadcast::Sender<JupyterMessage>,
    pump: JoinHandle<()>,
}

impl KernelChannels {
    /// Connect every socket to `descriptor`. Spyder messages arriving on
    /// IOPub are delivered to `router` under `shell_id`.
    pub async fn connect(
        descriptor: &ConnectionDescriptor,
        shell_id: &str,
        router: MessageRouter,
    ) -> Result<Self, ClientError> {
        let signer = Signer::for_descriptor(descriptor)
            .map_err(|e| ClientError::MalformedDescriptor(e.to_string()))?;

        let mut sub = SubSocket::new();
        sub.subscribe("")
            .await
            .map_err(|e| lost(Channel::IoPub, &e))?;
        sub.connect(&descriptor.endpoint(Channel::IoPub))
            .await
            .map_err(|e| lost(Channel::IoPub, &e))?;

        let shell = dealer(descriptor, Channel::Shell).await?;
        let control = dealer(descriptor, Channel::Control).await?;
        let stdin = dealer(descriptor, Channel::Stdin).await?;

        let (iopub, _) = broadcast::channel(IOPUB_BUFFER);
        let pump = tokio::spawn(pump_iopub(
            sub,
            signer.clone(),
            shell_id.to_string(),
            router,
            iopub.clone(),
        ));
        debug!(shell = %shell_id, "Kernel channels connected to {}", descriptor.ip);

        Ok(Self {
            shell_id: shell_id.to_string(),
            session: uuid::Uuid::new_v4().to_string(),
            signer,
            shell: Mutex::new(shell),
            control: Mutex::new(control),
            stdin: Mutex::new(stdin),
            iopub,
            pump,
        })
    }

    pub fn shell_id(&self) -> &str {
        &self.shell_id
    }

    /// Session id stamped on outgoing messages.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// A message of `msg_type` in this client's session.
    pub fn message(&self, msg_type: &str, content: serde_json::Value) -> JupyterMessage {
        JupyterMessage::new(msg_type, &self.session, content)
    }

    pub async fn send(&self, channel: Channel, msg: &JupyterMessage) -> Result<(), ClientError> {
        let frames = msg
            .to_frames(&self.signer)
            .into_iter()
            .map(Bytes::from)
            .collect::<Vec<_>>();
        let message = ZmqMessage::try_from(frames)
            .map_err(|_| ClientError::Protocol("empty message".into()))?;
        self.socket(channel)?
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| lost(channel, &e))
    }

    /// Next message on a request/reply channel.
    pub async fn recv(&self, channel: Channel) -> Result<JupyterMessage, ClientError> {
        let message = self
            .socket(channel)?
            .lock()
            .await
            .recv()
            .await
            .map_err(|e| lost(channel, &e))?;
        let (_, msg) = JupyterMessage::from_frames(&into_frames(message), &self.signer)
            .map_err(|e| ClientError::Protocol(format!("{}: {e}", channel.as_str())))?;
        Ok(msg)
    }

    /// Send `request` and wait for the reply whose parent is that request.
    pub async fn request(
        &self,
        channel: Channel,
        request: &JupyterMessage,
    ) -> Result<JupyterMessage, ClientError> {
        self.send(channel, request).await?;
        loop {
            let reply = self.recv(channel).await?;
            if reply.parent_header["msg_id"] == request.header.msg_id.as_str() {
                return Ok(reply);
            }
            trace!("dropping stale {} reply {}", channel.as_str(), reply.msg_type());
        }
    }

    /// Every IOPub message received from now on.
    pub fn subscribe_iopub(&self) -> broadcast::Receiver<JupyterMessage> {
        self.iopub.subscribe()
    }

    fn socket(&self, channel: Channel) -> Result<&Mutex<DealerSocket>, ClientError> {
        match channel {
            Channel::Shell => Ok(&self.shell),
            Channel::Control => Ok(&self.control),
            Channel::Stdin => Ok(&self.stdin),
            Channel::IoPub | Channel::Heartbeat => Err(ClientError::InvalidState(format!(
                "{} is not a request channel",
                channel.as_str()
            ))),
        }
    }
}

impl Drop for KernelChannels {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn dealer(descriptor: &ConnectionDescriptor, channel: Channel) -> Result<DealerSocket, ClientError> {
    let mut socket = DealerSocket::new();
    socket
        .connect(&descriptor.endpoint(channel))
        .await
        .map_err(|e| lost(channel, &e))?;
    Ok(socket)
}

async fn pump_iopub(
    mut socket: SubSocket,
    signer: Signer,
    shell_id: String,
    router: MessageRouter,
    iopub: broadcast::Sender<JupyterMessage>,
) {
    loop {
        let message = match socket.recv().await {
            Ok(m) => m,
            Err(e) => {
                debug!(shell = %shell_id, "IOPub closed: {e}");
                return;
            }
        };
        let msg = match JupyterMessage::from_frames(&into_frames(message), &signer) {
            Ok((_, msg)) => msg,
            Err(WireError::BadSignature) => {
                warn!(shell = %shell_id, "Dropping IOPub message with a bad signature");
                continue;
            }
            Err(e) => {
                trace!(shell = %shell_id, "Dropping undecodable IOPub message: {e}");
                continue;
            }
        };
        if let Delivery::Failed(e) = router.deliver(&shell_id, &msg) {
            debug!(shell = %shell_id, "Spyder message handler failed: {e}");
        }
        let _ = iopub.send(msg);
    }
}

fn into_frames(message: ZmqMessage) -> Vec<Vec<u8>> {
    message.into_vec().into_iter().map(|b| b.to_vec()).collect()
}

fn lost(channel: Channel, e: &zeromq::ZmqError) -> ClientError {
    ClientError::TransportLost(format!("{} channel: {e}", channel.as_str()))
}
