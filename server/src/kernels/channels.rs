//! ZeroMQ conversations the registry has with its own kernels: watching
//! IOPub for `status` messages and asking a kernel to shut down.

use std::time::Duration;

use bytes::Bytes;
use spyder_remote_protocol::wire::{JupyterMessage, Signer};
use spyder_remote_protocol::{Channel, ConnectionDescriptor, ExecutionState};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use zeromq::{DealerSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use super::RegistryEvent;

/// Subscribe to a kernel's IOPub channel and forward status changes and
/// activity to the supervisor until the socket or the channel closes.
pub async fn watch_iopub(
    kernel_id: String,
    generation: u64,
    descriptor: ConnectionDescriptor,
    events: mpsc::Sender<RegistryEvent>,
) {
    let signer = match Signer::for_descriptor(&descriptor) {
        Ok(signer) => signer,
        Err(e) => {
            warn!(kernel = %kernel_id, "Not watching IOPub: {e}");
            return;
        }
    };
    let mut socket = SubSocket::new();
    if let Err(e) = socket.subscribe("").await {
        debug!(kernel = %kernel_id, "IOPub subscribe failed: {e}");
        return;
    }
    let endpoint = descriptor.endpoint(Channel::IoPub);
    if let Err(e) = socket.connect(&endpoint).await {
        debug!(kernel = %kernel_id, "IOPub connect to {endpoint} failed: {e}");
        return;
    }

    loop {
        let msg = match socket.recv().await {
            Ok(m) => m,
            Err(e) => {
                debug!(kernel = %kernel_id, "IOPub closed: {e}");
                return;
            }
        };
        let frames = into_frames(msg);
        let event = match JupyterMessage::from_frames(&frames, &signer) {
            Ok((_, m)) if m.msg_type() == "status" => {
                match m.content["execution_state"].as_str().and_then(ExecutionState::from_status) {
                    Some(state) => RegistryEvent::Status {
                        id: kernel_id.clone(),
                        generation,
                        state,
                    },
                    None => RegistryEvent::Activity {
                        id: kernel_id.clone(),
                        generation,
                    },
                }
            }
            Ok(_) => RegistryEvent::Activity {
                id: kernel_id.clone(),
                generation,
            },
            Err(e) => {
                trace!(kernel = %kernel_id, "dropping undecodable IOPub message: {e}");
                continue;
            }
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
}

/// Send a `shutdown_request` on the control channel. Best effort: gives up
/// silently after `timeout`.
pub async fn request_shutdown(descriptor: &ConnectionDescriptor, timeout: Duration) -> bool {
    let send = async {
        let signer = Signer::for_descriptor(descriptor).ok()?;
        let mut socket = DealerSocket::new();
        socket.connect(&descriptor.endpoint(Channel::Control)).await.ok()?;
        let msg = JupyterMessage::new(
            "shutdown_request",
            &uuid::Uuid::new_v4().to_string(),
            serde_json::json!({"restart": false}),
        );
        socket.send(from_frames(msg.to_frames(&signer))?).await.ok()?;
        Some(())
    };
    matches!(tokio::time::timeout(timeout, send).await, Ok(Some(())))
}

pub(crate) fn into_frames(msg: ZmqMessage) -> Vec<Vec<u8>> {
    msg.into_vec().into_iter().map(|b| b.to_vec()).collect()
}

pub(crate) fn from_frames(frames: Vec<Vec<u8>>) -> Option<ZmqMessage> {
    ZmqMessage::try_from(frames.into_iter().map(Bytes::from).collect::<Vec<_>>()).ok()
}
