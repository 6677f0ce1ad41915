//! ZeroMQ binding of the five kernel sockets.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zeromq::{PubSocket, RepSocket, RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use super::heartbeat;
use super::{FrameSink, InboundItem, InboundQueues, OutboundSocket, SocketGroup};
use crate::types::{ConnectionInfo, Error, KernelConfig, Result};
use crate::wire::Signer;

/// Sockets bound from a connection file, with their background tasks.
#[derive(Debug)]
pub struct BoundSockets {
    pub group: SocketGroup,
    pub inbound: InboundQueues,
    /// Router listener tasks.
    pub tasks: Vec<JoinHandle<()>>,
    /// Heartbeat echo task. Finishes with an error only on a fatal receive
    /// failure.
    pub heartbeat: JoinHandle<Result<()>>,
}

/// Bind all five sockets. Any bind failure is fatal.
pub async fn bind(
    info: &ConnectionInfo,
    config: &KernelConfig,
    cancel: CancellationToken,
) -> Result<BoundSockets> {
    let signer = Signer::new(info.key.as_bytes())?;

    let shell = bind_socket(RouterSocket::new(), "shell", &info.endpoint(info.shell_port)).await?;
    let control = bind_socket(RouterSocket::new(), "control", &info.endpoint(info.control_port)).await?;
    let stdin = bind_socket(RouterSocket::new(), "stdin", &info.endpoint(info.stdin_port)).await?;
    let iopub = bind_socket(PubSocket::new(), "iopub", &info.endpoint(info.iopub_port)).await?;
    let hb = bind_socket(RepSocket::new(), "heartbeat", &info.endpoint(info.hb_port)).await?;

    let mut tasks = Vec::with_capacity(3);
    let (shell_out, shell_in, task) = spawn_router("shell", shell, config.queue_capacity, cancel.clone());
    tasks.push(task);
    let (control_out, control_in, task) = spawn_router("control", control, config.queue_capacity, cancel.clone());
    tasks.push(task);
    let (stdin_out, stdin_in, task) = spawn_router("stdin", stdin, config.queue_capacity, cancel.clone());
    tasks.push(task);
    let heartbeat = heartbeat::spawn(hb, config.heartbeat_timeout, cancel);

    let group = SocketGroup {
        shell: Arc::new(shell_out),
        control: Arc::new(control_out),
        stdin: Arc::new(stdin_out),
        iopub: Arc::new(OutboundSocket::new("iopub", PubSink(iopub))),
        signer,
    };
    let inbound = InboundQueues {
        shell: shell_in,
        control: control_in,
        stdin: stdin_in,
    };

    Ok(BoundSockets {
        group,
        inbound,
        tasks,
        heartbeat,
    })
}

async fn bind_socket<S: Socket>(mut socket: S, name: &str, endpoint: &str) -> Result<S> {
    socket
        .bind(endpoint)
        .await
        .map_err(|e| Error::transport(format!("cannot bind {} socket to {}: {}", name, endpoint, e)))?;
    tracing::info!("{} socket bound to {}", name, endpoint);
    Ok(socket)
}

/// Publisher sockets are send-only, so the lock in [`OutboundSocket`] is the
/// only owner they need.
struct PubSink(PubSocket);

impl std::fmt::Debug for PubSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PubSink")
    }
}

#[async_trait]
impl FrameSink for PubSink {
    async fn send_frames(&mut self, frames: Vec<Bytes>) -> Result<()> {
        self.0.send(to_zmq(frames)?).await?;
        Ok(())
    }
}

/// Outbound handle of a router socket owned by its listener task.
#[derive(Debug)]
struct RouterSink {
    tx: mpsc::UnboundedSender<Vec<Bytes>>,
}

#[async_trait]
impl FrameSink for RouterSink {
    async fn send_frames(&mut self, frames: Vec<Bytes>) -> Result<()> {
        self.tx
            .send(frames)
            .map_err(|_| Error::transport("router task has stopped"))
    }
}

/// A router socket needs `&mut` for both directions, so one task owns it:
/// it forwards every receive into the inbound queue and drains the outbound
/// queue between receives.
fn spawn_router(
    name: &'static str,
    mut socket: RouterSocket,
    capacity: usize,
    cancel: CancellationToken,
) -> (OutboundSocket, mpsc::Receiver<InboundItem>, JoinHandle<()>) {
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<Bytes>>();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Replies queued before shutdown still go out.
                    while let Ok(frames) = outbound_rx.try_recv() {
                        send_router(name, &mut socket, frames).await;
                    }
                    tracing::debug!("{} listener stopping", name);
                    break;
                }
                Some(frames) = outbound_rx.recv() => send_router(name, &mut socket, frames).await,
                received = socket.recv() => {
                    let item = received.map(ZmqMessage::into_vec).map_err(Error::from);
                    if inbound_tx.send(item).await.is_err() {
                        tracing::debug!("{} queue closed, listener stopping", name);
                        break;
                    }
                }
            }
        }
    });

    let outbound = OutboundSocket::new(name, RouterSink { tx: outbound_tx });
    (outbound, inbound_rx, task)
}

async fn send_router(name: &str, socket: &mut RouterSocket, frames: Vec<Bytes>) {
    let result = match to_zmq(frames) {
        Ok(msg) => socket.send(msg).await.map_err(Error::from),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::warn!("{} send failed: {}", name, e);
    }
}

fn to_zmq(frames: Vec<Bytes>) -> Result<ZmqMessage> {
    ZmqMessage::try_from(frames).map_err(|e| Error::transport(format!("invalid multipart message: {}", e)))
}
