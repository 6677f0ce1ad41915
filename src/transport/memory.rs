//! In-process transport.
//!
//! Channel-backed sockets with the same shape as the ZeroMQ ones. Used to
//! embed the kernel in a host process and to drive it from tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{FrameSink, InboundItem, InboundQueues, OutboundSocket, SocketGroup};
use crate::types::{Error, Result};
use crate::wire::Signer;

/// Sink that forwards every message into an unbounded channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<Bytes>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Vec<Bytes>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frames(&mut self, frames: Vec<Bytes>) -> Result<()> {
        self.tx
            .send(frames)
            .map_err(|_| Error::transport("peer channel closed"))
    }
}

/// The client side of an in-process kernel.
#[derive(Debug)]
pub struct MemoryPeer {
    pub shell_tx: mpsc::Sender<InboundItem>,
    pub control_tx: mpsc::Sender<InboundItem>,
    pub stdin_tx: mpsc::Sender<InboundItem>,
    pub shell_rx: mpsc::UnboundedReceiver<Vec<Bytes>>,
    pub control_rx: mpsc::UnboundedReceiver<Vec<Bytes>>,
    pub stdin_rx: mpsc::UnboundedReceiver<Vec<Bytes>>,
    pub iopub_rx: mpsc::UnboundedReceiver<Vec<Bytes>>,
}

/// Build a socket group wired to a [`MemoryPeer`].
pub fn memory_transport(signer: Signer, capacity: usize) -> (SocketGroup, InboundQueues, MemoryPeer) {
    let (shell_tx, shell_in) = mpsc::channel(capacity);
    let (control_tx, control_in) = mpsc::channel(capacity);
    let (stdin_tx, stdin_in) = mpsc::channel(capacity);

    let (shell_out, shell_rx) = mpsc::unbounded_channel();
    let (control_out, control_rx) = mpsc::unbounded_channel();
    let (stdin_out, stdin_rx) = mpsc::unbounded_channel();
    let (iopub_out, iopub_rx) = mpsc::unbounded_channel();

    let group = SocketGroup {
        shell: Arc::new(OutboundSocket::new("shell", ChannelSink::new(shell_out))),
        control: Arc::new(OutboundSocket::new("control", ChannelSink::new(control_out))),
        stdin: Arc::new(OutboundSocket::new("stdin", ChannelSink::new(stdin_out))),
        iopub: Arc::new(OutboundSocket::new("iopub", ChannelSink::new(iopub_out))),
        signer,
    };
    let inbound = InboundQueues {
        shell: shell_in,
        control: control_in,
        stdin: stdin_in,
    };
    let peer = MemoryPeer {
        shell_tx,
        control_tx,
        stdin_tx,
        shell_rx,
        control_rx,
        stdin_rx,
        iopub_rx,
    };
    (group, inbound, peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outbound_send_reaches_peer() {
        let (group, _inbound, mut peer) = memory_transport(Signer::unsigned(), 4);
        group
            .iopub
            .send(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")])
            .await
            .unwrap();
        let frames = peer.iopub_rx.recv().await.unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_publishers_do_not_interleave() {
        let (group, _inbound, mut peer) = memory_transport(Signer::unsigned(), 4);
        let mut tasks = Vec::new();
        for n in 0..16u8 {
            let iopub = group.iopub.clone();
            tasks.push(tokio::spawn(async move {
                let frames = (0..4).map(|_| Bytes::from(vec![n])).collect();
                iopub.send(frames).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        drop(group);

        let mut seen = 0;
        while let Some(frames) = peer.iopub_rx.recv().await {
            assert!(frames.iter().all(|f| f == &frames[0]));
            seen += 1;
        }
        assert_eq!(seen, 16);
    }

    #[tokio::test]
    async fn test_closed_peer_is_transport_error() {
        let (group, _inbound, peer) = memory_transport(Signer::unsigned(), 4);
        drop(peer);
        let err = group.shell.send(vec![Bytes::new()]).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
