//! Socket topology.
//!
//! Five sockets per kernel:
//!
//! | Socket    | Pattern | Role                                              |
//! |-----------|---------|---------------------------------------------------|
//! | shell     | router  | kernel-info, execute, complete, shutdown          |
//! | control   | router  | same requests, serviced ahead of queued shell     |
//! | stdin     | router  | input requests (read and discarded)               |
//! | iopub     | pub     | status, streams, display data, results, errors    |
//! | heartbeat | rep     | echo every ping unchanged                         |
//!
//! Inbound traffic reaches the dispatch loop through [`InboundQueues`].
//! Outbound traffic goes through an [`OutboundSocket`], whose lock makes each
//! multipart send atomic with respect to other publishers on the same socket.

pub mod heartbeat;
pub mod memory;
pub mod zmq;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::types::Result;
use crate::wire::Signer;

/// Frames from one receive, or the receive error.
pub type InboundItem = Result<Vec<Bytes>>;

/// Queue fed by one inbound listener.
pub type Inbound = mpsc::Receiver<InboundItem>;

/// Write side of a socket.
#[async_trait]
pub trait FrameSink: Send + fmt::Debug {
    /// Send one multipart message.
    async fn send_frames(&mut self, frames: Vec<Bytes>) -> Result<()>;
}

/// Outbound socket guarded by its own exclusive-access lock.
#[derive(Debug)]
pub struct OutboundSocket {
    name: &'static str,
    sink: Mutex<Box<dyn FrameSink>>,
}

impl OutboundSocket {
    pub fn new(name: &'static str, sink: impl FrameSink + 'static) -> Self {
        Self {
            name,
            sink: Mutex::new(Box::new(sink)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Send a whole message while holding the socket lock.
    pub async fn send(&self, frames: Vec<Bytes>) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send_frames(frames).await
    }
}

/// Request channel a message arrived on; replies go back the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Shell,
    Control,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Shell => write!(f, "shell"),
            Channel::Control => write!(f, "control"),
        }
    }
}

/// Outbound sockets plus the signing key shared by every sender.
#[derive(Debug, Clone)]
pub struct SocketGroup {
    pub shell: Arc<OutboundSocket>,
    pub control: Arc<OutboundSocket>,
    pub stdin: Arc<OutboundSocket>,
    pub iopub: Arc<OutboundSocket>,
    pub signer: Signer,
}

impl SocketGroup {
    /// Socket that carries replies for `channel`.
    pub fn reply_socket(&self, channel: Channel) -> &OutboundSocket {
        match channel {
            Channel::Shell => &self.shell,
            Channel::Control => &self.control,
        }
    }
}

/// Per-socket queues read by the dispatch loop.
#[derive(Debug)]
pub struct InboundQueues {
    pub shell: Inbound,
    pub control: Inbound,
    pub stdin: Inbound,
}
