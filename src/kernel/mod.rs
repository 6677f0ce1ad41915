//! Kernel - the dispatch loop.
//!
//! The Kernel owns all mutable session state and services one request at a
//! time. Control requests are taken ahead of queued shell requests; stdin
//! traffic is read and discarded.
//!
//! Every serviced request is bracketed by `status: busy` and `status: idle`
//! on iopub, whatever the handler does, panics included.

pub mod execute;
pub mod handlers;
pub mod receipt;
pub mod recovery;
pub mod stream;

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::evaluator::Evaluator;
use crate::transport::{self, Channel, Inbound, InboundItem, InboundQueues, SocketGroup};
use crate::types::{ConnectionInfo, Error, KernelConfig, Result};
use crate::wire::message::{
    COMPLETE_REQUEST, EXECUTE_REQUEST, KERNEL_INFO_REQUEST, SHUTDOWN_REQUEST,
};
use crate::wire::{decode, ComposedMessage};

pub use receipt::{DisplayHandle, KernelStatus, Receipt};
pub use stream::{OutErr, StreamName, StreamWriter};

/// State that persists across requests.
#[derive(Debug, Default)]
pub struct KernelState {
    /// Number of non-silent executions so far.
    pub execution_count: u32,
    /// Log every decoded inbound message at `info`.
    pub trace_messages: bool,
    /// Point fd 1 and fd 2 into the capture while code runs.
    pub capture_process_output: bool,
}

/// Why the dispatch loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// A `shutdown_request` was answered.
    Shutdown { restart: bool },
    /// The cancellation token fired.
    Cancelled,
    /// No inbound channel is left to service.
    ChannelsClosed,
}

enum Flow {
    Continue,
    Shutdown { restart: bool },
}

/// Kernel actor.
#[derive(Debug)]
pub struct Kernel {
    evaluator: Arc<dyn Evaluator>,
    sockets: SocketGroup,
    state: KernelState,
}

impl Kernel {
    pub fn new(evaluator: Arc<dyn Evaluator>, sockets: SocketGroup, config: &KernelConfig) -> Self {
        Self {
            evaluator,
            sockets,
            state: KernelState {
                execution_count: 0,
                trace_messages: config.trace_messages,
                capture_process_output: config.capture_process_output,
            },
        }
    }

    pub fn state(&self) -> &KernelState {
        &self.state
    }

    /// Bind the sockets described by `info` and serve until shutdown.
    ///
    /// A heartbeat failure stops the kernel with that error.
    pub async fn serve(
        info: &ConnectionInfo,
        config: &KernelConfig,
        evaluator: Arc<dyn Evaluator>,
    ) -> Result<Exit> {
        let cancel = CancellationToken::new();
        let bound = transport::zmq::bind(info, config, cancel.clone()).await?;
        let mut heartbeat = bound.heartbeat;

        let kernel = Kernel::new(evaluator, bound.group, config);
        let run = kernel.run(bound.inbound, cancel.clone());
        tokio::pin!(run);

        let outcome = tokio::select! {
            exit = &mut run => Ok(exit),
            stopped = &mut heartbeat => Err(heartbeat_failure(stopped)),
        };

        cancel.cancel();
        if outcome.is_ok() {
            match heartbeat.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("heartbeat stopped with error: {}", e),
                Err(e) => tracing::warn!("heartbeat task failed: {}", e),
            }
        }
        for task in bound.tasks {
            if let Err(e) = task.await {
                tracing::warn!("socket task failed: {}", e);
            }
        }
        outcome
    }

    /// Service inbound queues until shutdown, cancellation or closure of
    /// every queue.
    pub async fn run(mut self, inbound: InboundQueues, cancel: CancellationToken) -> Exit {
        let InboundQueues {
            shell,
            control,
            stdin,
        } = inbound;
        let mut shell = Some(shell);
        let mut control = Some(control);
        let mut stdin = Some(stdin);

        tracing::info!("kernel ready");

        loop {
            let (channel, item) = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("kernel cancelled");
                    return Exit::Cancelled;
                }
                Some(item) = next_item(&mut control) => (Channel::Control, item),
                Some(item) = next_item(&mut shell) => (Channel::Shell, item),
                Some(_) = next_item(&mut stdin) => {
                    tracing::trace!("stdin message ignored");
                    continue;
                }
                else => {
                    tracing::warn!("all inbound channels closed");
                    return Exit::ChannelsClosed;
                }
            };

            let frames = match item {
                Ok(frames) => frames,
                Err(e) => {
                    tracing::warn!("{} receive failed: {}", channel, e);
                    continue;
                }
            };

            let msg = match decode(frames, &self.sockets.signer) {
                Ok(msg) => msg,
                Err(e @ Error::Signature(_)) => {
                    tracing::warn!("dropping {} message: {}", channel, e);
                    continue;
                }
                Err(e) => {
                    tracing::error!("{} message undecodable, channel no longer serviced: {}", channel, e);
                    match channel {
                        Channel::Shell => shell = None,
                        Channel::Control => control = None,
                    }
                    continue;
                }
            };

            if let Flow::Shutdown { restart } = self.handle_message(channel, msg).await {
                tracing::info!("shutdown requested (restart={})", restart);
                return Exit::Shutdown { restart };
            }
        }
    }

    async fn handle_message(&mut self, channel: Channel, msg: ComposedMessage) -> Flow {
        if self.state.trace_messages {
            tracing::info!(
                "{} <- {} {}",
                channel,
                msg.msg_type(),
                msg.content
            );
        }

        let receipt = Receipt::new(msg, channel, self.sockets.clone());
        if let Err(e) = receipt.publish_status(KernelStatus::Busy).await {
            tracing::warn!("failed to publish busy status: {}", e);
        }

        let outcome = AssertUnwindSafe(self.dispatch(&receipt)).catch_unwind().await;

        if let Err(e) = receipt.publish_status(KernelStatus::Idle).await {
            tracing::warn!("failed to publish idle status: {}", e);
        }

        match outcome {
            Ok(Ok(flow)) => flow,
            Ok(Err(e)) => {
                tracing::error!("{} handler failed: {}", receipt.request().msg_type(), e);
                Flow::Continue
            }
            Err(payload) => {
                tracing::error!(
                    "{} handler panicked: {}",
                    receipt.request().msg_type(),
                    recovery::extract_panic_message(&payload)
                );
                Flow::Continue
            }
        }
    }

    async fn dispatch(&mut self, receipt: &Receipt) -> Result<Flow> {
        let evaluator = self.evaluator.as_ref();
        match receipt.request().msg_type() {
            KERNEL_INFO_REQUEST => handlers::handle_kernel_info_request(evaluator, receipt).await?,
            COMPLETE_REQUEST => handlers::handle_complete_request(evaluator, receipt).await?,
            EXECUTE_REQUEST => {
                execute::handle_execute_request(evaluator, &mut self.state, receipt).await?
            }
            SHUTDOWN_REQUEST => {
                if let Some(restart) = handlers::handle_shutdown_request(receipt).await? {
                    return Ok(Flow::Shutdown { restart });
                }
            }
            other => tracing::warn!("unhandled {} message type: {}", receipt.channel(), other),
        }
        Ok(Flow::Continue)
    }
}

fn heartbeat_failure(stopped: std::result::Result<Result<()>, tokio::task::JoinError>) -> Error {
    match stopped {
        Ok(Err(e)) => e,
        Ok(Ok(())) => Error::transport("heartbeat stopped unexpectedly"),
        Err(e) => Error::transport(format!("heartbeat task failed: {}", e)),
    }
}

/// Next item from a queue; a retired queue reads as closed.
async fn next_item(queue: &mut Option<Inbound>) -> Option<InboundItem> {
    match queue {
        Some(rx) => rx.recv().await,
        None => None,
    }
}
