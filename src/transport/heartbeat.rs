//! Heartbeat echo loop.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zeromq::{SocketRecv, SocketSend};

use crate::types::{Error, Result};

/// Echo every ping back unchanged, independently of the dispatch loop.
///
/// A silent front-end is not an error: the wait resets after `timeout`. A
/// receive failure ends the task with a fatal [`Error::Transport`]; the
/// front-end would otherwise see a dead kernel that still holds its sockets.
pub fn spawn<S>(mut socket: S, timeout: Duration, cancel: CancellationToken) -> JoinHandle<Result<()>>
where
    S: SocketRecv + SocketSend + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("heartbeat stopping");
                    return Ok(());
                }
                received = tokio::time::timeout(timeout, socket.recv()) => match received {
                    Err(_elapsed) => {
                        tracing::trace!("no heartbeat for {:?}", timeout);
                    }
                    Ok(Ok(ping)) => {
                        if let Err(e) = socket.send(ping).await {
                            tracing::warn!("heartbeat echo failed: {}", e);
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::error!("heartbeat receive failed: {}", e);
                        return Err(Error::transport(format!("heartbeat receive failed: {}", e)));
                    }
                },
            }
        }
    })
}
