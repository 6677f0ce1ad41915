//! Output capture for a single execution.
//!
//! Evaluators write to an [`OutErr`] pair. While an execution runs, the
//! process's own stdout and stderr descriptors can also be pointed at pipes
//! whose contents land in the same pair, so output from foreign runtimes and
//! C libraries is captured too. Each stream feeds a forwarder task that
//! republishes every chunk as an iopub `stream` message under the request that
//! caused it.

use os_pipe::PipeReader;
use std::fmt;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::OnceLock;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use super::receipt::Receipt;
use crate::types::Result;

/// Name of an output stream as it appears in `stream` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamName::Stdout => "stdout",
            StreamName::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write end of one captured stream.
///
/// Writes never block. Text written after the capture has finished is
/// dropped.
#[derive(Debug)]
pub struct StreamWriter {
    name: StreamName,
    tx: mpsc::UnboundedSender<String>,
}

impl StreamWriter {
    fn new(name: StreamName, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { name, tx }
    }

    pub fn name(&self) -> StreamName {
        self.name
    }

    /// Second writer feeding the same stream.
    pub(crate) fn sibling(&self) -> Self {
        Self::new(self.name, self.tx.clone())
    }

    /// Queue `text` for publication. Empty text is ignored.
    pub fn write_text(&self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        if self.tx.send(text).is_err() {
            tracing::debug!("{} capture already finished, output dropped", self.name);
        }
    }
}

impl fmt::Write for StreamWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_text(s);
        Ok(())
    }
}

/// The stdout/stderr pair handed to an evaluator.
#[derive(Debug)]
pub struct OutErr {
    pub out: StreamWriter,
    pub err: StreamWriter,
}

impl OutErr {
    /// A pair whose output is collected by the returned receivers instead of
    /// being published.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<String>, mpsc::UnboundedReceiver<String>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let pair = Self {
            out: StreamWriter::new(StreamName::Stdout, out_tx),
            err: StreamWriter::new(StreamName::Stderr, err_tx),
        };
        (pair, out_rx, err_rx)
    }
}

/// Capture in progress: the writer pair, the two forwarder tasks and, when
/// enabled, the descriptor redirect.
#[derive(Debug)]
pub struct StreamCapture {
    out_err: OutErr,
    forwarders: [JoinHandle<()>; 2],
    redirect: Option<ProcessRedirect>,
}

impl StreamCapture {
    /// Start forwarding both streams as `stream` messages parented on the
    /// receipt's request. With `redirect_process`, fd 1 and fd 2 feed the
    /// streams as well until [`finish`](Self::finish).
    pub async fn start(receipt: &Receipt, redirect_process: bool) -> Self {
        let (out_err, out_rx, err_rx) = OutErr::detached();
        let forwarders = [
            spawn_forwarder(StreamName::Stdout, out_rx, receipt.clone()),
            spawn_forwarder(StreamName::Stderr, err_rx, receipt.clone()),
        ];
        let redirect = if redirect_process {
            match ProcessRedirect::install(&out_err).await {
                Ok(redirect) => Some(redirect),
                Err(e) => {
                    tracing::warn!("process output not captured: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Self {
            out_err,
            forwarders,
            redirect,
        }
    }

    pub fn out_err(&self) -> &OutErr {
        &self.out_err
    }

    /// Restore the process descriptors, close both writers and wait until
    /// every captured chunk has been published.
    pub async fn finish(self) {
        let Self {
            out_err,
            forwarders,
            redirect,
        } = self;
        if let Some(redirect) = redirect {
            redirect.finish().await;
        }
        drop(out_err);
        for forwarder in forwarders {
            if let Err(e) = forwarder.await {
                tracing::warn!("stream forwarder failed: {}", e);
            }
        }
    }
}

/// Only one redirect may own fd 1 and fd 2 at a time.
fn redirect_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// The process's stdout and stderr descriptors pointed at pipes.
///
/// Dropping restores the original descriptors; [`finish`](Self::finish) also
/// waits for the pipes to drain.
#[derive(Debug)]
struct ProcessRedirect {
    /// Target descriptor and a duplicate of what it pointed at before.
    saved: Vec<(RawFd, OwnedFd)>,
    pumps: Vec<JoinHandle<()>>,
    _guard: MutexGuard<'static, ()>,
}

impl ProcessRedirect {
    async fn install(out_err: &OutErr) -> Result<Self> {
        let guard = redirect_lock().lock().await;
        flush_std();

        let mut redirect = Self {
            saved: Vec::with_capacity(2),
            pumps: Vec::with_capacity(2),
            _guard: guard,
        };
        let targets = [
            (std::io::stdout().as_raw_fd(), std::io::stdout().as_fd().try_clone_to_owned(), &out_err.out),
            (std::io::stderr().as_raw_fd(), std::io::stderr().as_fd().try_clone_to_owned(), &out_err.err),
        ];
        for (target, original, writer) in targets {
            let original = original?;
            let (reader, pipe_writer) = os_pipe::pipe()?;
            nix::unistd::dup2(pipe_writer.as_raw_fd(), target).map_err(std::io::Error::from)?;
            redirect.saved.push((target, original));
            // `target` now holds the only write end.
            drop(pipe_writer);

            let writer = writer.sibling();
            redirect
                .pumps
                .push(tokio::task::spawn_blocking(move || pump(reader, writer)));
        }
        Ok(redirect)
    }

    async fn finish(mut self) {
        self.restore();
        for pump in std::mem::take(&mut self.pumps) {
            if let Err(e) = pump.await {
                tracing::warn!("output pipe reader failed: {}", e);
            }
        }
    }

    fn restore(&mut self) {
        flush_std();
        for (target, original) in self.saved.drain(..) {
            if let Err(e) = nix::unistd::dup2(original.as_raw_fd(), target) {
                tracing::error!("cannot restore descriptor {}: {}", target, e);
            }
        }
    }
}

impl Drop for ProcessRedirect {
    fn drop(&mut self) {
        self.restore();
    }
}

fn flush_std() {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}

/// Copy a pipe into a stream until every write end is closed.
fn pump(mut reader: PipeReader, writer: StreamWriter) {
    let mut buf = [0u8; 4096];
    let mut pending = Utf8Pending::default();
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => writer.write_text(pending.push(&buf[..n])),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("{} pipe read failed: {}", writer.name(), e);
                break;
            }
        }
    }
    writer.write_text(pending.flush());
}

/// Bytes held back so a UTF-8 sequence is never split across two chunks.
#[derive(Debug, Default)]
pub(crate) struct Utf8Pending(Vec<u8>);

impl Utf8Pending {
    /// Append `bytes` and return the text that is complete so far.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.0.extend_from_slice(bytes);
        let complete = match std::str::from_utf8(&self.0) {
            Ok(_) => self.0.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.0.len(),
        };
        let rest = self.0.split_off(complete);
        let text = String::from_utf8_lossy(&self.0).into_owned();
        self.0 = rest;
        text
    }

    /// Whatever is left, lossily decoded.
    pub(crate) fn flush(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.0).into_owned();
        self.0.clear();
        text
    }
}

fn spawn_forwarder(
    name: StreamName,
    mut rx: mpsc::UnboundedReceiver<String>,
    receipt: Receipt,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = receipt.publish_stream(name, &text).await {
                tracing::warn!("failed to publish {} chunk: {}", name, e);
            }
        }
    })
}
