//! Handle to a running worker process.
//!
//! A `Proc` owns nothing but the pid and an outbox. Three background tasks do
//! the I/O: a writer drains the outbox into the socket, a supervisor forwards
//! replies and reaps the child, and the aggregator pumps its stdout and
//! stderr.

use super::protocol::{ChildMessage, ParentMessage};
use super::signals::{TerminationReason, analyze_exit_status};
use super::spawn::Spawned;
use super::{WorkerEvent, WorkerEventKind};
use crate::stream::StreamAggregator;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// How long to keep reading after the child has been reaped.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

pub(crate) struct Proc {
    pid: Option<u32>,
    outbox: mpsc::UnboundedSender<ChildMessage>,
}

impl Proc {
    /// Wire up a spawned child. Events for slot `index` are tagged with `generation`.
    pub fn launch(
        spawned: Spawned,
        index: usize,
        generation: u64,
        events: mpsc::UnboundedSender<WorkerEvent>,
        aggregator: &StreamAggregator,
    ) -> Self {
        let Spawned {
            child,
            ipc,
            stdout,
            stderr,
        } = spawned;
        let pid = child.id();
        let (read_half, write_half) = ipc.into_split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();

        aggregator.attach(index + 1, stdout, stderr);
        tokio::spawn(write_messages(write_half, outbox_rx, index));
        tokio::spawn(supervise(child, read_half, index, generation, events));

        Self { pid, outbox }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue a message for the child. Returns false once the channel is gone.
    pub fn send(&self, message: ChildMessage) -> bool {
        self.outbox.send(message).is_ok()
    }

    /// Send SIGTERM.
    pub fn terminate(&self) {
        self.signal(Signal::SIGTERM);
    }

    /// Send SIGKILL.
    pub fn kill(&self) {
        self.signal(Signal::SIGKILL);
    }

    fn signal(&self, sig: Signal) {
        let Some(pid) = self.pid else { return };
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
            // ESRCH just means it is already gone.
            tracing::trace!(pid, signal = %sig, error = %e, "Failed to signal worker");
        }
    }

    /// A handle with no process behind it, for exercising slot logic.
    #[cfg(test)]
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<ChildMessage>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        (Self { pid: None, outbox }, rx)
    }
}

async fn write_messages(
    mut socket: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<ChildMessage>,
    index: usize,
) {
    while let Some(message) = outbox.recv().await {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(worker_id = index + 1, error = %e, "Failed to encode message");
                continue;
            }
        };
        if let Err(e) = socket.write_all(line.as_bytes()).await {
            tracing::debug!(worker_id = index + 1, error = %e, "Worker channel closed for writing");
            break;
        }
    }
}

async fn supervise(
    mut child: Child,
    socket: OwnedReadHalf,
    index: usize,
    generation: u64,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let worker_id = index + 1;
    let mut lines = BufReader::new(socket).lines();
    let forward = |line: String| {
        if line.trim().is_empty() {
            return;
        }
        match ParentMessage::from_line(&line) {
            Ok(message) => {
                let _ = events.send(WorkerEvent {
                    index,
                    generation,
                    kind: WorkerEventKind::Message(message),
                });
            }
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "Ignoring unrecognized worker message");
            }
        }
    };

    // Usually EOF comes first. A grandchild can keep the socket open after the
    // worker itself died, so the exit status is watched at the same time.
    let mut status = None;
    loop {
        tokio::select! {
            biased;
            line = lines.next_line() => match line {
                Ok(Some(line)) => forward(line),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(worker_id, error = %e, "Worker channel read failed");
                    break;
                }
            },
            exited = child.wait() => {
                status = Some(exited);
                break;
            }
        }
    }

    if status.is_some() {
        // Pick up replies written just before exit.
        while let Ok(Ok(Some(line))) = timeout(EXIT_DRAIN_TIMEOUT, lines.next_line()).await {
            forward(line);
        }
    }

    let status = match status {
        Some(status) => status,
        None => child.wait().await,
    };
    let reason = match status {
        Ok(status) => analyze_exit_status(status),
        Err(e) => {
            tracing::warn!(worker_id, error = %e, "Failed to reap worker");
            TerminationReason::Unknown
        }
    };
    tracing::debug!(worker_id, generation, reason = %reason, "Worker process exited");

    let _ = events.send(WorkerEvent {
        index,
        generation,
        kind: WorkerEventKind::Exited(reason),
    });
}
