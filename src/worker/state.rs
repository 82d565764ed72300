//! Per-slot worker state machine.
//!
//! ```text
//! spawning ──OK──▶ idle ◀──OK/ERROR── busy
//!     ▲             │ CALL ──────────▶ │
//!     │             ▼                  ▼
//! restarting ◀── exited ◀──────── (process exit)
//! ```
//!
//! `shutting_down` and `shut_down` are entered only when the farm ends or a
//! worker is recycled; `shut_down` is terminal.

use super::proc::Proc;
use super::protocol::{ChildMessage, RemoteError};
use crate::farm::task::Task;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Process created, INITIALIZE sent, waiting for the ready reply.
    Spawning,
    Idle,
    /// One call in flight.
    Busy,
    /// Process is gone or being torn down; replacement pending.
    Exited,
    /// Replacement process spawning.
    Restarting,
    /// END sent, waiting for the process to exit.
    ShuttingDown,
    ShutDown,
}

impl WorkerState {
    /// Whether new calls can be queued here for prompt delivery.
    pub fn accepts_work(self) -> bool {
        matches!(self, Self::Spawning | Self::Idle | Self::Busy)
    }

    /// Still waiting for the ready handshake.
    pub fn is_starting(self) -> bool {
        matches!(self, Self::Spawning | Self::Restarting)
    }

    pub fn is_shut_down(self) -> bool {
        self == Self::ShutDown
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Spawning => "spawning",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Exited => "exited",
            Self::Restarting => "restarting",
            Self::ShuttingDown => "shutting down",
            Self::ShutDown => "shut down",
        };
        f.write_str(name)
    }
}

/// Snapshot of one worker slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    /// 1-indexed slot id.
    pub worker_id: usize,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub queued: usize,
    pub in_flight: bool,
    pub jobs_completed: u64,
    pub restarts: u32,
}

/// One slot of the pool. Survives process replacement.
pub(crate) struct Worker {
    pub index: usize,
    pub state: WorkerState,
    pub proc: Option<Proc>,
    /// Bumped on every spawn so events from a previous process are ignored.
    pub generation: u64,
    pub queue: VecDeque<Task>,
    pub in_flight: Option<Task>,
    /// Consecutive processes that died before becoming ready.
    pub setup_failures: u32,
    pub last_setup_error: Option<RemoteError>,
    pub jobs_completed: u64,
    pub restarts: u32,
    /// END was sent to recycle an idle worker; replace it when it exits.
    pub recycling: bool,
    pub memory_check_pending: bool,
    /// The farm is ending; send END as soon as the in-flight call finishes.
    pub drain_requested: bool,
}

impl Worker {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: WorkerState::Spawning,
            proc: None,
            generation: 0,
            queue: VecDeque::new(),
            in_flight: None,
            setup_failures: 0,
            last_setup_error: None,
            jobs_completed: 0,
            restarts: 0,
            recycling: false,
            memory_check_pending: false,
            drain_requested: false,
        }
    }

    /// 1-indexed id, as seen by the child and in logs.
    pub fn id(&self) -> usize {
        self.index + 1
    }

    pub fn pid(&self) -> Option<u32> {
        self.proc.as_ref().and_then(Proc::pid)
    }

    /// Install a freshly spawned process.
    pub fn attach(&mut self, proc: Proc, replacing: bool) {
        self.generation += 1;
        self.proc = Some(proc);
        self.state = if replacing {
            WorkerState::Restarting
        } else {
            WorkerState::Spawning
        };
        self.recycling = false;
        self.memory_check_pending = false;
    }

    /// The ready handshake arrived.
    pub fn mark_ready(&mut self) {
        self.state = WorkerState::Idle;
        self.setup_failures = 0;
        self.last_setup_error = None;
    }

    /// Send `task` to the child. The worker must be idle.
    pub fn dispatch(&mut self, mut task: Task) {
        debug_assert!(self.in_flight.is_none());
        if let Some(proc) = &self.proc {
            // A dead channel shows up as an exit event shortly.
            proc.send(ChildMessage::call(task.method.clone(), task.args.clone()));
        }
        task.started(self.id());
        self.in_flight = Some(task);
        self.state = WorkerState::Busy;
    }

    /// Dispatch the head of the local queue if idle. Returns whether a call started.
    pub fn dispatch_next(&mut self) -> bool {
        if self.state != WorkerState::Idle {
            return false;
        }
        match self.queue.pop_front() {
            Some(task) => {
                self.dispatch(task);
                true
            }
            None => false,
        }
    }

    /// The in-flight call got its reply.
    pub fn complete(&mut self) -> Option<Task> {
        if self.state != WorkerState::Busy {
            return None;
        }
        let task = self.in_flight.take()?;
        self.state = WorkerState::Idle;
        self.jobs_completed += 1;
        Some(task)
    }

    /// Ask the child to tear down and exit.
    pub fn send_end(&mut self) {
        if let Some(proc) = &self.proc {
            proc.send(ChildMessage::End);
        }
        self.state = WorkerState::ShuttingDown;
    }

    /// The process is gone. Returns the call it was running, if any.
    pub fn detach(&mut self) -> Option<Task> {
        self.proc = None;
        self.memory_check_pending = false;
        self.in_flight.take()
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            worker_id: self.id(),
            state: self.state,
            pid: self.pid(),
            queued: self.queue.len(),
            in_flight: self.in_flight.is_some(),
            jobs_completed: self.jobs_completed,
            restarts: self.restarts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::farm::task::CallOptions;
    use serde_json::{Value, json};

    fn task(method: &str) -> (Task, crate::farm::task::PendingCall) {
        Task::new(method.to_string(), vec![json!(1)], None, CallOptions::new())
    }

    fn ready_worker() -> (Worker, tokio::sync::mpsc::UnboundedReceiver<ChildMessage>) {
        let (proc, rx) = Proc::detached();
        let mut worker = Worker::new(0);
        worker.attach(proc, false);
        worker.mark_ready();
        (worker, rx)
    }

    #[test]
    fn test_attach_bumps_generation() {
        let mut worker = Worker::new(2);
        assert_eq!(worker.id(), 3);
        assert_eq!(worker.generation, 0);

        let (proc, _rx) = Proc::detached();
        worker.attach(proc, false);
        assert_eq!(worker.generation, 1);
        assert_eq!(worker.state, WorkerState::Spawning);

        let (proc, _rx) = Proc::detached();
        worker.attach(proc, true);
        assert_eq!(worker.generation, 2);
        assert_eq!(worker.state, WorkerState::Restarting);
    }

    #[test]
    fn test_dispatch_sends_call_and_goes_busy() {
        let (mut worker, mut rx) = ready_worker();
        let (t, _pending) = task("double");
        worker.queue.push_back(t);

        assert!(worker.dispatch_next());
        assert_eq!(worker.state, WorkerState::Busy);
        assert!(worker.in_flight.is_some());
        assert_eq!(
            rx.try_recv().unwrap(),
            ChildMessage::call("double", vec![json!(1)])
        );

        // Busy workers keep further calls queued.
        let (t2, _pending2) = task("double");
        worker.queue.push_back(t2);
        assert!(!worker.dispatch_next());
        assert_eq!(worker.queue.len(), 1);
    }

    #[test]
    fn test_spawning_worker_does_not_dispatch() {
        let (proc, mut rx) = Proc::detached();
        let mut worker = Worker::new(0);
        worker.attach(proc, false);
        let (t, _pending) = task("echo");
        worker.queue.push_back(t);

        assert!(!worker.dispatch_next());
        assert!(rx.try_recv().is_err());

        worker.mark_ready();
        assert!(worker.dispatch_next());
    }

    #[tokio::test]
    async fn test_complete_returns_task_and_counts() {
        let (mut worker, _rx) = ready_worker();
        let (t, pending) = task("double");
        worker.dispatch(t);

        let done = worker.complete().unwrap();
        done.resolve(Ok(json!(2)));
        assert_eq!(pending.await.unwrap(), json!(2));
        assert_eq!(worker.state, WorkerState::Idle);
        assert_eq!(worker.jobs_completed, 1);
        assert!(worker.complete().is_none());
    }

    #[test]
    fn test_detach_hands_back_in_flight() {
        let (mut worker, _rx) = ready_worker();
        let (t, _pending) = task("exit");
        worker.dispatch(t);

        let orphan = worker.detach().unwrap();
        assert_eq!(orphan.method, "exit");
        assert!(worker.proc.is_none());
        assert!(worker.in_flight.is_none());
    }

    #[test]
    fn test_send_end() {
        let (mut worker, mut rx) = ready_worker();
        worker.send_end();
        assert_eq!(worker.state, WorkerState::ShuttingDown);
        assert_eq!(rx.try_recv().unwrap(), ChildMessage::End);
    }

    #[test]
    fn test_status_snapshot() {
        let (mut worker, _rx) = ready_worker();
        let (t, _pending) = task("sleep");
        worker.dispatch(t);
        let (t2, _pending2) = task("sleep");
        worker.queue.push_back(t2);

        let status = worker.status();
        assert_eq!(status.worker_id, 1);
        assert_eq!(status.state, WorkerState::Busy);
        assert!(status.in_flight);
        assert_eq!(status.queued, 1);

        let json: Value = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "busy");
    }

    #[test]
    fn test_state_predicates() {
        assert!(WorkerState::Busy.accepts_work());
        assert!(!WorkerState::Restarting.accepts_work());
        assert!(WorkerState::Restarting.is_starting());
        assert!(WorkerState::ShutDown.is_shut_down());
        assert_eq!(WorkerState::ShuttingDown.to_string(), "shutting down");
    }
}
