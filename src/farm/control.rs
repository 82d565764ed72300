//! The farm's control loop.
//!
//! One task owns the pool, the scheduler and every queue. It reacts to three
//! sources in turn: commands from [`Farm`](super::Farm) handles, events from
//! worker processes, and its own timers. Nothing here is shared, so nothing
//! is locked.

use super::PoolExitResult;
use super::config::{FarmConfig, SIGKILL_DELAY};
use super::scheduler::{Placement, Scheduler};
use super::task::Task;
use crate::error::{FarmError, Result};
use crate::memory::MemoryLimit;
use crate::worker::pool::WorkerPool;
use crate::worker::protocol::{ChildMessage, ParentMessage, RemoteError};
use crate::worker::signals::TerminationReason;
use crate::worker::{WorkerEvent, WorkerEventKind, WorkerState, WorkerStatus};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Requests from the public handle.
pub(crate) enum Command {
    Call(Task),
    Start(oneshot::Sender<Result<()>>),
    End(oneshot::Sender<PoolExitResult>),
    Status(oneshot::Sender<Vec<WorkerStatus>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// A busy worker's time to finish its call after `end()`.
    Grace,
    /// Time for a worker to exit after END.
    Force,
    /// Time between SIGTERM and SIGKILL.
    Kill,
}

#[derive(Debug)]
struct Timer {
    index: usize,
    generation: u64,
    kind: TimerKind,
}

fn arm_timer(
    timers: &mpsc::UnboundedSender<Timer>,
    index: usize,
    generation: u64,
    kind: TimerKind,
    delay: Duration,
) {
    let timers = timers.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = timers.send(Timer {
            index,
            generation,
            kind,
        });
    });
}

pub(crate) struct Controller {
    pool: WorkerPool,
    scheduler: Scheduler,
    /// Calls waiting for any slot to go idle (in-order scheduling).
    waiting: VecDeque<Task>,
    max_retries: u32,
    shutdown_grace: Duration,
    idle_memory_limit: Option<MemoryLimit>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    timers_tx: mpsc::UnboundedSender<Timer>,
    timers: mpsc::UnboundedReceiver<Timer>,
    ending: bool,
    force_exited: bool,
    /// First slot that failed permanently, and why.
    fatal: Option<(usize, String)>,
    start_waiters: Vec<oneshot::Sender<Result<()>>>,
    end_waiters: Vec<oneshot::Sender<PoolExitResult>>,
}

impl Controller {
    pub fn new(
        config: &FarmConfig,
        pool: WorkerPool,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> Self {
        let (timers_tx, timers) = mpsc::unbounded_channel();
        Self {
            pool,
            scheduler: Scheduler::new(config.scheduling),
            waiting: VecDeque::new(),
            max_retries: config.max_retries,
            shutdown_grace: config.shutdown_grace,
            idle_memory_limit: config.idle_memory_limit,
            commands,
            events,
            timers_tx,
            timers,
            ending: false,
            force_exited: false,
            fatal: None,
            start_waiters: Vec::new(),
            end_waiters: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        let mut commands_open = true;

        loop {
            tokio::select! {
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        commands_open = false;
                        if !self.ending {
                            self.abandon();
                        }
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(timer) = self.timers.recv() => self.handle_timer(timer),
            }

            if self.ending && self.pool.all_shut_down() {
                break;
            }
        }

        self.finish();
    }

    // --- commands -------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call(task) => {
                if self.ending {
                    task.reject(FarmError::Ended);
                } else {
                    self.schedule(task);
                }
            }
            Command::Start(reply) => {
                if self.ending {
                    let _ = reply.send(Err(FarmError::Ended));
                } else if let Some(err) = self.fatal_error() {
                    let _ = reply.send(Err(err));
                } else if self.pool.all_ready() {
                    let _ = reply.send(Ok(()));
                } else {
                    self.start_waiters.push(reply);
                }
            }
            Command::End(reply) => {
                self.end_waiters.push(reply);
                self.begin_shutdown();
            }
            Command::Status(reply) => {
                let _ = reply.send(self.pool.statuses());
            }
        }
    }

    fn fatal_error(&self) -> Option<FarmError> {
        self.fatal
            .as_ref()
            .map(|(worker_id, message)| FarmError::PoolFatal {
                worker_id: *worker_id,
                message: message.clone(),
            })
    }

    fn schedule(&mut self, task: Task) {
        let states = self.pool.states();
        match self.scheduler.place(task.key.as_deref(), &states) {
            Placement::Worker(index) => {
                trace!(
                    worker_id = index + 1,
                    method = %task.method,
                    retries = task.retries,
                    "Scheduled call"
                );
                self.pool.get_mut(index).queue.push_back(task);
                self.pump(index);
            }
            Placement::Wait => self.waiting.push_back(task),
            Placement::Unavailable => {
                let err = self.fatal_error().unwrap_or(FarmError::Ended);
                task.reject(err);
            }
        }
    }

    /// Give an idle slot its next call: its own queue first, then the shared one.
    fn pump(&mut self, index: usize) {
        let worker = self.pool.get_mut(index);
        if worker.state != WorkerState::Idle || worker.dispatch_next() {
            return;
        }
        if let Some(task) = self.waiting.pop_front() {
            self.pool.get_mut(index).dispatch(task);
        }
    }

    // --- worker events --------------------------------------------------

    fn handle_event(&mut self, event: WorkerEvent) {
        if event.index >= self.pool.len() || self.pool.get(event.index).generation != event.generation
        {
            trace!(
                worker_id = event.index + 1,
                generation = event.generation,
                "Ignoring event from a replaced process"
            );
            return;
        }

        match event.kind {
            WorkerEventKind::Message(message) => self.handle_message(event.index, message),
            WorkerEventKind::Exited(reason) => self.handle_exit(event.index, reason),
        }
    }

    fn handle_message(&mut self, index: usize, message: ParentMessage) {
        match message {
            ParentMessage::Ok { result } => {
                if self.pool.get(index).state.is_starting() {
                    self.on_ready(index);
                } else {
                    self.on_reply(index, Ok(result));
                }
            }
            ParentMessage::ClientError(e) => self.on_reply(index, Err(FarmError::Client(e))),
            ParentMessage::SetupError(e) => self.on_setup_error(index, e),
            ParentMessage::Custom { payload } => self.on_custom(index, payload),
            ParentMessage::MemUsage { rss_bytes } => self.on_mem_usage(index, rss_bytes),
        }
    }

    fn on_ready(&mut self, index: usize) {
        let worker = self.pool.get_mut(index);
        worker.mark_ready();
        debug!(worker_id = worker.id(), pid = ?worker.pid(), "Worker ready");

        self.pump(index);
        self.check_started();
    }

    fn on_reply(&mut self, index: usize, result: Result<Value>) {
        let Some(task) = self.pool.get_mut(index).complete() else {
            debug!(worker_id = index + 1, "Ignoring reply with no call in flight");
            return;
        };
        trace!(
            worker_id = index + 1,
            method = %task.method,
            ok = result.is_ok(),
            "Call finished"
        );
        task.resolve(result);

        let worker = self.pool.get_mut(index);
        if worker.drain_requested {
            worker.send_end();
            let generation = worker.generation;
            arm_timer(
                &self.timers_tx,
                index,
                generation,
                TimerKind::Force,
                self.shutdown_grace,
            );
            return;
        }

        self.pump(index);
        self.request_memory_check(index);
    }

    fn request_memory_check(&mut self, index: usize) {
        if self.idle_memory_limit.is_none() {
            return;
        }
        let worker = self.pool.get_mut(index);
        if worker.state != WorkerState::Idle || worker.memory_check_pending {
            return;
        }
        if let Some(proc) = &worker.proc {
            worker.memory_check_pending = proc.send(ChildMessage::MemUsage);
        }
    }

    fn on_mem_usage(&mut self, index: usize, rss_bytes: u64) {
        let ending = self.ending;
        let worker = self.pool.get_mut(index);
        worker.memory_check_pending = false;

        let Some(limit) = self.idle_memory_limit else {
            return;
        };
        if ending || worker.state != WorkerState::Idle || !worker.queue.is_empty() {
            return;
        }
        if limit.is_exceeded_by(rss_bytes) {
            info!(
                worker_id = worker.id(),
                rss_bytes,
                limit = %limit,
                "Recycling idle worker over memory limit"
            );
            worker.recycling = true;
            worker.send_end();
            let generation = worker.generation;
            arm_timer(
                &self.timers_tx,
                index,
                generation,
                TimerKind::Force,
                self.shutdown_grace,
            );
        }
    }

    fn on_custom(&mut self, index: usize, payload: Value) {
        match &self.pool.get(index).in_flight {
            Some(task) => task.forward_message(payload),
            None => debug!(worker_id = index + 1, "Dropping custom message with no call in flight"),
        }
    }

    fn on_setup_error(&mut self, index: usize, err: RemoteError) {
        let worker = self.pool.get_mut(index);
        warn!(worker_id = worker.id(), error = %err, "Worker setup failed");

        if let Some(task) = worker.in_flight.take() {
            task.reject(FarmError::Setup(err.clone()));
        }
        if worker.state == WorkerState::Busy || worker.state == WorkerState::Idle {
            // Not starting, so the exit is an ordinary replacement.
            worker.state = WorkerState::Exited;
        }
        worker.last_setup_error = Some(err);
        if let Some(proc) = &worker.proc {
            proc.kill();
        }
    }

    fn handle_exit(&mut self, index: usize, reason: TerminationReason) {
        let ending = self.ending;
        let worker = self.pool.get_mut(index);
        let prior = worker.state;
        let orphan = worker.detach();
        let worker_id = worker.id();

        if ending {
            worker.state = WorkerState::ShutDown;
            for task in worker.queue.drain(..) {
                task.reject(FarmError::Ended);
            }
            debug!(worker_id, reason = %reason, "Worker shut down");
            if let Some(task) = orphan {
                let attempts = task.retries + 1;
                task.reject(FarmError::WorkerExited {
                    worker_id,
                    attempts,
                    reason: reason.to_string(),
                });
            }
            return;
        }

        if worker.recycling {
            debug!(worker_id, "Recycled worker exited; replacing");
            self.respawn(index);
        } else if prior.is_starting() {
            worker.setup_failures = worker.setup_failures.saturating_add(1);
            let failures = worker.setup_failures;
            if failures > self.max_retries {
                let message = match worker.last_setup_error.take() {
                    Some(e) => format!("Error when calling setup: {}", e),
                    None => format!("worker {} before becoming ready", reason),
                };
                self.mark_fatal(index, message);
            } else {
                warn!(
                    worker_id,
                    reason = %reason,
                    failures,
                    "Worker exited before becoming ready; replacing"
                );
                self.respawn(index);
            }
        } else {
            worker.restarts += 1;
            warn!(
                worker_id,
                reason = %reason,
                in_flight = orphan.is_some(),
                "Worker exited unexpectedly; replacing"
            );
            self.respawn(index);
        }

        if let Some(task) = orphan {
            self.retry(worker_id, task, &reason);
        }
    }

    fn retry(&mut self, worker_id: usize, mut task: Task, reason: &TerminationReason) {
        task.retries += 1;
        if task.retries <= self.max_retries {
            info!(
                worker_id,
                method = %task.method,
                attempt = task.retries + 1,
                "Retrying call after worker exit"
            );
            self.schedule(task);
        } else {
            warn!(
                worker_id,
                method = %task.method,
                attempts = task.retries,
                "Call retries exhausted"
            );
            let attempts = task.retries;
            task.reject(FarmError::WorkerExited {
                worker_id,
                attempts,
                reason: reason.to_string(),
            });
        }
    }

    /// Spawn a replacement in slot `index`, keeping its queue.
    fn respawn(&mut self, index: usize) {
        loop {
            match self.pool.spawn(index, true) {
                Ok(()) => return,
                Err(e) => {
                    let worker = self.pool.get_mut(index);
                    worker.setup_failures = worker.setup_failures.saturating_add(1);
                    error!(worker_id = worker.id(), error = %e, "Failed to respawn worker");
                    if worker.setup_failures > self.max_retries {
                        self.mark_fatal(index, e.to_string());
                        return;
                    }
                }
            }
        }
    }

    /// Retire slot `index` for good.
    fn mark_fatal(&mut self, index: usize, message: String) {
        let worker = self.pool.get_mut(index);
        let worker_id = worker.id();
        error!(worker_id, %message, "Worker slot failed permanently");

        worker.state = WorkerState::ShutDown;
        if let Some(proc) = worker.proc.take() {
            proc.kill();
        }
        let err = || FarmError::PoolFatal {
            worker_id,
            message: message.clone(),
        };
        for task in worker.queue.drain(..) {
            task.reject(err());
        }
        if let Some(task) = worker.in_flight.take() {
            task.reject(err());
        }
        if self.pool.all_shut_down() {
            for task in self.waiting.drain(..) {
                task.reject(err());
            }
        }
        if self.fatal.is_none() {
            self.fatal = Some((worker_id, message.clone()));
        }
        self.check_started();
    }

    fn check_started(&mut self) {
        if self.start_waiters.is_empty() || (self.fatal.is_none() && !self.pool.all_ready()) {
            return;
        }
        for reply in std::mem::take(&mut self.start_waiters) {
            let outcome = match self.fatal_error() {
                Some(err) => Err(err),
                None => Ok(()),
            };
            let _ = reply.send(outcome);
        }
    }

    // --- shutdown -------------------------------------------------------

    fn begin_shutdown(&mut self) {
        if self.ending {
            return;
        }
        self.ending = true;
        info!(workers = self.pool.len(), "Shutting down worker pool");

        for task in self.waiting.drain(..) {
            task.reject(FarmError::Ended);
        }
        for reply in self.start_waiters.drain(..) {
            let _ = reply.send(Err(FarmError::Ended));
        }

        let grace = self.shutdown_grace;
        for worker in self.pool.iter_mut() {
            for task in worker.queue.drain(..) {
                task.reject(FarmError::Ended);
            }
            match worker.state {
                WorkerState::Idle | WorkerState::Spawning | WorkerState::Restarting => {
                    worker.send_end();
                    arm_timer(
                        &self.timers_tx,
                        worker.index,
                        worker.generation,
                        TimerKind::Force,
                        grace,
                    );
                }
                WorkerState::Busy => {
                    worker.drain_requested = true;
                    arm_timer(
                        &self.timers_tx,
                        worker.index,
                        worker.generation,
                        TimerKind::Grace,
                        grace,
                    );
                }
                WorkerState::ShuttingDown => {
                    // Already ending after a recycle; its force timer is armed.
                    worker.recycling = false;
                }
                WorkerState::Exited | WorkerState::ShutDown => {}
            }
        }
    }

    /// The Farm handle was dropped without `end()`.
    fn abandon(&mut self) {
        warn!("Farm dropped without end(); killing workers");
        self.begin_shutdown();
        self.pool.kill_all();
    }

    fn handle_timer(&mut self, timer: Timer) {
        let worker = self.pool.get(timer.index);
        if worker.generation != timer.generation || worker.proc.is_none() {
            return;
        }

        match timer.kind {
            TimerKind::Grace => {
                if worker.state == WorkerState::Busy && worker.drain_requested {
                    warn!(
                        worker_id = worker.id(),
                        "Worker did not finish its call within the grace period"
                    );
                    self.force(timer.index);
                }
            }
            TimerKind::Force => {
                if worker.state == WorkerState::ShuttingDown {
                    warn!(worker_id = worker.id(), "Worker did not exit after END");
                    self.force(timer.index);
                }
            }
            TimerKind::Kill => {
                if let Some(proc) = &worker.proc {
                    warn!(worker_id = worker.id(), pid = ?proc.pid(), "Killing worker");
                    proc.kill();
                }
            }
        }
    }

    /// SIGTERM now, SIGKILL if it is still around after [`SIGKILL_DELAY`].
    fn force(&mut self, index: usize) {
        let worker = self.pool.get(index);
        let Some(proc) = &worker.proc else {
            return;
        };
        if self.ending {
            self.force_exited = true;
        }
        proc.terminate();
        arm_timer(
            &self.timers_tx,
            index,
            worker.generation,
            TimerKind::Kill,
            SIGKILL_DELAY,
        );
    }

    fn finish(mut self) {
        info!(force_exited = self.force_exited, "Worker pool shut down");

        // Calls that raced with end().
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Call(task) => task.reject(FarmError::Ended),
                Command::Start(reply) => {
                    let _ = reply.send(Err(FarmError::Ended));
                }
                Command::End(reply) => self.end_waiters.push(reply),
                Command::Status(reply) => {
                    let _ = reply.send(self.pool.statuses());
                }
            }
        }

        let result = PoolExitResult {
            force_exited: self.force_exited,
        };
        for reply in self.end_waiters.drain(..) {
            let _ = reply.send(result);
        }
    }
}
