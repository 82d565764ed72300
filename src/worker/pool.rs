//! Fixed set of worker slots and their processes.
//!
//! The pool only creates, replaces and signals processes. Deciding what runs
//! where, and reacting to replies and exits, belongs to the farm controller.

use super::proc::Proc;
use super::protocol::ChildMessage;
use super::spawn::spawn_worker;
use super::state::{Worker, WorkerState, WorkerStatus};
use super::WorkerEvent;
use crate::error::Result;
use crate::farm::config::{FarmConfig, ForkOptions};
use crate::stream::StreamAggregator;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
    fork_options: ForkOptions,
    module_path: String,
    setup_args: Vec<Value>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    aggregator: StreamAggregator,
}

impl WorkerPool {
    /// Create `config.num_workers` empty slots. Nothing is spawned yet.
    pub fn new(
        config: &FarmConfig,
        events: mpsc::UnboundedSender<WorkerEvent>,
        aggregator: StreamAggregator,
    ) -> Self {
        Self {
            workers: (0..config.num_workers).map(Worker::new).collect(),
            fork_options: config.fork_options.clone(),
            module_path: config.module_path.clone(),
            setup_args: config.setup_args.clone(),
            events,
            aggregator,
        }
    }

    /// Spawn a process in every slot.
    pub fn spawn_all(&mut self) -> Result<()> {
        info!(
            workers = self.workers.len(),
            module = %self.module_path,
            "Starting worker pool"
        );
        for index in 0..self.workers.len() {
            if let Err(e) = self.spawn(index, false) {
                self.kill_all();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Start a process in slot `index` and send it INITIALIZE.
    ///
    /// With `replacing`, the slot enters `restarting` and keeps its queue.
    pub fn spawn(&mut self, index: usize, replacing: bool) -> Result<()> {
        let worker = &mut self.workers[index];
        let spawned = spawn_worker(&self.fork_options, worker.id())?;
        let generation = worker.generation + 1;
        let proc = Proc::launch(
            spawned,
            index,
            generation,
            self.events.clone(),
            &self.aggregator,
        );
        proc.send(ChildMessage::initialize(
            self.module_path.clone(),
            self.setup_args.clone(),
        ));
        debug!(
            worker_id = worker.id(),
            pid = ?proc.pid(),
            generation,
            replacing,
            "Spawned worker process"
        );
        worker.attach(proc, replacing);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn get(&self, index: usize) -> &Worker {
        &self.workers[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Worker {
        &mut self.workers[index]
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Worker> {
        self.workers.iter_mut()
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(|w| w.state).collect()
    }

    pub fn all_shut_down(&self) -> bool {
        self.workers.iter().all(|w| w.state.is_shut_down())
    }

    /// Whether every live slot has finished its ready handshake.
    pub fn all_ready(&self) -> bool {
        self.workers
            .iter()
            .all(|w| !w.state.is_starting() && w.state != WorkerState::Exited)
    }

    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.workers.iter().map(Worker::status).collect()
    }

    /// SIGKILL every running process.
    pub fn kill_all(&self) {
        for proc in self.workers.iter().filter_map(|w| w.proc.as_ref()) {
            proc.kill();
        }
    }
}
