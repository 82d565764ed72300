//! The public farm: proxies, scheduling, retries and shutdown.
//!
//! A [`Farm`] is a cheap handle. All bookkeeping happens in a controller task
//! spawned onto the current tokio runtime when the farm is created.

pub mod config;
pub(crate) mod control;
pub mod proxy;
pub(crate) mod scheduler;
pub mod task;

use crate::error::{FarmError, Result};
use crate::stream::{OutputStream, StreamAggregator};
use crate::worker::WorkerStatus;
use crate::worker::pool::WorkerPool;
use config::FarmConfig;
use control::{Command, Controller};
use proxy::MethodProxy;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use task::{CallOptions, PendingCall, Task};
use tokio::sync::{mpsc, oneshot};

/// Outcome of [`Farm::end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolExitResult {
    /// Whether any worker had to be terminated with a signal.
    pub force_exited: bool,
}

/// A fixed pool of worker processes serving calls to one module.
pub struct Farm {
    config: Arc<FarmConfig>,
    commands: mpsc::UnboundedSender<Command>,
    ending: AtomicBool,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
}

impl Farm {
    /// Spawn the workers and start the controller.
    ///
    /// Must be called from within a tokio runtime. Workers begin loading
    /// their module right away; [`start`](Self::start) waits for them.
    pub fn new(config: FarmConfig) -> Result<Self> {
        let config = config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(FarmError::Config(
                "a farm must be created inside a tokio runtime".into(),
            ));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (aggregator, stdout, stderr) = StreamAggregator::new();

        let mut pool = WorkerPool::new(&config, events_tx, aggregator);
        pool.spawn_all()?;

        let controller = Controller::new(&config, pool, commands_rx, events_rx);
        tokio::spawn(controller.run());

        Ok(Self {
            config: Arc::new(config),
            commands: commands_tx,
            ending: AtomicBool::new(false),
            stdout: Some(stdout),
            stderr: Some(stderr),
        })
    }

    /// Wait until every worker has loaded its module.
    pub async fn start(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Start(tx))?;
        rx.await.map_err(|_| FarmError::Disconnected)?
    }

    /// Call `method` with positional `args` on some worker.
    ///
    /// Fails immediately once [`end`](Self::end) has been called or when the
    /// method is not exposed.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<PendingCall> {
        self.call_with(method, args, CallOptions::default())
    }

    pub fn call_with(
        &self,
        method: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<PendingCall> {
        if self.is_ended() {
            return Err(FarmError::Ended);
        }
        if !self.config.exposes(method) {
            return Err(FarmError::UnknownMethod(method.to_string()));
        }

        let key = self
            .config
            .compute_worker_key
            .as_ref()
            .and_then(|key_fn| key_fn(method, &args));
        let (task, pending) = Task::new(method.to_string(), args, key, options);
        self.send(Command::Call(task))?;
        Ok(pending)
    }

    /// A callable handle for one method.
    pub fn proxy(&self, method: &str) -> Result<MethodProxy<'_>> {
        if !self.config.exposes(method) {
            return Err(FarmError::UnknownMethod(method.to_string()));
        }
        Ok(MethodProxy::new(self, method))
    }

    /// One proxy per configured method.
    pub fn proxies(&self) -> Vec<MethodProxy<'_>> {
        self.config
            .exposed_methods
            .iter()
            .map(|m| MethodProxy::new(self, m))
            .collect()
    }

    /// Shut the pool down. Terminal: a second call fails with [`FarmError::Ended`].
    pub async fn end(&self) -> Result<PoolExitResult> {
        if self.ending.swap(true, Ordering::SeqCst) {
            return Err(FarmError::Ended);
        }
        let (tx, rx) = oneshot::channel();
        self.send(Command::End(tx))?;
        rx.await.map_err(|_| FarmError::Disconnected)
    }

    pub fn is_ended(&self) -> bool {
        self.ending.load(Ordering::SeqCst)
    }

    /// Merged stdout of all workers. Can be taken once.
    pub fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout.take()
    }

    /// Merged stderr of all workers. Can be taken once.
    pub fn take_stderr(&mut self) -> Option<OutputStream> {
        self.stderr.take()
    }

    /// Current state of every slot.
    pub async fn workers(&self) -> Result<Vec<WorkerStatus>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx))?;
        rx.await.map_err(|_| FarmError::Disconnected)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn config(&self) -> &FarmConfig {
        &self.config
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| FarmError::Disconnected)
    }
}

impl std::fmt::Debug for Farm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Farm")
            .field("module_path", &self.config.module_path)
            .field("num_workers", &self.config.num_workers)
            .field("ended", &self.is_ended())
            .finish()
    }
}
