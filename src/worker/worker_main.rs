//! Worker subprocess entry point.
//!
//! A worker reads requests from fd 3, runs them against the module named in
//! INITIALIZE, and writes one reply per request. It is single threaded: a
//! call runs to completion before the next request is read.

use super::ipc::{self, LineReader, LineWriter, PipeFd};
use super::protocol::{ChildMessage, IPC_FD, IPC_FD_ENV, ParentMessage, RemoteError, WORKER_ID_ENV};
use crate::memory::current_rss_bytes;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};

/// Error returned by module code. Travels back to the caller as data.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ModuleError {
    pub kind: String,
    pub message: String,
    pub stack: Option<String>,
    pub extra: Value,
}

impl ModuleError {
    /// An error of kind `Error`.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind("Error", message)
    }

    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
            extra: Value::Null,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }
}

impl From<serde_json::Error> for ModuleError {
    fn from(e: serde_json::Error) -> Self {
        Self::with_kind("TypeError", e.to_string())
    }
}

impl From<ModuleError> for RemoteError {
    fn from(e: ModuleError) -> Self {
        RemoteError {
            kind: e.kind,
            message: e.message,
            stack: e.stack,
            extra: e.extra,
        }
    }
}

/// What module code can see of the worker while it runs.
pub struct CallContext<'a> {
    worker_id: usize,
    writer: &'a mut LineWriter,
}

impl CallContext<'_> {
    /// 1-indexed id of the slot this process serves.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Emit an out-of-band payload to the caller of the current call.
    pub fn send_custom(&mut self, payload: Value) -> io::Result<()> {
        let line = ParentMessage::Custom { payload }.to_line()?;
        self.writer.write_line(&line)
    }
}

/// Code loaded into a worker.
pub trait WorkerModule: Send {
    /// One-time setup, run when the worker starts.
    fn setup(&mut self, _args: &[Value], _ctx: &mut CallContext<'_>) -> Result<(), ModuleError> {
        Ok(())
    }

    fn call(
        &mut self,
        method: &str,
        args: &[Value],
        ctx: &mut CallContext<'_>,
    ) -> Result<Value, ModuleError>;

    /// Run once before the worker exits cleanly.
    fn teardown(&mut self) {}
}

type Method = Box<dyn FnMut(&[Value], &mut CallContext<'_>) -> Result<Value, ModuleError> + Send>;
type SetupFn = Box<dyn FnMut(&[Value]) -> Result<(), ModuleError> + Send>;
type TeardownFn = Box<dyn FnMut() + Send>;

/// A [`WorkerModule`] assembled from closures.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, Method>,
    setup: Option<SetupFn>,
    teardown: Option<TeardownFn>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: FnMut(&[Value], &mut CallContext<'_>) -> Result<Value, ModuleError> + Send + 'static,
    {
        self.methods.insert(name.into(), Box::new(f));
        self
    }

    pub fn on_setup<F>(mut self, f: F) -> Self
    where
        F: FnMut(&[Value]) -> Result<(), ModuleError> + Send + 'static,
    {
        self.setup = Some(Box::new(f));
        self
    }

    pub fn on_teardown<F>(mut self, f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.teardown = Some(Box::new(f));
        self
    }

    /// Sorted method names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl WorkerModule for MethodTable {
    fn setup(&mut self, args: &[Value], _ctx: &mut CallContext<'_>) -> Result<(), ModuleError> {
        match self.setup.as_mut() {
            Some(setup) => setup(args),
            None => Ok(()),
        }
    }

    fn call(
        &mut self,
        method: &str,
        args: &[Value],
        ctx: &mut CallContext<'_>,
    ) -> Result<Value, ModuleError> {
        match self.methods.get_mut(method) {
            Some(f) => f(args, ctx),
            None => Err(ModuleError::with_kind(
                "TypeError",
                format!("{} is not a function", method),
            )),
        }
    }

    fn teardown(&mut self) {
        if let Some(teardown) = self.teardown.as_mut() {
            teardown();
        }
    }
}

type Factory = Box<dyn Fn() -> Box<dyn WorkerModule> + Send + Sync>;

/// Modules a worker binary can load, by name.
///
/// Every worker process builds its own registry, so module state is per
/// process and never shared.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, Factory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, M>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: WorkerModule + 'static,
    {
        self.factories
            .insert(name.into(), Box::new(move || Box::new(factory())));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    fn load(&self, name: &str) -> Option<Box<dyn WorkerModule>> {
        self.factories.get(name).map(|factory| factory())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

fn initialize(
    registry: &ModuleRegistry,
    module_path: &str,
    setup_args: &[Value],
    worker_id: usize,
    writer: &mut LineWriter,
) -> Result<Box<dyn WorkerModule>, RemoteError> {
    let mut module = registry.load(module_path).ok_or_else(|| {
        RemoteError::new(
            "ModuleNotFound",
            format!("Cannot find module '{}'", module_path),
        )
    })?;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut ctx = CallContext { worker_id, writer };
        module.setup(setup_args, &mut ctx)
    }));
    match outcome {
        Ok(Ok(())) => Ok(module),
        Ok(Err(e)) => Err(e.into()),
        Err(payload) => Err(RemoteError::new("Panic", panic_message(payload.as_ref()))),
    }
}

fn invoke(
    module: &mut dyn WorkerModule,
    method: &str,
    args: &[Value],
    worker_id: usize,
    writer: &mut LineWriter,
) -> ParentMessage {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut ctx = CallContext { worker_id, writer };
        module.call(method, args, &mut ctx)
    }));
    match outcome {
        Ok(Ok(result)) => ParentMessage::ok(result),
        Ok(Err(e)) => ParentMessage::ClientError(e.into()),
        Err(payload) => {
            ParentMessage::ClientError(RemoteError::new("Panic", panic_message(payload.as_ref())))
        }
    }
}

/// Serve requests until END or until the farm closes the channel.
pub fn serve(
    registry: &ModuleRegistry,
    worker_id: usize,
    reader: &mut LineReader,
    writer: &mut LineWriter,
) -> io::Result<()> {
    let mut module: Option<Box<dyn WorkerModule>> = None;

    loop {
        let line = match reader.read_line()? {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => line.to_string(),
            None => break,
        };

        let message = match ChildMessage::from_line(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "Ignoring unrecognized request");
                continue;
            }
        };

        let reply = match message {
            ChildMessage::Initialize {
                module_path,
                setup_args,
            } => match initialize(registry, &module_path, &setup_args, worker_id, writer) {
                Ok(loaded) => {
                    module = Some(loaded);
                    ParentMessage::ok(Value::Null)
                }
                Err(e) => ParentMessage::SetupError(e),
            },
            ChildMessage::Call { method, args } => match module.as_mut() {
                Some(module) => invoke(module.as_mut(), &method, &args, worker_id, writer),
                None => ParentMessage::ClientError(RemoteError::new(
                    "Error",
                    "Worker received a call before it was initialized",
                )),
            },
            ChildMessage::MemUsage => ParentMessage::MemUsage {
                rss_bytes: current_rss_bytes(),
            },
            ChildMessage::End => break,
        };
        writer.write_line(&reply.to_line()?)?;
    }

    if let Some(mut module) = module {
        module.teardown();
    }
    Ok(())
}

/// Run the worker subprocess main function.
///
/// Never returns: exits 0 after a clean END or channel close, 1 on I/O
/// failure, 2 when the process was not launched by a farm.
pub fn run_worker_main(registry: ModuleRegistry) -> ! {
    // Ignore SIGPIPE - a vanished parent surfaces as an io::Error instead.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    if std::env::var_os(IPC_FD_ENV).is_none() {
        eprintln!("Worker error: not started by a procfarm farm (missing {IPC_FD_ENV})");
        std::process::exit(2);
    }
    let worker_id = std::env::var(WORKER_ID_ENV)
        .ok()
        .and_then(|id| id.parse().ok())
        .unwrap_or(0);

    // SAFETY: the farm installs the protocol socket at IPC_FD before exec.
    let fd = unsafe { PipeFd::from_raw(IPC_FD) };
    let result = ipc::split(fd)
        .and_then(|(mut reader, mut writer)| serve(&registry, worker_id, &mut reader, &mut writer));

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}
