//! procfarm - fan named calls out across a fixed pool of worker processes.
//!
//! A [`Farm`] spawns `num_workers` child processes, each loading the same
//! module, and hands calls to them over a JSON-lines channel on fd 3. Calls
//! are assigned round-robin (or to the first idle worker, or by a sticky key),
//! retried on a fresh process when their worker dies, and the pool can be
//! shut down gracefully with a forced fallback.
//!
//! The child side is any binary that calls [`run_worker_main`] with a
//! [`ModuleRegistry`]; the `procfarm worker` subcommand serves the
//! [`builtin`] module this way.
//!
//! ```no_run
//! use procfarm::{Farm, FarmConfig, ForkOptions};
//! use serde_json::json;
//!
//! # async fn demo() -> procfarm::Result<()> {
//! let config = FarmConfig::new("builtin")
//!     .with_workers(4)
//!     .with_fork_options(ForkOptions::default().exec_path("/usr/bin/procfarm").arg("worker"));
//! let farm = Farm::new(config)?;
//!
//! let double = farm.proxy("double")?;
//! let four: i64 = double.call_as(vec![json!(2)]).await?;
//! assert_eq!(four, 4);
//!
//! farm.end().await?;
//! # Ok(())
//! # }
//! ```

pub mod builtin;
pub mod error;
pub mod farm;
pub mod logging;
pub mod memory;
pub mod stream;
pub mod worker;

pub use error::{FarmError, Result};
pub use farm::config::{FarmConfig, ForkOptions, SchedulingPolicy};
pub use farm::proxy::MethodProxy;
pub use farm::task::{CallOptions, PendingCall};
pub use farm::{Farm, PoolExitResult};
pub use memory::{MemoryLimit, MemorySize};
pub use stream::{OutputChunk, OutputStream};
pub use worker::{
    CallContext, MethodTable, ModuleError, ModuleRegistry, RemoteError, TerminationReason,
    WorkerModule, WorkerState, WorkerStatus, run_worker_main,
};
