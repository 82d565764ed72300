//! Worker processes: wire protocol, spawning, supervision and the child runtime.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────┐
//!                 │   Farm controller    │
//!                 │ (single tokio task)  │
//!                 └──────────┬───────────┘
//!                            │ fd 3 (JSON lines)
//!            ┌───────────────┼───────────────┐
//!            │               │               │
//!      ┌─────▼─────┐   ┌─────▼─────┐   ┌─────▼─────┐
//!      │ Worker 1  │   │ Worker 2  │   │ Worker N  │
//!      │ (process) │   │ (process) │   │ (process) │
//!      └─────┬─────┘   └─────┬─────┘   └─────┬─────┘
//!            └─── stdout/stderr ─▶ StreamAggregator
//! ```
//!
//! Each process has its own memory space and module registry. A crashed
//! process is replaced in the same slot.

pub mod ipc;
pub(crate) mod pool;
pub(crate) mod proc;
pub mod protocol;
pub mod signals;
pub(crate) mod spawn;
pub mod state;
pub mod worker_main;

pub use protocol::{ChildMessage, ParentMessage, RemoteError};
pub use signals::TerminationReason;
pub use state::{WorkerState, WorkerStatus};
pub use worker_main::{
    CallContext, MethodTable, ModuleError, ModuleRegistry, WorkerModule, run_worker_main,
};

/// Something that happened to the process in slot `index`.
#[derive(Debug)]
pub(crate) struct WorkerEvent {
    /// 0-based slot index.
    pub index: usize,
    /// Process generation the event belongs to.
    pub generation: u64,
    pub kind: WorkerEventKind,
}

#[derive(Debug)]
pub(crate) enum WorkerEventKind {
    Message(ParentMessage),
    Exited(TerminationReason),
}
