//! A single call travelling through the farm.

use crate::error::{FarmError, Result};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

type StartHook = Box<dyn FnMut(usize) + Send>;

/// Per-call hooks.
#[derive(Default)]
pub struct CallOptions {
    pub(crate) messages: Option<mpsc::UnboundedSender<Value>>,
    pub(crate) on_start: Option<StartHook>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive custom payloads the worker emits while running this call.
    pub fn with_messages(mut self, tx: mpsc::UnboundedSender<Value>) -> Self {
        self.messages = Some(tx);
        self
    }

    /// Called with the 1-indexed worker id each time the call is dispatched,
    /// including re-dispatch after a crash.
    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: FnMut(usize) + Send + 'static,
    {
        self.on_start = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("messages", &self.messages.is_some())
            .field("on_start", &self.on_start.is_some())
            .finish()
    }
}

/// A pending call owned by the controller.
///
/// Resolving consumes the task, so the caller hears back exactly once.
pub(crate) struct Task {
    pub method: String,
    pub args: Vec<Value>,
    /// Number of attempts lost to worker exits.
    pub retries: u32,
    pub key: Option<String>,
    reply: oneshot::Sender<Result<Value>>,
    options: CallOptions,
}

impl Task {
    pub fn new(
        method: String,
        args: Vec<Value>,
        key: Option<String>,
        options: CallOptions,
    ) -> (Self, PendingCall) {
        let (reply, rx) = oneshot::channel();
        let task = Self {
            method,
            args,
            retries: 0,
            key,
            reply,
            options,
        };
        (task, PendingCall { rx })
    }

    /// Notify the caller that worker `worker_id` picked the task up.
    pub fn started(&mut self, worker_id: usize) {
        if let Some(hook) = self.options.on_start.as_mut() {
            hook(worker_id);
        }
    }

    /// Forward a custom payload to the caller, if it asked for them.
    pub fn forward_message(&self, payload: Value) {
        if let Some(tx) = &self.options.messages {
            let _ = tx.send(payload);
        }
    }

    pub fn resolve(self, result: Result<Value>) {
        // The caller may have dropped its PendingCall.
        let _ = self.reply.send(result);
    }

    pub fn reject(self, err: FarmError) {
        self.resolve(Err(err));
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("method", &self.method)
            .field("retries", &self.retries)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// The caller's side of a call. Resolves to the worker's result.
#[derive(Debug)]
#[must_use = "a PendingCall does nothing unless awaited"]
pub struct PendingCall {
    rx: oneshot::Receiver<Result<Value>>,
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(FarmError::Disconnected)))
    }
}
