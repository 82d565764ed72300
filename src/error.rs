//! Error types for procfarm.

use crate::worker::protocol::RemoteError;
use thiserror::Error;

/// Main error type for procfarm.
#[derive(Error, Debug)]
pub enum FarmError {
    /// The target function failed inside the worker. The worker stays healthy.
    #[error("{0}")]
    Client(RemoteError),

    /// The worker could not load its module or run one-time setup.
    #[error("Error when calling setup: {}", .0.message)]
    Setup(RemoteError),

    #[error(
        "Worker {worker_id} exited ({reason}) and call retries were exceeded after {attempts} attempts"
    )]
    WorkerExited {
        worker_id: usize,
        attempts: u32,
        reason: String,
    },

    #[error("Farm is ended, no more calls can be done to it")]
    Ended,

    #[error("Worker slot {worker_id} failed fatally: {message}")]
    PoolFatal { worker_id: usize, message: String },

    #[error("Method '{0}' is not exposed by this farm")]
    UnknownMethod(String),

    #[error("Cannot define a method called '{0}'")]
    ReservedMethod(String),

    #[error("Invalid farm configuration: {0}")]
    Config(String),

    #[error("Failed to spawn worker {worker_id}: {message}")]
    Spawn { worker_id: usize, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Farm controller is no longer running")]
    Disconnected,
}

impl FarmError {
    /// Whether the call failed inside user code (as opposed to the farm).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Client(_))
    }

    /// Whether the call was abandoned after its workers kept exiting.
    pub fn is_worker_exited(&self) -> bool {
        matches!(self, Self::WorkerExited { .. })
    }

    /// The error reported by the worker, for client and setup errors.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Client(remote) | Self::Setup(remote) => Some(remote),
            _ => None,
        }
    }
}

/// Result type alias for procfarm operations.
pub type Result<T> = std::result::Result<T, FarmError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_client_error_displays_remote_kind_and_message() {
        let err = FarmError::Client(RemoteError::new("TypeError", "boom"));
        assert_eq!(err.to_string(), "TypeError: boom");
        assert!(err.is_client_error());
        assert_eq!(err.remote().map(|r| r.message.as_str()), Some("boom"));
    }

    #[test]
    fn test_setup_error_message() {
        let err = FarmError::Setup(RemoteError::new("ModuleNotFound", "no module 'x'"));
        let msg = err.to_string();
        assert!(msg.starts_with("Error when calling setup"));
        assert!(msg.contains("no module 'x'"));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_worker_exited_message() {
        let err = FarmError::WorkerExited {
            worker_id: 1,
            attempts: 3,
            reason: "exited with code 1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("retries were exceeded"));
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("exited with code 1"));
        assert!(err.is_worker_exited());
        assert!(err.remote().is_none());
    }

    #[test]
    fn test_ended_message() {
        let msg = FarmError::Ended.to_string();
        assert!(msg.contains("Farm is ended"));
    }

    #[test]
    fn test_reserved_method_message() {
        let err = FarmError::ReservedMethod("end".to_string());
        assert_eq!(err.to_string(), "Cannot define a method called 'end'");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "no such binary");
        let err: FarmError = io_err.into();
        assert!(err.to_string().contains("no such binary"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: FarmError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_err() -> Result<i32> {
            Err(FarmError::Disconnected)
        }
        assert!(returns_err().is_err());
    }
}
