//! IPC protocol between the farm and its worker subprocesses.
//!
//! Messages are JSON-serialized and newline-delimited. Each worker has at most
//! one CALL outstanding, so responses carry no request id: they always answer
//! the oldest unanswered request.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// File descriptor number the IPC socket is installed at in the child.
pub const IPC_FD: i32 = 3;

/// Environment variable telling the child that fd [`IPC_FD`] carries the protocol.
pub const IPC_FD_ENV: &str = "PROCFARM_IPC_FD";

/// Environment variable carrying the 1-indexed slot id of the worker.
pub const WORKER_ID_ENV: &str = "PROCFARM_WORKER_ID";

/// Message from the farm to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildMessage {
    /// Load the target module and run its one-time setup.
    #[serde(rename = "initialize")]
    Initialize {
        module_path: String,
        #[serde(default)]
        setup_args: Vec<Value>,
    },

    /// Invoke one exposed method.
    #[serde(rename = "call")]
    Call {
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Report current resident memory.
    #[serde(rename = "mem_usage")]
    MemUsage,

    /// Run teardown and exit cleanly.
    #[serde(rename = "end")]
    End,
}

/// Message from a worker to the farm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParentMessage {
    /// The most recent INITIALIZE or CALL completed successfully.
    #[serde(rename = "ok")]
    Ok {
        #[serde(default)]
        result: Value,
    },

    /// The most recent CALL failed inside user code.
    #[serde(rename = "client_error")]
    ClientError(RemoteError),

    /// Module loading or setup failed; the worker cannot serve calls.
    #[serde(rename = "setup_error")]
    SetupError(RemoteError),

    /// Out-of-band payload emitted by module code during a call.
    #[serde(rename = "custom")]
    Custom { payload: Value },

    /// Answer to [`ChildMessage::MemUsage`].
    #[serde(rename = "mem_usage")]
    MemUsage { rss_bytes: u64 },
}

/// An error raised inside a worker, carried back as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error kind, e.g. `"TypeError"` or `"Panic"`.
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Extra structured properties attached to the error.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
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

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl ChildMessage {
    /// Create an initialization request.
    pub fn initialize(module_path: impl Into<String>, setup_args: Vec<Value>) -> Self {
        Self::Initialize {
            module_path: module_path.into(),
            setup_args,
        }
    }

    /// Create a call request.
    pub fn call(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Call {
            method: method.into(),
            args,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl ParentMessage {
    pub fn ok(result: Value) -> Self {
        Self::Ok { result }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_serialization() {
        let req = ChildMessage::call("double", vec![json!(21)]);
        let line = req.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"type\":\"call\""));

        match ChildMessage::from_line(&line).unwrap() {
            ChildMessage::Call { method, args } => {
                assert_eq!(method, "double");
                assert_eq!(args, vec![json!(21)]);
            }
            other => panic!("Expected Call variant, got {:?}", other),
        }
    }

    #[test]
    fn test_initialize_defaults_setup_args() {
        let parsed =
            ChildMessage::from_line(r#"{"type":"initialize","module_path":"builtin"}"#).unwrap();
        assert_eq!(parsed, ChildMessage::initialize("builtin", vec![]));
    }

    #[test]
    fn test_end_and_mem_usage_are_unit_variants() {
        let line = ChildMessage::End.to_line().unwrap();
        assert_eq!(line, "{\"type\":\"end\"}\n");
        assert_eq!(
            ChildMessage::from_line("{\"type\":\"mem_usage\"}").unwrap(),
            ChildMessage::MemUsage
        );
    }

    #[test]
    fn test_client_error_carries_fields() {
        let err = RemoteError::new("RandomCustomError", "bar")
            .with_stack("RandomCustomError: bar")
            .with_extra(json!({"qux": "extra property"}));
        let line = ParentMessage::ClientError(err.clone()).to_line().unwrap();

        match ParentMessage::from_line(&line).unwrap() {
            ParentMessage::ClientError(parsed) => {
                assert_eq!(parsed, err);
                assert_eq!(parsed.extra["qux"], "extra property");
            }
            other => panic!("Expected ClientError variant, got {:?}", other),
        }
    }

    #[test]
    fn test_remote_error_omits_empty_optionals() {
        let line = ParentMessage::SetupError(RemoteError::new("Error", "nope"))
            .to_line()
            .unwrap();
        assert!(!line.contains("stack"));
        assert!(!line.contains("extra"));
    }

    #[test]
    fn test_ok_without_result_is_null() {
        let parsed = ParentMessage::from_line(r#"{"type":"ok"}"#).unwrap();
        assert_eq!(parsed, ParentMessage::ok(Value::Null));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert!(ParentMessage::from_line(r#"{"type":"twenty-seven"}"#).is_err());
        assert!(ParentMessage::from_line("true").is_err());
        assert!(ParentMessage::from_line("").is_err());
    }
}
