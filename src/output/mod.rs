//! Output formatting for `procfarm run`.

pub mod json;
pub mod plain;
pub mod table;

use procfarm::{FarmError, WorkerStatus};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// Output format options.
#[derive(Debug, Clone, Copy, Default)]
pub enum OutputFormat {
    /// Colored table output (default).
    #[default]
    Table,
    /// JSON output.
    Json,
    /// One result per line, no colors.
    Plain,
}

/// Table display options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableOptions {
    /// Use ASCII borders instead of Unicode.
    pub ascii: bool,
}

/// The outcome of one call.
#[derive(Debug, Clone, Serialize)]
pub struct CallReport {
    /// Position in the input.
    pub index: usize,
    pub args: Vec<Value>,
    /// Worker that last picked the call up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallReport {
    pub fn new(
        index: usize,
        args: Vec<Value>,
        worker_id: Option<usize>,
        elapsed: Duration,
        outcome: Result<Value, FarmError>,
    ) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Self {
            index,
            args,
            worker_id,
            elapsed_ms: elapsed.as_millis() as u64,
            result,
            error,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything `run` prints.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub calls: Vec<CallReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<Vec<WorkerStatus>>,
    pub force_exited: bool,
}

impl RunReport {
    pub fn failures(&self) -> usize {
        self.calls.iter().filter(|c| !c.is_ok()).count()
    }
}

pub fn print_report(report: &RunReport, format: OutputFormat, options: TableOptions) {
    match format {
        OutputFormat::Table => table::print_table(report, options),
        OutputFormat::Json => json::print_json(report),
        OutputFormat::Plain => plain::print_plain(report),
    }
}

/// Compact JSON for a cell or a line.
fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}
