//! The `builtin` module served by `procfarm worker`.
//!
//! Small diagnostic methods for exercising a farm from the command line,
//! integration tests and benchmarks.

use crate::worker::{CallContext, MethodTable, ModuleError, ModuleRegistry};
use serde_json::{Value, json};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

pub const MODULE_NAME: &str = "builtin";

/// Registry containing every module the `worker` subcommand can load.
pub fn registry() -> ModuleRegistry {
    ModuleRegistry::new().register(MODULE_NAME, module)
}

/// Names of the builtin methods, sorted.
pub const METHODS: &[&str] = &[
    "crash_once",
    "double",
    "echo",
    "exit",
    "fail",
    "pid",
    "print",
    "progress",
    "record_and_exit",
    "sleep",
    "worker_id",
];

pub fn module() -> MethodTable {
    MethodTable::new()
        .on_setup(setup)
        .method("echo", |args, _| Ok(args.first().cloned().unwrap_or(Value::Null)))
        .method("double", |args, _| double(args))
        .method("sleep", |args, _| {
            let ms = arg_u64(args, 0, "sleep")?;
            std::thread::sleep(Duration::from_millis(ms));
            Ok(json!(ms))
        })
        .method("fail", |args, _| {
            let message = args
                .first()
                .and_then(Value::as_str)
                .unwrap_or("failed on purpose");
            Err(ModuleError::new(message).with_extra(json!({ "args": args })))
        })
        .method("exit", |args, _| {
            let code = args.first().and_then(Value::as_i64).unwrap_or(1);
            std::process::exit(code as i32)
        })
        .method("pid", |_, _| Ok(json!(std::process::id())))
        .method("worker_id", |_, ctx| Ok(json!(ctx.worker_id())))
        .method("print", |args, _| {
            let text = arg_str(args, 0, "print")?;
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", text)
                .and_then(|_| stdout.flush())
                .map_err(|e| ModuleError::with_kind("IoError", e.to_string()))?;
            Ok(Value::Null)
        })
        .method("progress", progress)
        .method("crash_once", |args, _| {
            let marker = arg_str(args, 0, "crash_once")?;
            if Path::new(marker).exists() {
                return Ok(json!(std::process::id()));
            }
            append_line(marker, "crashed")?;
            std::process::exit(1)
        })
        .method("record_and_exit", |args, _| {
            let path = arg_str(args, 0, "record_and_exit")?;
            append_line(path, &std::process::id().to_string())?;
            std::process::exit(1)
        })
}

/// Setup fails on request: `[{"fail": "reason"}]`.
fn setup(args: &[Value]) -> Result<(), ModuleError> {
    match args.first().and_then(|a| a.get("fail")).and_then(Value::as_str) {
        Some(reason) => Err(ModuleError::new(reason)),
        None => Ok(()),
    }
}

fn double(args: &[Value]) -> Result<Value, ModuleError> {
    match args.first() {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => i
                .checked_mul(2)
                .map(|d| json!(d))
                .ok_or_else(|| ModuleError::with_kind("RangeError", "overflow")),
            None => Ok(json!(n.as_f64().unwrap_or(f64::NAN) * 2.0)),
        },
        other => Err(type_error("double", "a number", other)),
    }
}

/// Emit `{"step": i, "of": n}` for each step, then return `n`.
fn progress(args: &[Value], ctx: &mut CallContext<'_>) -> Result<Value, ModuleError> {
    let steps = arg_u64(args, 0, "progress")?;
    for step in 1..=steps {
        ctx.send_custom(json!({ "step": step, "of": steps }))
            .map_err(|e| ModuleError::with_kind("IoError", e.to_string()))?;
    }
    Ok(json!(steps))
}

fn append_line(path: &str, line: &str) -> Result<(), ModuleError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{}", line))
        .map_err(|e| ModuleError::with_kind("IoError", format!("{}: {}", path, e)))
}

fn arg_u64(args: &[Value], index: usize, method: &str) -> Result<u64, ModuleError> {
    let arg = args.get(index);
    arg.and_then(Value::as_u64)
        .ok_or_else(|| type_error(method, "a non-negative integer", arg))
}

fn arg_str<'a>(args: &'a [Value], index: usize, method: &str) -> Result<&'a str, ModuleError> {
    let arg = args.get(index);
    arg.and_then(Value::as_str)
        .ok_or_else(|| type_error(method, "a string", arg))
}

fn type_error(method: &str, expected: &str, got: Option<&Value>) -> ModuleError {
    let got = got.map_or_else(|| "nothing".to_string(), Value::to_string);
    ModuleError::with_kind(
        "TypeError",
        format!("{} expects {}, got {}", method, expected, got),
    )
}
