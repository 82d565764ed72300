//! procfarm - parallel calls over a pool of worker processes.

mod cli;
mod output;
mod theme;

use anyhow::{Context, Result, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use procfarm::logging::{self, LogConfig};
use procfarm::{
    CallOptions, Farm, FarmConfig, ForkOptions, OutputStream, builtin, run_worker_main,
};
use serde_json::Value;
use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use cli::{Cli, Commands, RunArgs};
use output::{CallReport, RunReport};
use theme::Themed;

/// How long to wait for worker output to drain after the pool has ended.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        theme::disable_colors();
    }

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::Worker => cmd_worker(),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Child side of a farm: serve the builtin module on fd 3.
fn cmd_worker() -> ! {
    logging::init(LogConfig::for_worker().with_env_overrides());
    run_worker_main(builtin::registry())
}

fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    logging::init(LogConfig::for_cli(cli.verbose).with_env_overrides());

    let inputs = if args.inputs.is_empty() {
        read_stdin_inputs()?
    } else {
        args.inputs
            .iter()
            .enumerate()
            .map(|(i, raw)| parse_input(i, raw))
            .collect::<Result<Vec<_>>>()?
    };

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let report = rt.block_on(run_farm(args, inputs))?;

    output::print_report(&report, args.format.into(), args.table_options());

    if report.force_exited {
        eprintln!(
            "{}",
            "Some workers had to be killed during shutdown".warning()
        );
    }
    let failures = report.failures();
    if failures > 0 {
        bail!("{} of {} calls failed", failures, report.calls.len());
    }
    Ok(())
}

fn read_stdin_inputs() -> Result<Vec<Vec<Value>>> {
    let stdin = std::io::stdin();
    let mut inputs = Vec::new();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read inputs from stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        inputs.push(parse_input(inputs.len(), &line)?);
    }
    Ok(inputs)
}

/// One call's arguments: an array is spread, anything else is a single argument.
fn parse_input(index: usize, raw: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(raw)
        .with_context(|| format!("Input {} is not valid JSON: {}", index + 1, raw))?;
    Ok(match value {
        Value::Array(args) => args,
        other => vec![other],
    })
}

fn farm_config(args: &RunArgs) -> Result<FarmConfig> {
    let exe = std::env::current_exe().context("Failed to locate the procfarm binary")?;

    let mut config = FarmConfig::new(builtin::MODULE_NAME)
        .with_methods(builtin::METHODS.iter().copied())
        .with_workers(args.workers)
        .with_max_retries(args.max_retries)
        .with_scheduling(args.scheduling.into())
        .with_fork_options(ForkOptions::default().exec_path(exe).arg("worker"));

    if args.sticky {
        config = config.with_worker_key(|_, call_args| call_args.first().map(Value::to_string));
    }
    if let Some(limit) = args.idle_memory_limit {
        config = config.with_idle_memory_limit(limit);
    }
    if let Some(ms) = args.shutdown_grace_ms {
        config = config.with_shutdown_grace(Duration::from_millis(ms));
    }
    Ok(config)
}

async fn run_farm(args: &RunArgs, inputs: Vec<Vec<Value>>) -> Result<RunReport> {
    let mut farm = Farm::new(farm_config(args)?)?;
    let forwarders = [
        farm.take_stdout().map(forward_output),
        farm.take_stderr().map(forward_output),
    ];

    // The pool is ended whether or not the calls went through.
    let outcome = dispatch_all(&farm, args, inputs).await;
    let exit = farm.end().await?;

    for handle in forwarders.into_iter().flatten() {
        let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, handle).await;
    }

    let (calls, workers) = outcome?;
    Ok(RunReport {
        calls,
        workers,
        force_exited: exit.force_exited,
    })
}

type Dispatched = (Vec<CallReport>, Option<Vec<procfarm::WorkerStatus>>);

async fn dispatch_all(farm: &Farm, args: &RunArgs, inputs: Vec<Vec<Value>>) -> Result<Dispatched> {
    farm.start().await.context("Workers failed to start")?;

    let mut running = Vec::with_capacity(inputs.len());
    for (index, call_args) in inputs.into_iter().enumerate() {
        let worker = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&worker);
        let options = CallOptions::new().on_start(move |id| seen.store(id, Ordering::Relaxed));

        let started = Instant::now();
        let call = farm.call_with(&args.method, call_args.clone(), options)?;
        let handle = tokio::spawn(async move {
            let outcome = call.await;
            (outcome, started.elapsed())
        });
        running.push((index, call_args, worker, handle));
    }

    let mut calls = Vec::with_capacity(running.len());
    for (index, call_args, worker, handle) in running {
        let (outcome, elapsed) = handle.await.context("Call task panicked")?;
        let worker_id = match worker.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        };
        tracing::debug!(index, ?worker_id, ok = outcome.is_ok(), "Call settled");
        calls.push(CallReport::new(index, call_args, worker_id, elapsed, outcome));
    }

    let workers = if args.stats {
        Some(farm.workers().await?)
    } else {
        None
    };
    Ok((calls, workers))
}

/// Copy merged worker output to our stderr, leaving stdout for results.
fn forward_output(mut stream: OutputStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stderr = tokio::io::stderr();
        while let Some(chunk) = stream.recv().await {
            if stderr.write_all(&chunk.data).await.is_err() {
                break;
            }
        }
        let _ = stderr.flush().await;
    })
}
