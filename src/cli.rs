//! Command-line interface definitions using clap.

use crate::output::{OutputFormat, TableOptions};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use procfarm::SchedulingPolicy;
use procfarm::farm::config::{DEFAULT_MAX_RETRIES, default_num_workers};
use procfarm::memory::MemoryLimit;

/// Fan calls out across a pool of supervised worker processes.
#[derive(Parser, Debug)]
#[command(name = "procfarm")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Call a builtin method once per input across a worker pool.
    Run(RunArgs),

    /// Serve the builtin module as a farm worker (used internally).
    #[command(hide = true)]
    Worker,

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "procfarm",
            &mut std::io::stdout(),
        );
    }
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Method of the builtin module to call.
    pub method: String,

    /// One input per call, as JSON. An array is spread into positional
    /// arguments; anything else is passed as the single argument. Read one
    /// input per line from stdin when none are given.
    pub inputs: Vec<String>,

    /// Number of worker processes.
    #[arg(short = 'w', long, env = "PROCFARM_WORKERS", default_value_t = default_num_workers())]
    pub workers: usize,

    /// Times a call is retried after its worker dies.
    #[arg(long, env = "PROCFARM_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// How calls are assigned to workers.
    #[arg(long, value_enum, default_value_t = SchedulingArg::RoundRobin)]
    pub scheduling: SchedulingArg,

    /// Route calls with equal first arguments to the same worker.
    #[arg(long)]
    pub sticky: bool,

    /// Recycle idle workers whose memory exceeds this (e.g. 512M, or 0.25 of system memory).
    #[arg(long, env = "PROCFARM_IDLE_MEMORY_LIMIT")]
    pub idle_memory_limit: Option<MemoryLimit>,

    /// Milliseconds workers get to exit after the last call.
    #[arg(long, env = "PROCFARM_SHUTDOWN_GRACE_MS")]
    pub shutdown_grace_ms: Option<u64>,

    /// Show worker status after the run.
    #[arg(long)]
    pub stats: bool,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormatArg::Table)]
    pub format: OutputFormatArg,

    /// Use ASCII table borders instead of Unicode.
    #[arg(long)]
    pub ascii: bool,
}

impl RunArgs {
    pub fn table_options(&self) -> TableOptions {
        TableOptions { ascii: self.ascii }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchedulingArg {
    /// Rotate through workers.
    #[default]
    RoundRobin,
    /// Lowest-numbered idle worker first.
    InOrder,
}

impl From<SchedulingArg> for SchedulingPolicy {
    fn from(arg: SchedulingArg) -> Self {
        match arg {
            SchedulingArg::RoundRobin => SchedulingPolicy::RoundRobin,
            SchedulingArg::InOrder => SchedulingPolicy::InOrder,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormatArg {
    /// Colored table output.
    #[default]
    Table,
    /// JSON output.
    Json,
    /// One result per line.
    Plain,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Table => OutputFormat::Table,
            OutputFormatArg::Json => OutputFormat::Json,
            OutputFormatArg::Plain => OutputFormat::Plain,
        }
    }
}
