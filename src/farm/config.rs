//! Farm construction parameters.

use crate::error::{FarmError, Result};
use crate::memory::MemoryLimit;
use serde_json::Value;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default retry budget per call.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How long `end()` waits for a worker before terminating it.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Largest accepted retry budget. Spawn failures are retried synchronously
/// by the controller, so the budget has to stay finite.
pub const MAX_RETRIES_LIMIT: u32 = 1000;

/// Delay between SIGTERM and SIGKILL when a worker is terminated.
pub const SIGKILL_DELAY: Duration = Duration::from_millis(500);

/// Method names that would shadow the farm's own operations.
pub const RESERVED_METHODS: &[&str] = &["start", "end", "get_stdout", "get_stderr", "workers"];

/// Computes the sticky routing key for a call, if any.
pub type WorkerKeyFn = Arc<dyn Fn(&str, &[Value]) -> Option<String> + Send + Sync>;

/// How unkeyed calls are assigned to workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// Rotate through slots, queueing on busy workers.
    #[default]
    RoundRobin,
    /// Lowest-index idle worker; wait in a shared queue when none is idle.
    InOrder,
}

impl std::str::FromStr for SchedulingPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round-robin" | "roundrobin" | "rr" => Ok(Self::RoundRobin),
            "in-order" | "inorder" => Ok(Self::InOrder),
            _ => Err(format!("Invalid scheduling policy: {}", s)),
        }
    }
}

impl std::fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round-robin"),
            Self::InOrder => write!(f, "in-order"),
        }
    }
}

/// How worker processes are launched.
#[derive(Debug, Clone)]
pub struct ForkOptions {
    /// Worker executable. Defaults to the current executable.
    pub exec_path: Option<PathBuf>,
    /// Arguments passed to the worker executable.
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: HashMap<OsString, OsString>,
    /// Start from the parent's environment (true) or an empty one.
    pub inherit_env: bool,
    /// Pipe child stdout/stderr into the farm's aggregated streams (true) or
    /// let the children write to the parent's stdio directly.
    pub silent: bool,
}

impl Default for ForkOptions {
    fn default() -> Self {
        Self {
            exec_path: None,
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            inherit_env: true,
            silent: true,
        }
    }
}

impl ForkOptions {
    pub fn exec_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.exec_path = Some(path.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }
}

/// Configuration for a [`Farm`](crate::Farm).
#[derive(Clone)]
pub struct FarmConfig {
    /// Name of the module each worker loads from its registry.
    pub module_path: String,
    /// Methods callable through the farm. Empty means any method.
    pub exposed_methods: Vec<String>,
    pub num_workers: usize,
    pub max_retries: u32,
    pub scheduling: SchedulingPolicy,
    pub compute_worker_key: Option<WorkerKeyFn>,
    pub fork_options: ForkOptions,
    /// Arguments handed to the module's setup in every worker.
    pub setup_args: Vec<Value>,
    pub shutdown_grace: Duration,
    pub idle_memory_limit: Option<MemoryLimit>,
}

impl std::fmt::Debug for FarmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FarmConfig")
            .field("module_path", &self.module_path)
            .field("exposed_methods", &self.exposed_methods)
            .field("num_workers", &self.num_workers)
            .field("max_retries", &self.max_retries)
            .field("scheduling", &self.scheduling)
            .field("sticky", &self.compute_worker_key.is_some())
            .field("fork_options", &self.fork_options)
            .field("setup_args", &self.setup_args)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("idle_memory_limit", &self.idle_memory_limit)
            .finish()
    }
}

/// Host parallelism, the default worker count.
pub fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl FarmConfig {
    pub fn new(module_path: impl Into<String>) -> Self {
        Self {
            module_path: module_path.into(),
            exposed_methods: Vec::new(),
            num_workers: default_num_workers(),
            max_retries: DEFAULT_MAX_RETRIES,
            scheduling: SchedulingPolicy::default(),
            compute_worker_key: None,
            fork_options: ForkOptions::default(),
            setup_args: Vec::new(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            idle_memory_limit: None,
        }
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exposed_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_scheduling(mut self, policy: SchedulingPolicy) -> Self {
        self.scheduling = policy;
        self
    }

    /// Route calls with the same key to the same worker.
    pub fn with_worker_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Option<String> + Send + Sync + 'static,
    {
        self.compute_worker_key = Some(Arc::new(f));
        self
    }

    pub fn with_fork_options(mut self, options: ForkOptions) -> Self {
        self.fork_options = options;
        self
    }

    pub fn with_setup_args(mut self, args: Vec<Value>) -> Self {
        self.setup_args = args;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_idle_memory_limit(mut self, limit: MemoryLimit) -> Self {
        self.idle_memory_limit = Some(limit);
        self
    }

    /// Apply `PROCFARM_*` environment overrides.
    ///
    /// Unset or unparsable variables leave the current value in place.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("PROCFARM_WORKERS") {
            self.num_workers = n;
        }
        if let Some(n) = env_parse::<u32>("PROCFARM_MAX_RETRIES") {
            self.max_retries = n;
        }
        if let Some(ms) = env_parse::<u64>("PROCFARM_SHUTDOWN_GRACE_MS") {
            self.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(limit) = env_parse::<MemoryLimit>("PROCFARM_IDLE_MEMORY_LIMIT") {
            self.idle_memory_limit = Some(limit);
        }
        self
    }

    /// Check the configuration and normalize the exposed method list.
    ///
    /// Methods starting with `_` are private and dropped from the list.
    pub fn validate(mut self) -> Result<Self> {
        if self.num_workers == 0 {
            return Err(FarmError::Config("num_workers must be at least 1".into()));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(FarmError::Config(format!(
                "max_retries must be at most {}",
                MAX_RETRIES_LIMIT
            )));
        }
        if self.module_path.trim().is_empty() {
            return Err(FarmError::Config("module_path must not be empty".into()));
        }
        if let Some(reserved) = self
            .exposed_methods
            .iter()
            .find(|m| RESERVED_METHODS.contains(&m.as_str()))
        {
            return Err(FarmError::ReservedMethod(reserved.clone()));
        }
        self.exposed_methods.retain(|m| !m.starts_with('_'));
        Ok(self)
    }

    /// Whether `method` may be called through this farm.
    pub fn exposes(&self, method: &str) -> bool {
        if method.starts_with('_') {
            return false;
        }
        self.exposed_methods.is_empty() || self.exposed_methods.iter().any(|m| m == method)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySize;
    use serde_json::json;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = FarmConfig::new("builtin");
        assert_eq!(config.max_retries, 3);
        assert!(config.num_workers >= 1);
        assert_eq!(config.scheduling, SchedulingPolicy::RoundRobin);
        assert_eq!(config.shutdown_grace, Duration::from_millis(500));
        assert!(config.fork_options.silent);
        assert!(config.fork_options.inherit_env);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let err = FarmConfig::new("builtin")
            .with_workers(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, FarmError::Config(_)));
    }

    #[test]
    fn test_validate_bounds_max_retries() {
        assert!(
            FarmConfig::new("builtin")
                .with_max_retries(MAX_RETRIES_LIMIT)
                .validate()
                .is_ok()
        );
        let err = FarmConfig::new("builtin")
            .with_max_retries(u32::MAX)
            .validate()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid farm configuration: max_retries must be at most 1000"
        );
    }

    #[test]
    fn test_validate_rejects_empty_module() {
        assert!(FarmConfig::new("  ").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_reserved_method() {
        let err = FarmConfig::new("builtin")
            .with_methods(["double", "end"])
            .validate()
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot define a method called 'end'");
    }

    #[test]
    fn test_private_methods_are_dropped() {
        let config = FarmConfig::new("builtin")
            .with_methods(["double", "_internal"])
            .validate()
            .unwrap();
        assert_eq!(config.exposed_methods, vec!["double".to_string()]);
        assert!(config.exposes("double"));
        assert!(!config.exposes("_internal"));
        assert!(!config.exposes("echo"));
    }

    #[test]
    fn test_empty_method_list_exposes_everything_public() {
        let config = FarmConfig::new("builtin");
        assert!(config.exposes("anything"));
        assert!(!config.exposes("_hidden"));
    }

    #[test]
    fn test_worker_key_fn() {
        let config = FarmConfig::new("builtin")
            .with_worker_key(|method, args| Some(format!("{}:{}", method, args[0])));
        let key_fn = config.compute_worker_key.unwrap();
        assert_eq!(key_fn("pid", &[json!("a")]).as_deref(), Some("pid:\"a\""));
    }

    #[test]
    fn test_scheduling_policy_parse() {
        assert_eq!(
            "round-robin".parse::<SchedulingPolicy>().unwrap(),
            SchedulingPolicy::RoundRobin
        );
        assert_eq!(
            "IN-ORDER".parse::<SchedulingPolicy>().unwrap(),
            SchedulingPolicy::InOrder
        );
        assert!("random".parse::<SchedulingPolicy>().is_err());
        assert_eq!(SchedulingPolicy::InOrder.to_string(), "in-order");
    }

    #[test]
    fn test_fork_options_builder() {
        let options = ForkOptions::default()
            .exec_path("/bin/worker")
            .arg("worker")
            .env("A", "1")
            .silent(false);
        assert_eq!(options.exec_path, Some(PathBuf::from("/bin/worker")));
        assert_eq!(options.args, vec![OsString::from("worker")]);
        assert_eq!(options.env.get(&OsString::from("A")), Some(&OsString::from("1")));
        assert!(!options.silent);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        unsafe {
            std::env::set_var("PROCFARM_WORKERS", "7");
            std::env::set_var("PROCFARM_MAX_RETRIES", "1");
            std::env::set_var("PROCFARM_SHUTDOWN_GRACE_MS", "250");
            std::env::set_var("PROCFARM_IDLE_MEMORY_LIMIT", "64M");
        }

        let config = FarmConfig::new("builtin").with_env_overrides();

        unsafe {
            std::env::remove_var("PROCFARM_WORKERS");
            std::env::remove_var("PROCFARM_MAX_RETRIES");
            std::env::remove_var("PROCFARM_SHUTDOWN_GRACE_MS");
            std::env::remove_var("PROCFARM_IDLE_MEMORY_LIMIT");
        }

        assert_eq!(config.num_workers, 7);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.shutdown_grace, Duration::from_millis(250));
        assert_eq!(
            config.idle_memory_limit,
            Some(MemoryLimit::Absolute(MemorySize::from_mib(64)))
        );
    }

    #[test]
    #[serial]
    fn test_env_override_ignores_garbage() {
        unsafe {
            std::env::set_var("PROCFARM_WORKERS", "many");
        }
        let config = FarmConfig::new("builtin").with_workers(2).with_env_overrides();
        unsafe {
            std::env::remove_var("PROCFARM_WORKERS");
        }
        assert_eq!(config.num_workers, 2);
    }
}
