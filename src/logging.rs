//! Logging setup shared by the CLI and by worker children.
//!
//! Everything goes to stderr (and optionally a file). A worker's stdout is
//! the module's own output and is collected by the parent, so logs never go
//! there.
//!
//! # Environment Variables
//!
//! - `PROCFARM_LOG` - Log filter (overrides RUST_LOG)
//! - `PROCFARM_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `PROCFARM_LOG_FORMAT` - Output format: pretty, compact, json
//! - `PROCFARM_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Worker children inherit the parent's environment by default, so setting
//! these once configures both sides.
//!
//! ```no_run
//! use procfarm::logging::{LogConfig, init};
//!
//! init(LogConfig::for_cli(1).with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line human readable output.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Newline-delimited JSON.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Rotation of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
///
/// Build one with the presets or `with_*` methods, then pass it to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level, used when no filter is set.
    pub level: Level,
    pub format: LogFormat,
    /// Also write to this file.
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Log span close events with timing.
    pub span_events: bool,
    /// An `EnvFilter` directive string; overrides `level`.
    pub filter: Option<String>,
    pub show_target: bool,
    pub show_thread_ids: bool,
    pub show_line_numbers: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            span_events: false,
            filter: None,
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for the command line: `-v` for info, `-vv` for debug, `-vvv` for trace.
    pub fn for_cli(verbosity: u8) -> Self {
        let level = match verbosity {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        Self::default().with_level(level)
    }

    /// Preset for worker children: compact lines tagged with the thread id,
    /// so interleaved output from several workers stays readable.
    pub fn for_worker() -> Self {
        Self {
            format: LogFormat::Compact,
            show_thread_ids: true,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment overrides.
    ///
    /// `PROCFARM_LOG` then `RUST_LOG` set the filter, and `PROCFARM_LOG_LEVEL`
    /// the level, but only when no filter was given explicitly.
    /// `PROCFARM_LOG_FORMAT` and `PROCFARM_LOG_FILE` always apply.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("PROCFARM_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level) = std::env::var("PROCFARM_LOG_LEVEL")
        {
            self.level = parse_level(&level).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("PROCFARM_LOG_FORMAT")
            && let Ok(format) = format.parse()
        {
            self.format = format;
        }

        if let Ok(path) = std::env::var("PROCFARM_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// One fmt layer in the configured format, writing to `writer`.
    fn layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
    {
        let base = fmt::layer()
            .with_span_events(self.span_events())
            .with_target(self.show_target)
            .with_ansi(ansi)
            .with_writer(writer);

        match self.format {
            LogFormat::Json => base.json().boxed(),
            LogFormat::Compact => base
                .compact()
                .with_thread_ids(self.show_thread_ids)
                .with_line_number(self.show_line_numbers)
                .boxed(),
            LogFormat::Pretty => base
                .with_thread_ids(self.show_thread_ids)
                .with_line_number(self.show_line_numbers)
                .boxed(),
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Install the global subscriber. Later calls are ignored.
///
/// Writes to stderr, and to `config.file_path` as well when it is set.
pub fn init(config: LogConfig) {
    let mut layers = vec![config.layer(std::io::stderr, true)];
    if let Some(path) = &config.file_path {
        layers.push(config.layer(file_appender(path, config.rotation), false));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}

fn file_appender(path: &Path, rotation: LogRotation) -> RollingFileAppender {
    let parent = path.parent().unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("procfarm.log");
    RollingFileAppender::new(rotation.into(), parent, file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_log_rotation_from_str() {
        assert_eq!(
            "hourly".parse::<LogRotation>().unwrap(),
            LogRotation::Hourly
        );
        assert_eq!("never".parse::<LogRotation>().unwrap(), LogRotation::Never);
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_cli_verbosity_levels() {
        assert_eq!(LogConfig::for_cli(0).level, Level::WARN);
        assert_eq!(LogConfig::for_cli(1).level, Level::INFO);
        assert_eq!(LogConfig::for_cli(2).level, Level::DEBUG);
        assert_eq!(LogConfig::for_cli(9).level, Level::TRACE);
    }

    #[test]
    fn test_worker_preset() {
        let config = LogConfig::for_worker();
        assert_eq!(config.format, LogFormat::Compact);
        assert!(config.show_thread_ids);
        assert!(config.file_path.is_none());
    }

    #[test]
    #[serial(env)]
    fn test_env_overrides() {
        unsafe {
            std::env::set_var("PROCFARM_LOG", "procfarm=debug");
            std::env::set_var("PROCFARM_LOG_FORMAT", "json");
            std::env::set_var("PROCFARM_LOG_FILE", "/tmp/procfarm-test.log");
        }

        let config = LogConfig::new().with_env_overrides();
        assert_eq!(config.filter.as_deref(), Some("procfarm=debug"));
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(
            config.file_path,
            Some(PathBuf::from("/tmp/procfarm-test.log"))
        );

        // An explicit filter wins.
        let config = LogConfig::new()
            .with_filter("warn".into())
            .with_env_overrides();
        assert_eq!(config.filter.as_deref(), Some("warn"));

        unsafe {
            std::env::remove_var("PROCFARM_LOG");
            std::env::remove_var("PROCFARM_LOG_FORMAT");
            std::env::remove_var("PROCFARM_LOG_FILE");
        }
    }

    #[test]
    #[serial(env)]
    fn test_level_env_ignored_when_filter_set() {
        unsafe {
            std::env::remove_var("PROCFARM_LOG");
            std::env::remove_var("RUST_LOG");
            std::env::set_var("PROCFARM_LOG_LEVEL", "trace");
        }
        assert_eq!(LogConfig::new().with_env_overrides().level, Level::TRACE);
        assert_eq!(
            LogConfig::new()
                .with_filter("info".into())
                .with_env_overrides()
                .level,
            Level::WARN
        );
        unsafe {
            std::env::remove_var("PROCFARM_LOG_LEVEL");
        }
    }
}
