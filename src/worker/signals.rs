//! Exit analysis for worker subprocesses.

use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Stack overflow (SIGSEGV on Linux, SIGBUS on macOS).
    StackOverflow(Signal),
    /// The IPC channel broke but the process could not be reaped.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Exit code, if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// Terminating signal, if any.
    pub fn signal(&self) -> Option<Signal> {
        match self {
            Self::Signaled(sig) | Self::StackOverflow(sig) => Some(*sig),
            _ => None,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {}", sig),
            Self::StackOverflow(sig) => format!("stack overflow ({})", sig),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Classify a reaped child's exit status.
pub fn analyze_exit_status(status: ExitStatus) -> TerminationReason {
    if let Some(code) = status.code() {
        return TerminationReason::Exited(code);
    }
    match status.signal().map(Signal::try_from) {
        Some(Ok(sig @ (Signal::SIGSEGV | Signal::SIGBUS))) => TerminationReason::StackOverflow(sig),
        Some(Ok(sig)) => TerminationReason::Signaled(sig),
        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn signaled(sig: Signal) -> ExitStatus {
        ExitStatus::from_raw(sig as i32)
    }

    #[test]
    fn test_normal_exit() {
        assert_eq!(analyze_exit_status(exited(0)), TerminationReason::Exited(0));
        assert!(analyze_exit_status(exited(0)).is_success());

        let reason = analyze_exit_status(exited(1));
        assert_eq!(reason.code(), Some(1));
        assert!(!reason.is_success());
        assert_eq!(reason.signal(), None);
    }

    #[test]
    fn test_signal_exit() {
        let reason = analyze_exit_status(signaled(Signal::SIGKILL));
        assert_eq!(reason, TerminationReason::Signaled(Signal::SIGKILL));
        assert_eq!(reason.signal(), Some(Signal::SIGKILL));
        assert_eq!(reason.code(), None);
    }

    #[test]
    fn test_stack_overflow_signals() {
        assert_eq!(
            analyze_exit_status(signaled(Signal::SIGSEGV)),
            TerminationReason::StackOverflow(Signal::SIGSEGV)
        );
        assert_eq!(
            analyze_exit_status(signaled(Signal::SIGBUS)),
            TerminationReason::StackOverflow(Signal::SIGBUS)
        );
    }

    #[test]
    fn test_descriptions() {
        assert_eq!(TerminationReason::Exited(3).to_string(), "exited with code 3");
        assert!(
            TerminationReason::Signaled(Signal::SIGTERM)
                .to_string()
                .contains("SIGTERM")
        );
        assert_eq!(TerminationReason::Unknown.to_string(), "unknown reason");
    }
}
