//! Memory sizes, idle memory limits and RSS sampling.
//!
//! Worker memory is only inspected between calls: the farm asks an idle worker
//! for its resident set size and recycles it when it is above the configured
//! [`MemoryLimit`].

use std::fmt;
use std::str::FromStr;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Memory size in bytes with parsing and formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemorySize(u64);

impl MemorySize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * MIB)
    }

    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * GIB)
    }

    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    pub const fn as_mib(&self) -> u64 {
        self.0 / MIB
    }

    pub const fn as_gib(&self) -> u64 {
        self.0 / GIB
    }
}

/// Errors that can occur when parsing memory sizes and limits.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryError {
    InvalidFormat(String),
    /// A fractional limit outside `(0, 1]`.
    InvalidFraction(f64),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFormat(msg) => write!(f, "invalid memory size: {}", msg),
            Self::InvalidFraction(value) => {
                write!(f, "memory fraction must be in (0, 1], got {}", value)
            }
        }
    }
}

impl std::error::Error for MemoryError {}

impl FromStr for MemorySize {
    type Err = MemoryError;

    /// Parse a human-readable memory size string.
    ///
    /// Supported formats:
    /// - Plain number: bytes (e.g., "1048576")
    /// - With suffix: "32G", "32GB", "32GiB", "1024M", "512K", "100B"
    /// - Case insensitive, fractional values allowed ("1.5G")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MemoryError::InvalidFormat("empty string".into()));
        }

        let num_end = s
            .chars()
            .position(|c| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(MemoryError::InvalidFormat(format!(
                "no numeric value in '{}'",
                s
            )));
        }

        let num_str = &s[..num_end];
        let suffix = s[num_end..].trim().to_lowercase();

        let value: f64 = num_str
            .parse()
            .map_err(|_| MemoryError::InvalidFormat(format!("invalid number: '{}'", num_str)))?;

        let multiplier: u64 = match suffix.as_str() {
            "" | "b" => 1,
            "k" | "kb" | "kib" => KIB,
            "m" | "mb" | "mib" => MIB,
            "g" | "gb" | "gib" => GIB,
            "t" | "tb" | "tib" => 1024 * GIB,
            _ => {
                return Err(MemoryError::InvalidFormat(format!(
                    "unknown suffix: '{}'",
                    suffix
                )));
            }
        };

        Ok(MemorySize((value * multiplier as f64) as u64))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= GIB {
            let gib = self.0 as f64 / GIB as f64;
            if gib.fract() < 0.01 {
                write!(f, "{} GiB", self.as_gib())
            } else {
                write!(f, "{:.1} GiB", gib)
            }
        } else if self.as_mib() > 0 {
            write!(f, "{} MiB", self.as_mib())
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

/// Resident memory above which an idle worker is recycled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemoryLimit {
    /// Fixed number of bytes.
    Absolute(MemorySize),
    /// Fraction of total system memory, in `(0, 1]`.
    Fraction(f64),
}

impl MemoryLimit {
    /// The limit in bytes, or `None` when a fractional limit cannot be resolved
    /// because total system memory is unknown.
    pub fn resolve_bytes(&self) -> Option<u64> {
        match self {
            Self::Absolute(size) => Some(size.as_bytes()),
            Self::Fraction(fraction) => {
                system_memory_bytes().map(|total| (total as f64 * fraction) as u64)
            }
        }
    }

    /// Whether `rss_bytes` is over this limit.
    pub fn is_exceeded_by(&self, rss_bytes: u64) -> bool {
        self.resolve_bytes().is_some_and(|limit| rss_bytes > limit)
    }
}

impl FromStr for MemoryLimit {
    type Err = MemoryError;

    /// A bare number up to `1` is a fraction of system memory ("0.4"); anything
    /// else is parsed as a [`MemorySize`] ("512M", "2G", "1073741824").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(value) = s.parse::<f64>() {
            if value <= 1.0 {
                if value <= 0.0 || value.is_nan() {
                    return Err(MemoryError::InvalidFraction(value));
                }
                return Ok(Self::Fraction(value));
            }
        }
        Ok(Self::Absolute(s.parse()?))
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute(size) => write!(f, "{}", size),
            Self::Fraction(fraction) => write!(f, "{:.0}% of system memory", fraction * 100.0),
        }
    }
}

/// Total system memory in bytes, from /proc/meminfo.
#[cfg(target_os = "linux")]
pub fn system_memory_bytes() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = contents.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * KIB)
}

#[cfg(not(target_os = "linux"))]
pub fn system_memory_bytes() -> Option<u64> {
    None
}

/// Resident set size of the calling process in bytes.
///
/// Reads /proc/self/statm on Linux and falls back to the peak RSS reported by
/// `getrusage()` elsewhere.
pub fn current_rss_bytes() -> u64 {
    read_statm_rss().unwrap_or_else(peak_rss_bytes)
}

#[cfg(target_os = "linux")]
fn read_statm_rss() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = contents.split_whitespace().nth(1)?.parse().ok()?;
    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = if page_size > 0 { page_size as u64 } else { 4 * KIB };
    Some(resident_pages * page_size)
}

#[cfg(not(target_os = "linux"))]
fn read_statm_rss() -> Option<u64> {
    None
}

fn peak_rss_bytes() -> u64 {
    use nix::sys::resource::{UsageWho, getrusage};

    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let max_rss = usage.max_rss().max(0) as u64;

            #[cfg(target_os = "macos")]
            {
                max_rss
            }

            #[cfg(not(target_os = "macos"))]
            {
                max_rss * KIB
            }
        }
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_plain_number_as_bytes() {
        assert_eq!(MemorySize::from_str("4096").unwrap().as_bytes(), 4096);
        assert_eq!(MemorySize::from_str("100B").unwrap().as_bytes(), 100);
    }

    #[test]
    fn test_parse_with_suffix() {
        assert_eq!(MemorySize::from_str("32G").unwrap().as_gib(), 32);
        assert_eq!(MemorySize::from_str("32GiB").unwrap().as_gib(), 32);
        assert_eq!(MemorySize::from_str("32gb").unwrap().as_gib(), 32);
        assert_eq!(MemorySize::from_str("1024M").unwrap().as_mib(), 1024);
        assert_eq!(MemorySize::from_str("512k").unwrap().as_bytes(), 512 * 1024);
        assert_eq!(MemorySize::from_str("1T").unwrap().as_gib(), 1024);
        assert_eq!(MemorySize::from_str("1.5G").unwrap().as_mib(), 1536);
    }

    #[test]
    fn test_parse_errors() {
        assert!(MemorySize::from_str("").is_err());
        assert!(MemorySize::from_str("abc").is_err());
        assert!(MemorySize::from_str("32X").is_err());
        assert!(MemorySize::from_str("-5G").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(MemorySize::from_gib(8).to_string(), "8 GiB");
        assert_eq!(MemorySize::from_mib(512).to_string(), "512 MiB");
        assert_eq!(MemorySize::from_mib(1536).to_string(), "1.5 GiB");
        assert_eq!(MemorySize::from_bytes(12).to_string(), "12 bytes");
    }

    #[test]
    fn test_limit_fraction_vs_absolute() {
        assert_eq!(
            MemoryLimit::from_str("0.4").unwrap(),
            MemoryLimit::Fraction(0.4)
        );
        assert_eq!(MemoryLimit::from_str("1").unwrap(), MemoryLimit::Fraction(1.0));
        assert_eq!(
            MemoryLimit::from_str("512M").unwrap(),
            MemoryLimit::Absolute(MemorySize::from_mib(512))
        );
        assert_eq!(
            MemoryLimit::from_str("2048").unwrap(),
            MemoryLimit::Absolute(MemorySize::from_bytes(2048))
        );
    }

    #[test]
    fn test_limit_rejects_non_positive_fraction() {
        assert_eq!(
            MemoryLimit::from_str("0"),
            Err(MemoryError::InvalidFraction(0.0))
        );
        assert!(MemoryLimit::from_str("-0.5").is_err());
        assert!(MemoryLimit::from_str("lots").is_err());
    }

    #[test]
    fn test_absolute_limit_comparison() {
        let limit = MemoryLimit::Absolute(MemorySize::from_mib(1));
        assert!(limit.is_exceeded_by(MIB + 1));
        assert!(!limit.is_exceeded_by(MIB));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_fraction_resolves_against_system_memory() {
        let total = system_memory_bytes().expect("MemTotal should be readable");
        let half = MemoryLimit::Fraction(0.5).resolve_bytes().unwrap();
        assert!(half <= total && half >= total / 2 - 1);
    }

    #[test]
    fn test_current_rss_is_nonzero() {
        assert!(current_rss_bytes() > 0);
    }

    proptest! {
        #[test]
        fn prop_mib_suffix_scales(n in 0u64..1_000_000) {
            let parsed = MemorySize::from_str(&format!("{}M", n)).unwrap();
            prop_assert_eq!(parsed.as_bytes(), n * MIB);
        }

        #[test]
        fn prop_plain_numbers_above_one_are_absolute(n in 2u64..u32::MAX as u64) {
            let limit = MemoryLimit::from_str(&n.to_string()).unwrap();
            prop_assert_eq!(limit, MemoryLimit::Absolute(MemorySize::from_bytes(n)));
        }
    }
}
