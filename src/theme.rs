//! Colors for terminal output.
//!
//! Colors can be turned off with `--no-color` or the `NO_COLOR` environment
//! variable; every helper here then returns plain text.

use procfarm::WorkerState;
use std::sync::atomic::{AtomicBool, Ordering};

static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable colors for owo_colors output and comfy_table cells alike.
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

/// What a piece of output means, independent of how it is colored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semantic {
    WorkerId,
    Success,
    Failure,
    /// A worker on its way out or already gone.
    Degraded,
    Muted,
}

impl Semantic {
    /// How a worker state should look.
    pub fn for_state(state: WorkerState) -> Self {
        match state {
            WorkerState::Idle | WorkerState::Busy => Semantic::Success,
            WorkerState::ShutDown => Semantic::Failure,
            WorkerState::Spawning => Semantic::Muted,
            WorkerState::Exited | WorkerState::Restarting | WorkerState::ShuttingDown => {
                Semantic::Degraded
            }
        }
    }
}

/// The comfy_table color for a category, or `None` when colors are off.
pub fn table_color(semantic: Semantic) -> Option<comfy_table::Color> {
    if !colors_enabled() {
        return None;
    }
    Some(match semantic {
        Semantic::WorkerId => comfy_table::Color::Cyan,
        Semantic::Success => comfy_table::Color::Green,
        Semantic::Failure => comfy_table::Color::Red,
        Semantic::Degraded => comfy_table::Color::Yellow,
        Semantic::Muted => comfy_table::Color::DarkGrey,
    })
}

pub trait ThemedCell {
    fn themed(self, semantic: Semantic) -> Self;
}

impl ThemedCell for comfy_table::Cell {
    fn themed(self, semantic: Semantic) -> Self {
        match table_color(semantic) {
            Some(color) => self.fg(color),
            None => self,
        }
    }
}

/// Semantic styling for plain terminal text.
pub trait Themed: owo_colors::OwoColorize + std::fmt::Display {
    fn warning(&self) -> String {
        styled(self, |s| owo_colors::OwoColorize::yellow(s).to_string())
    }
}

fn styled<T, F>(value: &T, paint: F) -> String
where
    T: std::fmt::Display + ?Sized,
    F: FnOnce(&T) -> String,
{
    if colors_enabled() {
        paint(value)
    } else {
        value.to_string()
    }
}

impl Themed for String {}
impl Themed for &str {}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn reset_colors() {
        COLORS_ENABLED.store(true, Ordering::Relaxed);
        owo_colors::set_override(true);
    }

    #[test]
    #[serial(colors)]
    fn test_themed_text_with_colors() {
        reset_colors();
        let colored = "careful".warning();
        assert!(colored.contains("\x1b["), "Expected ANSI escape codes");
        assert!(colored.contains("careful"));
    }

    #[test]
    #[serial(colors)]
    fn test_themed_text_without_colors() {
        reset_colors();
        disable_colors();

        assert_eq!("careful".warning(), "careful");
        assert_eq!(String::from("done").warning(), "done");

        reset_colors();
    }

    #[test]
    #[serial(colors)]
    fn test_table_color() {
        reset_colors();
        assert_eq!(
            table_color(Semantic::Failure),
            Some(comfy_table::Color::Red)
        );
        disable_colors();
        assert_eq!(table_color(Semantic::Failure), None);
        reset_colors();
    }

    #[test]
    fn test_state_semantics() {
        assert_eq!(Semantic::for_state(WorkerState::Idle), Semantic::Success);
        assert_eq!(Semantic::for_state(WorkerState::ShutDown), Semantic::Failure);
        assert_eq!(
            Semantic::for_state(WorkerState::Restarting),
            Semantic::Degraded
        );
    }
}
