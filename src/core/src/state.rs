//! Pipeline progress reporting.

use std::fmt;
use strum_macros::Display;

/// Coarse phase of a patching run, reported in order. `Failed` may follow
/// any phase; `Idle` is only ever the starting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PatchingState {
    Idle,
    InstallingToolkit,
    PreparingFeatures,
    PreparingFiles,
    GeneratingScript,
    Patching,
    CollectingOutput,
    CreatingModule,
    Completed,
    Failed,
}

/// Prefix tag for streamed log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum LogTag {
    Setup,
    Patch,
    Module,
    Error,
}

/// Where progress goes. The pipeline only ever talks to this trait, so a
/// frontend can render states and lines however it likes.
pub trait ProgressSink: Send + Sync {
    fn state(&self, state: PatchingState);
    fn line(&self, tag: LogTag, message: &str);
}

/// Logs states at info level and tagged lines verbatim.
pub struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn state(&self, state: PatchingState) {
        log::info!("state: {state}");
    }

    fn line(&self, tag: LogTag, message: &str) {
        match tag {
            LogTag::Error => log::error!("[{tag}] {message}"),
            _ => log::info!("[{tag}] {message}"),
        }
    }
}

/// Collects everything; used by tests to assert on the reported sequence.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    pub states: std::sync::Mutex<Vec<PatchingState>>,
    pub lines: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl ProgressSink for RecordingSink {
    fn state(&self, state: PatchingState) {
        self.states.lock().unwrap().push(state);
    }

    fn line(&self, tag: LogTag, message: &str) {
        self.lines.lock().unwrap().push(format!("[{tag}] {message}"));
    }
}

impl fmt::Debug for ConsoleSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConsoleSink")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_render_uppercase() {
        assert_eq!(LogTag::Setup.to_string(), "SETUP");
        assert_eq!(LogTag::Error.to_string(), "ERROR");
    }

    #[test]
    fn states_render_snake_case() {
        assert_eq!(PatchingState::InstallingToolkit.to_string(), "installing_toolkit");
        assert_eq!(PatchingState::Completed.to_string(), "completed");
    }
}
