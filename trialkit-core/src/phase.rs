use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one task instance. Drives the start/stop button and gates
/// the trial loop.
#[derive(Copy, Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
}

impl RunState {
    /// The state that follows this one in a normal cycle.
    pub fn next(&self) -> Self {
        use RunState::*;
        match self {
            Idle => Starting,
            Starting => Running,
            Running => Stopping,
            Stopping => Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn button_label(&self) -> &'static str {
        match self {
            Self::Idle => "Start",
            Self::Starting => "Starting...",
            Self::Running => "Stop",
            Self::Stopping => "Stopping...",
        }
    }

    /// Parameter widgets are editable only between runs.
    pub fn controls_enabled(&self) -> bool {
        self.is_idle()
    }

    /// Whether the start/stop button accepts a click.
    pub fn button_enabled(&self) -> bool {
        matches!(self, Self::Idle | Self::Running)
    }
}

/// Progress-bar colour.
#[derive(Copy, Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Indicator {
    #[default]
    Neutral,
    Warning,
    Success,
}

#[derive(Copy, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// The operator pressed stop.
    OperatorStop,
    /// The logger never acknowledged the start of recording.
    HandshakeTimeout,
    /// The logger refused or dropped the recording request.
    RecordingFailed,
    /// The process is shutting down.
    Shutdown,
    /// The run could not continue, e.g. its parameters were rejected or the
    /// trigger path went away.
    Fault,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::OperatorStop => "stopped by operator",
            Self::HandshakeTimeout => "recording handshake timed out",
            Self::RecordingFailed => "recording could not be started",
            Self::Shutdown => "shutdown requested",
            Self::Fault => "run failed",
        };
        f.write_str(text)
    }
}

/// How a trial loop finished.
#[derive(Copy, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Complete,
    EndedEarly(EndReason),
}

impl RunOutcome {
    pub fn indicator(&self) -> Indicator {
        match self {
            Self::Complete => Indicator::Success,
            Self::EndedEarly(_) => Indicator::Warning,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => f.write_str("complete"),
            Self::EndedEarly(reason) => write!(f, "ended early: {reason}"),
        }
    }
}
