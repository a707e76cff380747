use crate::trigger::TriggerSender;
use std::path::PathBuf;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use trialkit_core::{Indicator, Response, RunOutcome, RunState, TaskParameters};

/// What the stimulus area should show right now.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Cue {
    #[default]
    Blank,
    /// Inter-trial hold, typically a fixation mark.
    Hold,
    Stimulus { trial: usize, label: String },
    /// Class reported by an upstream decoder during a feedback run.
    Decoded { label: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    /// `None` for runs without a fixed trial count.
    pub total: Option<usize>,
}

impl Progress {
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some(self.completed as f64 / total as f64),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum RecordingIndicator {
    #[default]
    NotRecording,
    Recording(PathBuf),
}

impl RecordingIndicator {
    pub fn label(&self) -> String {
        match self {
            Self::NotRecording => "NOT RECORDING".to_string(),
            Self::Recording(path) => format!("Recording to {}", path.display()),
        }
    }
}

/// Everything the GUI layer renders about a task instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStatus {
    pub state: RunState,
    pub indicator: Indicator,
    pub message: String,
    pub progress: Progress,
    pub recording: RecordingIndicator,
    /// Number of runs started so far.
    pub session: u64,
    pub last_outcome: Option<RunOutcome>,
}

/// Unbounded FIFO of the class the participant is currently cued with.
/// `None` marks the stretches without a target: each ITI and the post-run
/// hold.
#[derive(Debug, Clone, Default)]
pub struct TargetClassOutput {
    tx: Option<mpsc::UnboundedSender<Option<String>>>,
}

impl TargetClassOutput {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Option<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Never blocks. A missing or departed consumer is not an error.
    pub fn send(&self, class: Option<&str>) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(class.map(str::to_string)).is_err() {
            debug!(?class, "target class consumer is gone");
        }
    }
}

/// Per-run state handed to the sequencer by the controller that owns it.
pub struct SessionContext<'a> {
    pub params: &'a TaskParameters,
    pub responses: &'a mut mpsc::UnboundedReceiver<Response>,
    pub cue: &'a watch::Sender<Cue>,
    pub status: &'a watch::Sender<RunStatus>,
    pub triggers: &'a TriggerSender,
    pub target_class: &'a TargetClassOutput,
    /// Class labels from an upstream decoder; `None` clears the display.
    pub decoded: &'a mut mpsc::UnboundedReceiver<Option<String>>,
}

impl SessionContext<'_> {
    pub fn set_progress(&self, completed: usize, total: Option<usize>) {
        self.status.send_modify(|s| s.progress = Progress { completed, total });
    }

    pub fn advance_progress(&self) {
        self.status.send_modify(|s| s.progress.completed += 1);
    }

    /// Drops responses that arrived outside a response window.
    pub fn discard_stale_responses(&mut self) -> usize {
        let mut dropped = 0;
        while self.responses.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// Drops decoded labels that arrived before the run started.
    pub fn discard_stale_decoded(&mut self) -> usize {
        let mut dropped = 0;
        while self.decoded.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}
