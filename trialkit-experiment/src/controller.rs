use crate::config::PanelState;
use crate::recording::RecordingCoordinator;
use crate::sampler::DEFAULT_BUFFER_SECONDS;
use crate::session::{
    Cue, Progress, RecordingIndicator, RunStatus, SessionContext, TargetClassOutput,
};
use crate::state::TrialSequencer;
use crate::trigger::{Downstream, TriggerSender};
use chrono::{DateTime, Local};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trialkit_core::{
    EndReason, Indicator, Paradigm, Response, RunOutcome, RunState, TaskParameters,
};
use trialkit_timing::Timer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Start a run, recording into the given subdirectory when set.
    Start { recording: Option<String> },
    Stop,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Root under which recording subdirectories are created.
    pub data_dir: PathBuf,
    /// Sampler capacity; trial durations beyond it are refused at start.
    pub buffer_seconds: Option<f64>,
    /// Upper bound on waiting for the downstream queue to drain before
    /// recording stops.
    pub flush_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            buffer_seconds: Some(DEFAULT_BUFFER_SECONDS),
            flush_timeout: Duration::from_secs(10),
        }
    }
}

/// Operator-side handle: the start/stop button, the response input and the
/// status display.
#[derive(Debug, Clone)]
pub struct RunHandle {
    commands: mpsc::UnboundedSender<ControlCommand>,
    responses: mpsc::UnboundedSender<Response>,
    decoded: mpsc::UnboundedSender<Option<String>>,
    status: watch::Receiver<RunStatus>,
    cue: watch::Receiver<Cue>,
}

impl RunHandle {
    /// Ignored unless the controller is idle. A blank subdirectory means
    /// not recording. Returns false once the controller is gone.
    pub fn request_start(&self, recording: Option<String>) -> bool {
        let recording = recording
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self.commands
            .send(ControlCommand::Start { recording })
            .is_ok()
    }

    pub fn request_stop(&self) -> bool {
        self.commands.send(ControlCommand::Stop).is_ok()
    }

    pub fn respond(&self, response: Response) -> bool {
        self.responses.send(response).is_ok()
    }

    /// Feeds a decoder's class label to a running feedback task; `None`
    /// clears the display.
    pub fn show_decoded(&self, class: Option<String>) -> bool {
        self.decoded.send(class).is_ok()
    }

    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RunStatus> {
        self.status.clone()
    }

    pub fn subscribe_cue(&self) -> watch::Receiver<Cue> {
        self.cue.clone()
    }
}

/// Owns one task instance: Idle -> Starting -> Running -> Stopping -> Idle.
///
/// Every exit path of a run, including a failed handshake, ends in the same
/// cleanup: drain the trigger queue, close the recording, publish Idle.
pub struct RunController<P: Paradigm, T: Timer> {
    sequencer: TrialSequencer<P, T, StdRng>,
    config: ControllerConfig,
    panel: watch::Receiver<PanelState>,
    recording: RecordingCoordinator,
    triggers: TriggerSender,
    commands: mpsc::UnboundedReceiver<ControlCommand>,
    responses: mpsc::UnboundedReceiver<Response>,
    decoded: mpsc::UnboundedReceiver<Option<String>>,
    target_class: TargetClassOutput,
    status: watch::Sender<RunStatus>,
    cue: watch::Sender<Cue>,
}

impl<P: Paradigm, T: Timer> RunController<P, T> {
    pub fn new(
        paradigm: P,
        timer: T,
        panel: watch::Receiver<PanelState>,
        recording: RecordingCoordinator,
        triggers: TriggerSender,
        config: ControllerConfig,
    ) -> (Self, RunHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (response_tx, responses) = mpsc::unbounded_channel();
        let (decoded_tx, decoded) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(RunStatus::default());
        let (cue, cue_rx) = watch::channel(Cue::Blank);

        let controller = Self {
            sequencer: TrialSequencer::new(paradigm, timer, StdRng::from_os_rng()),
            config,
            panel,
            recording,
            triggers,
            commands,
            responses,
            decoded,
            target_class: TargetClassOutput::default(),
            status,
            cue,
        };
        let handle = RunHandle {
            commands: command_tx,
            responses: response_tx,
            decoded: decoded_tx,
            status: status_rx,
            cue: cue_rx,
        };
        (controller, handle)
    }

    /// Makes trial order and ITIs reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.sequencer.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Where the cued class goes for paradigms that forward it.
    pub fn with_target_class_output(mut self, output: TargetClassOutput) -> Self {
        self.target_class = output;
        self
    }

    /// Serves start requests until shutdown or until every handle is dropped.
    /// A run in progress when shutdown fires is finished through the normal
    /// cleanup path first.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(task = self.sequencer.paradigm.name(), "controller ready");
        loop {
            let command = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = self.commands.recv() => command,
            };
            match command {
                Some(ControlCommand::Start { recording }) => {
                    self.run_session(recording, &shutdown).await
                }
                Some(ControlCommand::Stop) => debug!("stop ignored; no run is active"),
                None => break,
            }
        }
        info!(task = self.sequencer.paradigm.name(), "controller stopped");
    }

    async fn run_session(&mut self, subdir: Option<String>, shutdown: &CancellationToken) {
        let cancel = shutdown.child_token();
        // Snapshot; edits made during the run apply to the next one.
        let params = self.panel.borrow().params.clone();
        let task = self.sequencer.paradigm.name().to_string();

        self.status.send_modify(|s| {
            s.state = RunState::Starting;
            s.indicator = Indicator::Neutral;
            s.message = "Starting".to_string();
            s.progress = Progress::default();
            s.session += 1;
        });
        let session = self.status.borrow().session;
        info!(task = %task, session, recording = ?subdir, "run starting");

        let outcome = match self.prepare(&params, subdir.as_deref(), session, &cancel).await {
            Ok(()) => self.execute(&params, &cancel).await,
            Err(reason) => RunOutcome::EndedEarly(reason),
        };
        let outcome = match outcome {
            RunOutcome::EndedEarly(EndReason::OperatorStop) if shutdown.is_cancelled() => {
                RunOutcome::EndedEarly(EndReason::Shutdown)
            }
            other => other,
        };

        self.set_state(RunState::Stopping, "Stopping");
        self.drain_downstream(shutdown).await;
        self.close_recording().await;

        while let Ok(command) = self.commands.try_recv() {
            debug!(?command, "discarding command queued during the run");
        }

        match outcome {
            RunOutcome::Complete => info!(task = %task, session, "run complete"),
            RunOutcome::EndedEarly(EndReason::OperatorStop | EndReason::Shutdown) => {
                warn!(task = %task, session, %outcome, "run ended early")
            }
            RunOutcome::EndedEarly(_) => error!(task = %task, session, %outcome, "run ended early"),
        }
        self.status.send_modify(|s| {
            s.state = RunState::Idle;
            s.indicator = outcome.indicator();
            s.message = format!("Run {outcome}");
            s.recording = RecordingIndicator::NotRecording;
            s.last_outcome = Some(outcome);
        });
    }

    /// Validates the snapshot and, when asked to, completes the recording
    /// start handshake. A stop request during the handshake is remembered
    /// on `cancel`; the handshake itself always runs to its ack or timeout.
    async fn prepare(
        &mut self,
        params: &TaskParameters,
        subdir: Option<&str>,
        session: u64,
        cancel: &CancellationToken,
    ) -> Result<(), EndReason> {
        let checked = params
            .validate(self.config.buffer_seconds)
            .and_then(|()| self.sequencer.paradigm.validate(params));
        if let Err(err) = checked {
            error!(error = %err, "refusing to start with invalid parameters");
            return Err(EndReason::Fault);
        }

        let Some(subdir) = subdir else {
            self.status
                .send_modify(|s| s.recording = RecordingIndicator::NotRecording);
            return Ok(());
        };
        let task = self.sequencer.paradigm.name();
        let Some(target) =
            recording_target(&self.config.data_dir, subdir, task, session, Local::now())
        else {
            error!(subdir, "recording subdirectory must be a plain relative path");
            return Err(EndReason::RecordingFailed);
        };
        let header = serde_json::json!({
            "task": task,
            "session": session,
            "params": params,
        });

        match supervise(
            self.recording.start(target, header),
            &mut self.commands,
            cancel,
        )
        .await
        {
            Ok(started) => {
                self.status
                    .send_modify(|s| s.recording = RecordingIndicator::Recording(started.target));
                Ok(())
            }
            Err(err) if err.is_timeout() => {
                error!(error = %err, "recording start was not acknowledged");
                Err(EndReason::HandshakeTimeout)
            }
            Err(err) => {
                error!(error = %err, "recording could not be started");
                Err(EndReason::RecordingFailed)
            }
        }
    }

    async fn execute(&mut self, params: &TaskParameters, cancel: &CancellationToken) -> RunOutcome {
        if cancel.is_cancelled() {
            return RunOutcome::EndedEarly(EndReason::OperatorStop);
        }
        self.set_state(RunState::Running, "Running");

        if let Err(err) = self
            .triggers
            .publish(Downstream::Classes(params.classes.clone()))
        {
            error!(error = %err, "cannot announce the class set");
            return RunOutcome::EndedEarly(EndReason::Fault);
        }

        let mut ctx = SessionContext {
            params,
            responses: &mut self.responses,
            cue: &self.cue,
            status: &self.status,
            triggers: &self.triggers,
            target_class: &self.target_class,
            decoded: &mut self.decoded,
        };
        match supervise(self.sequencer.run(&mut ctx, cancel), &mut self.commands, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, "trial loop failed");
                RunOutcome::EndedEarly(EndReason::Fault)
            }
        }
    }

    /// Every trigger of the run reaches the sampler before recording stops.
    async fn drain_downstream(&self, shutdown: &CancellationToken) {
        match tokio::time::timeout(self.config.flush_timeout, self.triggers.flush()).await {
            Ok(Ok(())) => {}
            // The publisher drains its queue before it exits on shutdown.
            Ok(Err(err)) if shutdown.is_cancelled() => {
                debug!(error = %err, "trigger publisher already drained")
            }
            Ok(Err(err)) => warn!(error = %err, "pending samples may be lost"),
            Err(_) => warn!(
                after = ?self.config.flush_timeout,
                "downstream did not drain in time"
            ),
        }
    }

    async fn close_recording(&mut self) {
        if self.recording.active().is_none() {
            return;
        }
        match self.recording.stop().await {
            Ok(session) => debug!(target = %session.target.display(), "recording closed"),
            Err(err) => error!(error = %err, "recording stop failed; session closed anyway"),
        }
    }

    fn set_state(&self, state: RunState, message: &str) {
        self.status.send_modify(|s| {
            s.state = state;
            s.message = message.to_string();
        });
    }
}

/// Polls `fut` to completion while serving the command channel: stop
/// requests (or the last handle going away) cancel, start requests are
/// ignored because a run is already active.
async fn supervise<F: Future>(
    fut: F,
    commands: &mut mpsc::UnboundedReceiver<ControlCommand>,
    cancel: &CancellationToken,
) -> F::Output {
    tokio::pin!(fut);
    let mut open = true;
    loop {
        tokio::select! {
            biased;
            out = &mut fut => return out,
            command = commands.recv(), if open => match command {
                Some(ControlCommand::Stop) => {
                    info!("stop requested");
                    cancel.cancel();
                }
                Some(ControlCommand::Start { .. }) => debug!("start ignored; a run is active"),
                None => {
                    open = false;
                    cancel.cancel();
                }
            },
        }
    }
}

/// `<data_dir>/<subdir>/<task>_<YYYYmmdd_HHMMSS_mmm>_s<session>.jsonl`.
/// `subdir` must be a relative path made of plain components. The session
/// number keeps targets unique when runs start within the same millisecond.
pub fn recording_target(
    data_dir: &Path,
    subdir: &str,
    task: &str,
    session: u64,
    at: DateTime<Local>,
) -> Option<PathBuf> {
    let subdir = Path::new(subdir.trim());
    let plain = subdir
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if subdir.as_os_str().is_empty() || !plain {
        return None;
    }
    let file = format!("{task}_{}_s{session}.jsonl", at.format("%Y%m%d_%H%M%S_%3f"));
    Some(data_dir.join(subdir).join(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn target_is_timestamped_under_subdir() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let target = recording_target(Path::new("/data"), "p01/day1", "ssvep", 2, at).unwrap();
        assert_eq!(
            target,
            PathBuf::from("/data/p01/day1/ssvep_20240309_140507_000_s2.jsonl")
        );
    }

    #[test]
    fn sessions_in_the_same_instant_get_distinct_targets() {
        let at = Local::now();
        let first = recording_target(Path::new("/data"), "p01", "cued_action", 1, at);
        let second = recording_target(Path::new("/data"), "p01", "cued_action", 2, at);
        assert!(first.is_some());
        assert_ne!(first, second);
    }

    #[test]
    fn escaping_subdirs_are_refused() {
        let at = Local::now();
        for bad in ["", "  ", "../up", "/abs", "a/../b", "./here"] {
            assert_eq!(
                recording_target(Path::new("/data"), bad, "task", 1, at),
                None,
                "{bad:?} accepted"
            );
        }
    }
}
