use crate::session::{Cue, SessionContext};
use crate::trial::{ActiveTrial, TrialTimestamps, blockwise_order, sample_iti};
use crate::trigger::{Downstream, PublishError};
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use trialkit_core::params::seconds;
use trialkit_core::{
    EndReason, ParamError, Paradigm, ResponseMode, RunOutcome, Trial, TrialState, TriggerEvent,
};
use trialkit_timing::Timer;

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("invalid parameters: {0}")]
    Params(#[from] ParamError),

    #[error("cannot emit triggers: {0}")]
    Publish(#[from] PublishError),
}

/// Marks a suspension point that was cut short by a stop request.
struct Interrupted;

const ENDED_EARLY: RunOutcome = RunOutcome::EndedEarly(EndReason::OperatorStop);

/// Drives one run: pre-run hold, the randomized trial loop, post-run hold.
///
/// Every wait races the cancellation token. A trial interrupted before it
/// finishes never produces a trigger.
pub struct TrialSequencer<P, T, R>
where
    P: Paradigm,
    T: Timer,
    R: Rng,
{
    pub paradigm: P,
    pub timer: T,
    pub rng: R,
    pub current: Option<ActiveTrial>,
    target_shown: bool,
}

impl<P, T, R> TrialSequencer<P, T, R>
where
    P: Paradigm,
    T: Timer,
    R: Rng,
{
    pub fn new(paradigm: P, timer: T, rng: R) -> Self {
        Self {
            paradigm,
            timer,
            rng,
            current: None,
            target_shown: false,
        }
    }

    pub fn current_trial_state(&self) -> Option<TrialState> {
        self.current.as_ref().map(|t| t.state)
    }

    pub async fn run(
        &mut self,
        ctx: &mut SessionContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, SequencerError> {
        ctx.params.validate(None)?;
        self.paradigm.validate(ctx.params)?;

        let cue = ctx.cue;
        let _blank = scopeguard::guard((), move |()| {
            cue.send_replace(Cue::Blank);
        });
        self.timer.reset_stats();
        self.current = None;
        let stale = ctx.discard_stale_decoded();
        if stale > 0 {
            debug!(stale, "ignored decoded classes from before the run");
        }

        let outcome = match self.paradigm.response_mode() {
            ResponseMode::Continuous => self.run_continuous(ctx, cancel).await,
            mode => self.run_trials(mode, ctx, cancel).await,
        };
        // Whatever was in flight is discarded.
        self.current = None;
        if self.target_shown {
            self.announce_target(ctx, None);
        }

        let stats = self.timer.timing_stats();
        debug!(
            waits = stats.waits,
            mean_overshoot_ms = stats.mean_overshoot_ns / 1e6,
            jitter_ms = stats.jitter_ns / 1e6,
            max_overshoot_ms = stats.max_overshoot_ns / 1e6,
            "run timing"
        );
        outcome
    }

    async fn run_trials(
        &mut self,
        mode: ResponseMode,
        ctx: &mut SessionContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, SequencerError> {
        let params = ctx.params;
        let order = blockwise_order(&params.classes, params.trials_per_class, &mut self.rng);
        ctx.set_progress(0, Some(order.len()));
        info!(
            task = self.paradigm.name(),
            trials = order.len(),
            "trial order ready"
        );

        if self.hold(seconds(params.pre_run), cancel).await.is_err() {
            return Ok(ENDED_EARLY);
        }

        for trial in order {
            if cancel.is_cancelled() {
                return Ok(ENDED_EARLY);
            }

            let iti = sample_iti(&mut self.rng, params.iti_min, params.iti_max);
            self.current = Some(ActiveTrial {
                trial: trial.clone(),
                state: TrialState::Iti,
                timestamps: TrialTimestamps {
                    start: self.timer.now(),
                    ..TrialTimestamps::default()
                },
            });
            ctx.cue.send_replace(Cue::Hold);
            self.announce_target(ctx, None);
            if self.hold(seconds(iti), cancel).await.is_err() {
                return Ok(ENDED_EARLY);
            }

            let event = match mode {
                ResponseMode::AwaitResponse => self.await_response(&trial, ctx, cancel).await,
                _ => self.hold_stimulus(&trial, ctx, cancel).await,
            };
            let Ok(event) = event else {
                return Ok(ENDED_EARLY);
            };

            if let Some(active) = self.current.as_mut() {
                active.state = TrialState::Complete;
            }
            debug!(trial = event.trial, label = %event.label, period = ?event.period, "trigger");
            ctx.triggers.publish(Downstream::Trigger(event))?;
            ctx.advance_progress();
            ctx.cue.send_replace(Cue::Blank);
        }

        self.announce_target(ctx, None);
        if self.hold(seconds(params.post_run), cancel).await.is_err() {
            return Ok(ENDED_EARLY);
        }
        Ok(RunOutcome::Complete)
    }

    /// Rolling windows for open-ended paradigms. `run_duration == 0` runs
    /// until stopped. Decoded class labels are shown as they arrive.
    async fn run_continuous(
        &mut self,
        ctx: &mut SessionContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, SequencerError> {
        let params = ctx.params;
        let window = seconds(params.trial_duration);
        let total = (!params.runs_until_stopped())
            .then(|| (params.run_duration / params.trial_duration).floor() as usize);
        ctx.set_progress(0, total);

        if self.hold(seconds(params.pre_run), cancel).await.is_err() {
            return Ok(ENDED_EARLY);
        }

        let label = self.paradigm.name().to_string();
        let mut index = 0;
        while total.is_none_or(|t| index < t) {
            if cancel.is_cancelled() {
                return Ok(ENDED_EARLY);
            }
            if self.hold_showing_decoded(window, ctx, cancel).await.is_err() {
                return Ok(ENDED_EARLY);
            }
            let event = TriggerEvent {
                trial: index,
                label: label.clone(),
                anchor: self.timer.now_secs(),
                period: (-params.trial_duration, 0.0),
                meta: Default::default(),
            };
            ctx.triggers.publish(Downstream::Trigger(event))?;
            ctx.advance_progress();
            index += 1;
        }
        ctx.cue.send_replace(Cue::Blank);

        if self.hold(seconds(params.post_run), cancel).await.is_err() {
            return Ok(ENDED_EARLY);
        }
        Ok(RunOutcome::Complete)
    }

    /// Shows the stimulus and waits for a response, the trial deadline or a
    /// stop request, whichever comes first. The window ends at the response;
    /// a timeout counts as a response at the deadline.
    async fn await_response(
        &mut self,
        trial: &Trial,
        ctx: &mut SessionContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<TriggerEvent, Interrupted> {
        let params = ctx.params;
        let span = seconds(params.trial_duration);
        let stale = ctx.discard_stale_responses();
        if stale > 0 {
            debug!(stale, "ignored responses outside the response window");
        }

        let onset = self.mark_onset(trial, ctx);
        let deadline = onset + span;
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Interrupted),
            response = next_item(ctx.responses) => Some(response),
            _ = self.timer.sleep_until(deadline) => None,
        };

        let (anchor, reaction) = match &response {
            Some(_) => {
                let now = self.timer.now();
                (now, now.saturating_sub(onset))
            }
            None => {
                self.timer.record_wait(span, self.timer.elapsed(onset));
                (deadline, span)
            }
        };
        if let Some(active) = self.current.as_mut() {
            active.state = TrialState::Response;
            active.timestamps.response = response.as_ref().map(|_| anchor);
        }

        let reaction_time = reaction.as_secs_f64();
        Ok(TriggerEvent {
            trial: trial.index,
            label: trial.label.clone(),
            anchor: anchor.as_secs_f64(),
            period: (-reaction_time, 0.0),
            meta: self
                .paradigm
                .reaction_meta(trial, params, reaction_time, response.as_ref()),
        })
    }

    /// Shows the stimulus for exactly the trial duration. The trigger is
    /// anchored at onset and only released once the hold completes.
    async fn hold_stimulus(
        &mut self,
        trial: &Trial,
        ctx: &mut SessionContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<TriggerEvent, Interrupted> {
        let params = ctx.params;
        let onset = self.mark_onset(trial, ctx);
        self.hold_until(onset + seconds(params.trial_duration), cancel)
            .await?;

        Ok(TriggerEvent {
            trial: trial.index,
            label: trial.label.clone(),
            anchor: onset.as_secs_f64(),
            period: (0.0, params.trial_duration),
            meta: self.paradigm.hold_meta(trial, params),
        })
    }

    fn mark_onset(&mut self, trial: &Trial, ctx: &SessionContext<'_>) -> Duration {
        let onset = self.timer.now();
        if let Some(active) = self.current.as_mut() {
            active.state = TrialState::Stimulus;
            active.timestamps.stimulus_start = Some(onset);
        }
        ctx.cue.send_replace(Cue::Stimulus {
            trial: trial.index,
            label: trial.label.clone(),
        });
        self.announce_target(ctx, Some(&trial.label));
        onset
    }

    fn announce_target(&mut self, ctx: &SessionContext<'_>, class: Option<&str>) {
        if self.paradigm.forwards_target_class() {
            ctx.target_class.send(class);
            self.target_shown = class.is_some();
        }
    }

    async fn hold(&mut self, d: Duration, cancel: &CancellationToken) -> Result<(), Interrupted> {
        let deadline = self.timer.now() + d;
        self.hold_until(deadline, cancel).await
    }

    async fn hold_until(
        &mut self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted> {
        let started = self.timer.now();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Interrupted),
            _ = self.timer.sleep_until(deadline) => {}
        }
        self.timer
            .record_wait(deadline.saturating_sub(started), self.timer.elapsed(started));
        Ok(())
    }

    async fn hold_showing_decoded(
        &mut self,
        d: Duration,
        ctx: &mut SessionContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted> {
        let started = self.timer.now();
        let deadline = started + d;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Interrupted),
                _ = self.timer.sleep_until(deadline) => break,
                decoded = next_item(ctx.decoded) => {
                    let cue = match decoded {
                        Some(label) => Cue::Decoded { label },
                        None => Cue::Blank,
                    };
                    ctx.cue.send_replace(cue);
                }
            }
        }
        self.timer.record_wait(d, self.timer.elapsed(started));
        Ok(())
    }
}

/// Next item; pends forever once the channel is closed so the deadline
/// still decides.
async fn next_item<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    match rx.recv().await {
        Some(item) => item,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RunStatus, TargetClassOutput};
    use crate::trigger::{ChannelSink, TriggerPublisher, TriggerSender};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::BTreeMap;
    use tokio::sync::watch;
    use trialkit_core::{Response, TaskKind, TaskParameters, TriggerMeta};
    use trialkit_timing::TokioTimer;

    struct Rig {
        responses_tx: mpsc::UnboundedSender<Response>,
        responses: mpsc::UnboundedReceiver<Response>,
        cue: watch::Sender<Cue>,
        status: watch::Sender<RunStatus>,
        triggers: TriggerSender,
        seen: mpsc::UnboundedReceiver<Downstream>,
        target_class: TargetClassOutput,
        targets: mpsc::UnboundedReceiver<Option<String>>,
        decoded_tx: mpsc::UnboundedSender<Option<String>>,
        decoded: mpsc::UnboundedReceiver<Option<String>>,
    }

    impl Rig {
        fn new() -> Self {
            let (responses_tx, responses) = mpsc::unbounded_channel();
            let (seen_tx, seen) = mpsc::unbounded_channel();
            let (triggers, _publisher) =
                TriggerPublisher::spawn(ChannelSink(seen_tx), CancellationToken::new());
            let (target_class, targets) = TargetClassOutput::channel();
            let (decoded_tx, decoded) = mpsc::unbounded_channel();
            Self {
                responses_tx,
                responses,
                cue: watch::channel(Cue::Blank).0,
                status: watch::channel(RunStatus::default()).0,
                triggers,
                seen,
                target_class,
                targets,
                decoded_tx,
                decoded,
            }
        }

        fn ctx<'a>(&'a mut self, params: &'a TaskParameters) -> SessionContext<'a> {
            SessionContext {
                params,
                responses: &mut self.responses,
                cue: &self.cue,
                status: &self.status,
                triggers: &self.triggers,
                target_class: &self.target_class,
                decoded: &mut self.decoded,
            }
        }

        fn target_classes(&mut self) -> Vec<Option<String>> {
            std::iter::from_fn(|| self.targets.try_recv().ok()).collect()
        }

        async fn emitted(&mut self) -> Vec<TriggerEvent> {
            self.triggers.flush().await.unwrap();
            let mut out = Vec::new();
            while let Ok(item) = self.seen.try_recv() {
                if let Downstream::Trigger(t) = item {
                    out.push(t);
                }
            }
            out
        }
    }

    fn params(classes: &[&str], trials_per_class: usize, trial_duration: f64) -> TaskParameters {
        TaskParameters {
            trials_per_class,
            trial_duration,
            iti_min: 0.0,
            iti_max: 0.0,
            pre_run: 0.0,
            post_run: 0.0,
            run_duration: 0.0,
            classes: classes.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn sequencer(kind: TaskKind, timer: &TokioTimer) -> TrialSequencer<TaskKind, TokioTimer, StdRng> {
        TrialSequencer::new(kind, timer.clone(), StdRng::seed_from_u64(11))
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_trials_time_out_back_to_back() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = params(&["A", "B"], 2, 1.0);
        let mut seq = sequencer(TaskKind::CenterOut, &timer);

        let outcome = seq
            .run(&mut rig.ctx(&p), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(timer.now(), Duration::from_secs(4));

        let triggers = rig.emitted().await;
        assert_eq!(triggers.len(), 4);
        for (i, t) in triggers.iter().enumerate() {
            assert_eq!(t.trial, i);
            assert_eq!(t.anchor, (i + 1) as f64);
            assert_eq!(t.period, (-1.0, 0.0));
            assert!(matches!(t.meta, TriggerMeta::Reaction { timed_out: true, .. }));
        }
        for block in triggers.chunks(2) {
            let mut labels: Vec<&str> = block.iter().map(|t| t.label.as_str()).collect();
            labels.sort();
            assert_eq!(labels, ["A", "B"]);
        }

        assert_eq!(*rig.cue.borrow(), Cue::Blank);
        let progress = rig.status.borrow().progress;
        assert_eq!((progress.completed, progress.total), (4, Some(4)));
        assert!(seq.current.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_window_spans_full_trial() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = params(&["A"], 1, 4.0);
        let mut seq = sequencer(TaskKind::CenterOut, &timer);

        seq.run(&mut rig.ctx(&p), &CancellationToken::new())
            .await
            .unwrap();
        let trigger = &rig.emitted().await[0];
        assert_eq!(trigger.period.1, 0.0);
        assert_eq!(trigger.duration(), 4.0);
        assert_eq!(trigger.reaction_time(), Some(4.0));
    }

    #[tokio::test(start_paused = true)]
    async fn response_ends_window_at_reaction_time() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = params(&["up", "down"], 1, 4.0);
        let mut seq = sequencer(TaskKind::CenterOut, &timer);

        let tx = rig.responses_tx.clone();
        let clock = timer.clone();
        tokio::spawn(async move {
            clock.sleep_until(Duration::from_millis(1500)).await;
            tx.send(Response::choose("up")).unwrap();
        });

        seq.run(&mut rig.ctx(&p), &CancellationToken::new())
            .await
            .unwrap();
        let triggers = rig.emitted().await;
        assert_eq!(triggers.len(), 2);

        let first = &triggers[0];
        assert_eq!(first.anchor, 1.5);
        assert_eq!(first.period, (-1.5, 0.0));
        match &first.meta {
            TriggerMeta::Reaction {
                timed_out,
                choice,
                correct,
                ..
            } => {
                assert!(!timed_out);
                assert_eq!(choice.as_deref(), Some("up"));
                assert_eq!(*correct, Some(first.label == "up"));
            }
            other => panic!("unexpected meta {other:?}"),
        }
        // The second trial starts right after the response.
        assert_eq!(triggers[1].anchor, 5.5);
    }

    #[tokio::test(start_paused = true)]
    async fn responses_during_iti_are_ignored() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = TaskParameters {
            iti_min: 1.0,
            iti_max: 1.0,
            ..params(&["A"], 1, 2.0)
        };
        let mut seq = sequencer(TaskKind::CenterOut, &timer);

        let tx = rig.responses_tx.clone();
        let clock = timer.clone();
        tokio::spawn(async move {
            clock.sleep_until(Duration::from_millis(500)).await;
            tx.send(Response::press()).unwrap();
        });

        seq.run(&mut rig.ctx(&p), &CancellationToken::new())
            .await
            .unwrap();
        let trigger = &rig.emitted().await[0];
        assert_eq!(trigger.anchor, 3.0);
        assert!(matches!(trigger.meta, TriggerMeta::Reaction { timed_out: true, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_stimulus_emits_nothing() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = params(&["A"], 3, 4.0);
        let mut seq = sequencer(TaskKind::CuedAction, &timer);

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let clock = timer.clone();
        tokio::spawn(async move {
            clock.sleep_until(Duration::from_secs(6)).await;
            stopper.cancel();
        });

        let outcome = seq.run(&mut rig.ctx(&p), &cancel).await.unwrap();
        assert_eq!(outcome, RunOutcome::EndedEarly(EndReason::OperatorStop));
        assert_eq!(timer.now(), Duration::from_secs(6));
        // Only the first trial finished before the stop.
        assert_eq!(rig.emitted().await.len(), 1);
        assert_eq!(*rig.cue.borrow(), Cue::Blank);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_iti_emits_nothing() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = TaskParameters {
            iti_min: 3.0,
            iti_max: 3.0,
            ..params(&["A", "B"], 1, 1.0)
        };
        let mut seq = sequencer(TaskKind::CuedAction, &timer);

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let clock = timer.clone();
        tokio::spawn(async move {
            clock.sleep_until(Duration::from_secs(1)).await;
            stopper.cancel();
        });

        let outcome = seq.run(&mut rig.ctx(&p), &cancel).await.unwrap();
        assert!(!outcome.is_complete());
        assert!(rig.emitted().await.is_empty());
        assert_eq!(rig.status.borrow().progress.completed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_hold_anchors_at_onset() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = params(&["A", "B"], 1, 2.0);
        let kind = TaskKind::Ssvep {
            frequencies: BTreeMap::from([("A".to_string(), 8.0), ("B".to_string(), 10.0)]),
        };
        let mut seq = sequencer(kind, &timer);

        seq.run(&mut rig.ctx(&p), &CancellationToken::new())
            .await
            .unwrap();
        let triggers = rig.emitted().await;
        assert_eq!(triggers.len(), 2);
        assert_eq!(triggers[0].anchor, 0.0);
        assert_eq!(triggers[1].anchor, 2.0);
        for t in &triggers {
            assert_eq!(t.period, (0.0, 2.0));
            let hz = if t.label == "A" { 8.0 } else { 10.0 };
            assert_eq!(
                t.meta,
                TriggerMeta::Frequency {
                    hz,
                    freqs: vec![8.0, 10.0]
                }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cued_action_holds_and_anchors_at_onset() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = params(&["A", "B"], 1, 2.0);
        let mut seq = sequencer(TaskKind::CuedAction, &timer);

        // A response does not cut a fixed hold short.
        rig.responses_tx.send(Response::press()).unwrap();
        seq.run(&mut rig.ctx(&p), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(timer.now(), Duration::from_secs(4));

        let triggers = rig.emitted().await;
        let anchors: Vec<f64> = triggers.iter().map(|t| t.anchor).collect();
        assert_eq!(anchors, [0.0, 2.0]);
        assert!(triggers.iter().all(|t| t.period == (0.0, 2.0)));
        assert!(triggers.iter().all(|t| t.meta == TriggerMeta::None));
    }

    #[tokio::test(start_paused = true)]
    async fn target_class_follows_iti_onset_and_post_run() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = TaskParameters {
            iti_min: 0.5,
            iti_max: 0.5,
            post_run: 1.0,
            ..params(&["A", "B"], 2, 1.0)
        };
        let mut seq = sequencer(TaskKind::CuedAction, &timer);

        let outcome = seq
            .run(&mut rig.ctx(&p), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Complete);

        let labels: Vec<String> = rig.emitted().await.into_iter().map(|t| t.label).collect();
        let mut expected = Vec::new();
        for label in &labels {
            expected.push(None);
            expected.push(Some(label.clone()));
        }
        expected.push(None);
        assert_eq!(rig.target_classes(), expected);
        assert_eq!(expected.len(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_stimulus_clears_target_class() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = params(&["A"], 2, 4.0);
        let mut seq = sequencer(TaskKind::CuedAction, &timer);

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let clock = timer.clone();
        tokio::spawn(async move {
            clock.sleep_until(Duration::from_secs(1)).await;
            stopper.cancel();
        });

        seq.run(&mut rig.ctx(&p), &cancel).await.unwrap();
        assert_eq!(
            rig.target_classes(),
            [None, Some("A".to_string()), None]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reaction_tasks_do_not_forward_target_class() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = params(&["up", "down"], 1, 1.0);
        let mut seq = sequencer(TaskKind::CenterOut, &timer);

        seq.run(&mut rig.ctx(&p), &CancellationToken::new())
            .await
            .unwrap();
        assert!(rig.target_classes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_fixed_hold_emits_nothing() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = params(&["A"], 1, 5.0);
        let kind = TaskKind::Ssvep {
            frequencies: BTreeMap::from([("A".to_string(), 8.0)]),
        };
        let mut seq = sequencer(kind, &timer);

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let clock = timer.clone();
        tokio::spawn(async move {
            clock.sleep_until(Duration::from_secs(4)).await;
            stopper.cancel();
        });

        let outcome = seq.run(&mut rig.ctx(&p), &cancel).await.unwrap();
        assert!(!outcome.is_complete());
        assert!(rig.emitted().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_mode_emits_rolling_windows() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = TaskParameters {
            run_duration: 3.0,
            ..params(&["rest"], 1, 1.0)
        };
        let mut seq = sequencer(TaskKind::Feedback, &timer);

        let outcome = seq
            .run(&mut rig.ctx(&p), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Complete);

        let triggers = rig.emitted().await;
        let anchors: Vec<f64> = triggers.iter().map(|t| t.anchor).collect();
        assert_eq!(anchors, [1.0, 2.0, 3.0]);
        assert!(triggers.iter().all(|t| t.period == (-1.0, 0.0)));
        assert!(triggers.iter().all(|t| t.label == "feedback"));
        assert_eq!(rig.status.borrow().progress.total, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn feedback_shows_decoded_classes() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = TaskParameters {
            run_duration: 3.0,
            ..params(&["rest"], 1, 1.0)
        };
        let mut seq = sequencer(TaskKind::Feedback, &timer);

        // Arrives before the run and is never shown.
        rig.decoded_tx.send(Some("stale".into())).unwrap();
        let tx = rig.decoded_tx.clone();
        let cue = rig.cue.subscribe();
        let clock = timer.clone();
        let shown = tokio::spawn(async move {
            let mut seen = Vec::new();
            clock.sleep_until(Duration::from_millis(250)).await;
            seen.push(cue.borrow().clone());
            clock.sleep_until(Duration::from_millis(500)).await;
            tx.send(Some("left".into())).unwrap();
            clock.sleep_until(Duration::from_millis(1200)).await;
            seen.push(cue.borrow().clone());
            tx.send(None).unwrap();
            clock.sleep_until(Duration::from_millis(2200)).await;
            seen.push(cue.borrow().clone());
            seen
        });

        seq.run(&mut rig.ctx(&p), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            shown.await.unwrap(),
            [
                Cue::Blank,
                Cue::Decoded {
                    label: "left".into()
                },
                Cue::Blank
            ]
        );
        // Decoded labels do not change the windows.
        assert_eq!(rig.emitted().await.len(), 3);
        assert_eq!(*rig.cue.borrow(), Cue::Blank);
    }

    #[tokio::test(start_paused = true)]
    async fn open_ended_run_continues_until_stopped() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = params(&["rest"], 1, 1.0);
        let mut seq = sequencer(TaskKind::Feedback, &timer);

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let clock = timer.clone();
        tokio::spawn(async move {
            clock.sleep_until(Duration::from_millis(2500)).await;
            stopper.cancel();
        });

        let outcome = seq.run(&mut rig.ctx(&p), &cancel).await.unwrap();
        assert_eq!(outcome, RunOutcome::EndedEarly(EndReason::OperatorStop));
        assert_eq!(rig.emitted().await.len(), 2);
        assert_eq!(rig.status.borrow().progress.total, None);
    }

    #[tokio::test]
    async fn invalid_parameters_are_refused() {
        let timer = TokioTimer::new();
        let mut rig = Rig::new();
        let p = params(&[], 1, 1.0);
        let mut seq = sequencer(TaskKind::CuedAction, &timer);

        let err = seq
            .run(&mut rig.ctx(&p), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SequencerError::Params(ParamError::NoClasses)));
    }
}
