use crate::params::{ParamError, TaskParameters};
use crate::trial::{Response, Trial, TriggerMeta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a trial ends once the stimulus is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Wait up to the trial duration for a response; the window ends at the
    /// response.
    AwaitResponse,
    /// Hold for exactly the trial duration; the window starts at onset.
    FixedHold,
    /// No trial order; emit rolling windows until the run duration elapses.
    Continuous,
}

/// Defines a task variant and the metadata its triggers carry.
pub trait Paradigm: Clone + Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn response_mode(&self) -> ResponseMode;

    /// Paradigm-specific checks on top of `TaskParameters::validate`.
    fn validate(&self, _params: &TaskParameters) -> Result<(), ParamError> {
        Ok(())
    }

    fn hold_meta(&self, _trial: &Trial, _params: &TaskParameters) -> TriggerMeta {
        TriggerMeta::None
    }

    /// Whether the cued class is forwarded downstream as it changes.
    fn forwards_target_class(&self) -> bool {
        false
    }

    fn reaction_meta(
        &self,
        _trial: &Trial,
        _params: &TaskParameters,
        reaction_time: f64,
        response: Option<&Response>,
    ) -> TriggerMeta {
        TriggerMeta::Reaction {
            reaction_time,
            timed_out: response.is_none(),
            choice: response.and_then(|r| r.choice.clone()),
            correct: None,
            target_angle: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    CuedAction,
    CenterOut,
    Ssvep { frequencies: BTreeMap<String, f64> },
    Feedback,
}

impl Default for TaskKind {
    fn default() -> Self {
        TaskKind::CuedAction
    }
}

impl TaskKind {
    /// Stimulus frequency of a class label; `None` for unknown labels and
    /// for paradigms without frequency-coded stimuli.
    pub fn frequency_of(&self, label: &str) -> Option<f64> {
        match self {
            TaskKind::Ssvep { frequencies } => frequencies.get(label).copied(),
            _ => None,
        }
    }

    /// Angle in degrees of a class's target when targets are spread evenly
    /// around a circle in class order.
    pub fn target_angle(params: &TaskParameters, label: &str) -> Option<f64> {
        let k = params.classes.len();
        params
            .classes
            .iter()
            .position(|c| c == label)
            .map(|idx| 360.0 * idx as f64 / k as f64)
    }
}

impl Paradigm for TaskKind {
    fn name(&self) -> &str {
        match self {
            TaskKind::CuedAction => "cued_action",
            TaskKind::CenterOut => "center_out",
            TaskKind::Ssvep { .. } => "ssvep",
            TaskKind::Feedback => "feedback",
        }
    }

    fn response_mode(&self) -> ResponseMode {
        match self {
            TaskKind::CenterOut => ResponseMode::AwaitResponse,
            TaskKind::CuedAction | TaskKind::Ssvep { .. } => ResponseMode::FixedHold,
            TaskKind::Feedback => ResponseMode::Continuous,
        }
    }

    fn forwards_target_class(&self) -> bool {
        matches!(self, TaskKind::CuedAction | TaskKind::Ssvep { .. })
    }

    fn validate(&self, params: &TaskParameters) -> Result<(), ParamError> {
        if let TaskKind::Ssvep { frequencies } = self {
            for label in &params.classes {
                match frequencies.get(label) {
                    Some(hz) if hz.is_finite() && *hz > 0.0 => {}
                    _ => return Err(ParamError::MissingFrequency(label.clone())),
                }
            }
        }
        Ok(())
    }

    fn hold_meta(&self, trial: &Trial, params: &TaskParameters) -> TriggerMeta {
        let Some(hz) = self.frequency_of(&trial.label) else {
            return TriggerMeta::None;
        };
        // Every class frequency of the run, in class order.
        let freqs = params
            .classes
            .iter()
            .filter_map(|c| self.frequency_of(c))
            .collect();
        TriggerMeta::Frequency { hz, freqs }
    }

    fn reaction_meta(
        &self,
        trial: &Trial,
        params: &TaskParameters,
        reaction_time: f64,
        response: Option<&Response>,
    ) -> TriggerMeta {
        let choice = response.and_then(|r| r.choice.clone());
        let (correct, target_angle) = match self {
            TaskKind::CenterOut => (
                choice.as_ref().map(|c| *c == trial.label),
                Self::target_angle(params, &trial.label),
            ),
            _ => (None, None),
        };
        TriggerMeta::Reaction {
            reaction_time,
            timed_out: response.is_none(),
            choice,
            correct,
            target_angle,
        }
    }
}
