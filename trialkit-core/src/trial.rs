use serde::{Deserialize, Serialize};

/// One scheduled presentation of a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trial {
    pub index: usize,
    pub label: String,
}

/// Where the loop is within the current trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    Iti,
    Stimulus,
    Response,
    Complete,
}

/// Operator or participant response to the current stimulus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub choice: Option<String>,
}

impl Response {
    pub fn press() -> Self {
        Self::default()
    }

    pub fn choose(choice: impl Into<String>) -> Self {
        Self {
            choice: Some(choice.into()),
        }
    }
}

/// Task-specific payload attached to a trigger.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerMeta {
    #[default]
    None,
    Reaction {
        reaction_time: f64,
        timed_out: bool,
        choice: Option<String>,
        correct: Option<bool>,
        target_angle: Option<f64>,
    },
    Frequency {
        /// Expected frequency of the cued stimulus.
        hz: f64,
        /// All class frequencies of the run, in class order.
        freqs: Vec<f64>,
    },
}

/// Marker telling the sampler which slice of signal belongs to a trial.
///
/// `period` is an offset pair in seconds relative to `anchor`, which is
/// itself seconds on the run clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub trial: usize,
    pub label: String,
    pub anchor: f64,
    pub period: (f64, f64),
    #[serde(default)]
    pub meta: TriggerMeta,
}

impl TriggerEvent {
    pub fn duration(&self) -> f64 {
        self.period.1 - self.period.0
    }

    /// Window bounds on the run clock.
    pub fn absolute_window(&self) -> (f64, f64) {
        (self.anchor + self.period.0, self.anchor + self.period.1)
    }

    pub fn reaction_time(&self) -> Option<f64> {
        match &self.meta {
            TriggerMeta::Reaction { reaction_time, .. } => Some(*reaction_time),
            _ => None,
        }
    }
}
