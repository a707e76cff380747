use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Rejected parameter values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamError {
    #[error("trials per class must be at least 1")]
    NoTrials,

    #[error("trial duration must be positive, got {0}s")]
    NonPositiveTrialDuration(f64),

    #[error("trial duration {trial}s exceeds sampler buffer of {buffer}s")]
    TrialExceedsBuffer { trial: f64, buffer: f64 },

    #[error("inter-trial interval bounds inverted: min {min}s > max {max}s")]
    InvertedIti { min: f64, max: f64 },

    #[error("{field} must be non-negative, got {value}s")]
    Negative { field: &'static str, value: f64 },

    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },

    #[error("at least one class label is required")]
    NoClasses,

    #[error("class label at position {0} is empty")]
    EmptyLabel(usize),

    #[error("class label {0:?} appears more than once")]
    DuplicateClass(String),

    #[error("no stimulus frequency configured for class {0:?}")]
    MissingFrequency(String),
}

/// Snapshot of everything a run needs, taken once when the run starts.
///
/// All durations are seconds. `run_duration` only applies to open-ended
/// paradigms, where `0.0` means "until stopped".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskParameters {
    pub trials_per_class: usize,
    pub trial_duration: f64,
    pub iti_min: f64,
    pub iti_max: f64,
    pub pre_run: f64,
    pub post_run: f64,
    pub run_duration: f64,
    pub classes: Vec<String>,
}

impl Default for TaskParameters {
    fn default() -> Self {
        Self {
            trials_per_class: 10,
            trial_duration: 4.0,
            iti_min: 1.0,
            iti_max: 2.0,
            pre_run: 3.0,
            post_run: 3.0,
            run_duration: 0.0,
            classes: vec!["left".to_string(), "right".to_string()],
        }
    }
}

impl TaskParameters {
    /// Checks every invariant. `buffer_seconds` is the downstream sampler's
    /// capacity, when one is known.
    pub fn validate(&self, buffer_seconds: Option<f64>) -> Result<(), ParamError> {
        let timed = [
            ("trial duration", self.trial_duration),
            ("iti min", self.iti_min),
            ("iti max", self.iti_max),
            ("pre-run", self.pre_run),
            ("post-run", self.post_run),
            ("run duration", self.run_duration),
        ];
        for (field, value) in timed {
            if !value.is_finite() {
                return Err(ParamError::NotFinite { field });
            }
            if value < 0.0 {
                return Err(ParamError::Negative { field, value });
            }
        }

        if self.trials_per_class == 0 {
            return Err(ParamError::NoTrials);
        }
        if self.trial_duration <= 0.0 {
            return Err(ParamError::NonPositiveTrialDuration(self.trial_duration));
        }
        if let Some(buffer) = buffer_seconds {
            if self.trial_duration > buffer {
                return Err(ParamError::TrialExceedsBuffer {
                    trial: self.trial_duration,
                    buffer,
                });
            }
        }
        if self.iti_min > self.iti_max {
            return Err(ParamError::InvertedIti {
                min: self.iti_min,
                max: self.iti_max,
            });
        }

        if self.classes.is_empty() {
            return Err(ParamError::NoClasses);
        }
        let mut seen = HashSet::with_capacity(self.classes.len());
        for (idx, label) in self.classes.iter().enumerate() {
            if label.trim().is_empty() {
                return Err(ParamError::EmptyLabel(idx));
            }
            if !seen.insert(label.as_str()) {
                return Err(ParamError::DuplicateClass(label.clone()));
            }
        }

        Ok(())
    }

    pub fn total_trials(&self) -> usize {
        self.classes.len() * self.trials_per_class
    }

    /// Shortest and longest possible wall time of a full trial run.
    pub fn estimated_duration(&self) -> (f64, f64) {
        let n = self.total_trials() as f64;
        let fixed = self.pre_run + self.post_run + n * self.trial_duration;
        (fixed + n * self.iti_min, fixed + n * self.iti_max)
    }

    /// True when an open-ended paradigm should run until stopped.
    pub fn runs_until_stopped(&self) -> bool {
        self.run_duration == 0.0
    }
}

/// Converts a validated seconds value to a `Duration`.
pub fn seconds(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}
