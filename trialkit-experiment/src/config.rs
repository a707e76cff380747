use thiserror::Error;
use tokio::sync::watch;
use trialkit_core::{ParamError, Paradigm, TaskParameters};

/// A single operator edit to one parameter widget.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamEdit {
    TrialsPerClass(usize),
    TrialDuration(f64),
    ItiMin(f64),
    ItiMax(f64),
    PreRun(f64),
    PostRun(f64),
    RunDuration(f64),
    Classes(Vec<String>),
}

#[derive(Debug, Error, PartialEq)]
pub enum PanelError {
    #[error("unknown parameter {0:?}")]
    UnknownField(String),

    #[error("invalid value {value:?} for {field}")]
    InvalidValue { field: String, value: String },

    #[error(transparent)]
    Rejected(#[from] ParamError),
}

impl ParamEdit {
    /// Parses a `field value` pair as typed into the operator console.
    pub fn parse(field: &str, value: &str) -> Result<Self, PanelError> {
        let invalid = || PanelError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        };
        let secs = || value.trim().parse::<f64>().map_err(|_| invalid());

        Ok(match field {
            "trials" | "trials_per_class" => {
                ParamEdit::TrialsPerClass(value.trim().parse().map_err(|_| invalid())?)
            }
            "trial_duration" => ParamEdit::TrialDuration(secs()?),
            "iti_min" => ParamEdit::ItiMin(secs()?),
            "iti_max" => ParamEdit::ItiMax(secs()?),
            "pre_run" => ParamEdit::PreRun(secs()?),
            "post_run" => ParamEdit::PostRun(secs()?),
            "run_duration" => ParamEdit::RunDuration(secs()?),
            "classes" => ParamEdit::Classes(
                value
                    .split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect(),
            ),
            other => return Err(PanelError::UnknownField(other.to_string())),
        })
    }

    fn apply(self, params: &mut TaskParameters) {
        match self {
            ParamEdit::TrialsPerClass(v) => params.trials_per_class = v,
            ParamEdit::TrialDuration(v) => params.trial_duration = v,
            ParamEdit::ItiMin(v) => params.iti_min = v,
            ParamEdit::ItiMax(v) => params.iti_max = v,
            ParamEdit::PreRun(v) => params.pre_run = v,
            ParamEdit::PostRun(v) => params.post_run = v,
            ParamEdit::RunDuration(v) => params.run_duration = v,
            ParamEdit::Classes(v) => params.classes = v,
        }
    }
}

/// Committed parameters plus the values derived from them.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelState {
    pub params: TaskParameters,
    pub total_trials: usize,
    /// Shortest and longest run time in seconds.
    pub estimated_duration: (f64, f64),
}

impl PanelState {
    fn recompute(params: TaskParameters) -> Self {
        Self {
            total_trials: params.total_trials(),
            estimated_duration: params.estimated_duration(),
            params,
        }
    }
}

/// Editable parameters of one task instance.
///
/// Every accepted edit recomputes the derived values and notifies
/// subscribers; rejected edits leave the committed state untouched.
#[derive(Debug)]
pub struct ParameterPanel<P: Paradigm> {
    paradigm: P,
    buffer_seconds: Option<f64>,
    tx: watch::Sender<PanelState>,
}

impl<P: Paradigm> ParameterPanel<P> {
    pub fn new(
        paradigm: P,
        params: TaskParameters,
        buffer_seconds: Option<f64>,
    ) -> Result<Self, PanelError> {
        params.validate(buffer_seconds)?;
        paradigm.validate(&params)?;
        let (tx, _rx) = watch::channel(PanelState::recompute(params));
        Ok(Self {
            paradigm,
            buffer_seconds,
            tx,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<PanelState> {
        self.tx.subscribe()
    }

    pub fn paradigm(&self) -> &P {
        &self.paradigm
    }

    pub fn state(&self) -> PanelState {
        self.tx.borrow().clone()
    }

    pub fn edit(&mut self, edit: ParamEdit) -> Result<PanelState, PanelError> {
        let mut next = self.tx.borrow().params.clone();
        edit.apply(&mut next);
        next.validate(self.buffer_seconds)?;
        self.paradigm.validate(&next)?;

        let state = PanelState::recompute(next);
        self.tx.send_replace(state.clone());
        Ok(state)
    }
}
