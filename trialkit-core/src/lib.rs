pub mod params;
pub mod phase;
pub mod stimulus;
pub mod trial;

pub use params::{ParamError, TaskParameters};
pub use phase::{EndReason, Indicator, RunOutcome, RunState};
pub use stimulus::{Paradigm, ResponseMode, TaskKind};
pub use trial::{Response, Trial, TrialState, TriggerEvent, TriggerMeta};
