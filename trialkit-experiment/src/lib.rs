pub mod config;
pub mod controller;
pub mod logger;
pub mod recording;
pub mod sampler;
pub mod session;
pub mod state;
pub mod trial;
pub mod trigger;

pub use config::{PanelError, PanelState, ParamEdit, ParameterPanel};
pub use controller::{ControlCommand, ControllerConfig, RunController, RunHandle};
pub use logger::{JsonlLogger, LogCommand, LoggerError, Record};
pub use recording::{AckKind, LogAck, RecordingCoordinator, RecordingError, RecordingSession, SessionPhase};
pub use sampler::{SampleRecord, WindowSampler};
pub use session::{
    Cue, Progress, RecordingIndicator, RunStatus, SessionContext, TargetClassOutput,
};
pub use state::{SequencerError, TrialSequencer};
pub use trial::{ActiveTrial, TrialTimestamps, blockwise_order, sample_iti};
pub use trigger::{ChannelSink, Downstream, PublishError, SinkError, TriggerPublisher, TriggerSender, TriggerSink};
