use crate::logger::LogCommand;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckKind {
    Started,
    Stopped,
    Failed(String),
}

/// Logger confirmation, tagged with the target it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogAck {
    pub target: PathBuf,
    pub kind: AckKind,
}

impl LogAck {
    pub fn started(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            kind: AckKind::Started,
        }
    }

    pub fn stopped(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            kind: AckKind::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Requested,
    AckStarted,
    StopRequested,
    AckStopped,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSession {
    pub target: PathBuf,
    pub phase: SessionPhase,
}

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recording to {0} is still active")]
    SessionActive(PathBuf),

    #[error("no recording session is active")]
    NoSession,

    #[error("logger is not running")]
    LoggerClosed,

    #[error("logger failed for {target}: {reason}")]
    LoggerFailed { target: PathBuf, reason: String },

    #[error("no {expected} acknowledgement for {target} within {after:?}")]
    AckTimeout {
        target: PathBuf,
        expected: &'static str,
        after: Duration,
    },
}

impl RecordingError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::AckTimeout { .. })
    }
}

/// Start/ack and stop/ack handshake with the logger.
///
/// At most one session is open at a time. Acks for other targets are kept
/// aside for a later wait rather than consumed.
#[derive(Debug)]
pub struct RecordingCoordinator {
    commands: mpsc::UnboundedSender<LogCommand>,
    acks: mpsc::UnboundedReceiver<LogAck>,
    stash: VecDeque<LogAck>,
    abandoned: Vec<PathBuf>,
    ack_timeout: Duration,
    active: Option<RecordingSession>,
    last: Option<RecordingSession>,
}

impl RecordingCoordinator {
    pub fn new(
        commands: mpsc::UnboundedSender<LogCommand>,
        acks: mpsc::UnboundedReceiver<LogAck>,
    ) -> Self {
        Self {
            commands,
            acks,
            stash: VecDeque::new(),
            abandoned: Vec::new(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            active: None,
            last: None,
        }
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn active(&self) -> Option<&RecordingSession> {
        self.active.as_ref()
    }

    pub fn stashed(&self) -> usize {
        self.stash.len()
    }

    /// Asks the logger to open `target` and waits for its ack.
    pub async fn start(
        &mut self,
        target: PathBuf,
        header: serde_json::Value,
    ) -> Result<RecordingSession, RecordingError> {
        if let Some(session) = &self.active {
            return Err(RecordingError::SessionActive(session.target.clone()));
        }

        self.commands
            .send(LogCommand::Start {
                target: target.clone(),
                header,
            })
            .map_err(|_| RecordingError::LoggerClosed)?;
        self.active = Some(RecordingSession {
            target: target.clone(),
            phase: SessionPhase::Requested,
        });
        debug!(target = %target.display(), "recording start requested");

        match self.await_ack(&target, AckKind::Started).await {
            Ok(()) => {
                let session = RecordingSession {
                    target,
                    phase: SessionPhase::AckStarted,
                };
                self.active = Some(session.clone());
                info!(target = %session.target.display(), "recording started");
                Ok(session)
            }
            Err(err) => {
                // Never acknowledged, so no stop may be sent for it yet.
                if err.is_timeout() {
                    self.abandoned.push(target);
                }
                self.active = None;
                Err(err)
            }
        }
    }

    /// Asks the logger to close the active session and waits for its ack.
    /// The session is closed locally whatever the outcome.
    pub async fn stop(&mut self) -> Result<RecordingSession, RecordingError> {
        let target = match self.active.as_mut() {
            Some(session) if session.phase == SessionPhase::AckStarted => {
                session.phase = SessionPhase::StopRequested;
                session.target.clone()
            }
            _ => return Err(RecordingError::NoSession),
        };

        let result = match self.commands.send(LogCommand::Stop {
            target: target.clone(),
        }) {
            Ok(()) => self.await_ack(&target, AckKind::Stopped).await,
            Err(_) => Err(RecordingError::LoggerClosed),
        };
        self.active = None;

        let phase = match &result {
            Ok(()) => SessionPhase::AckStopped,
            Err(_) => SessionPhase::Closed,
        };
        let session = RecordingSession { target, phase };
        self.last = Some(session.clone());
        result.map(|()| {
            info!(target = %session.target.display(), "recording stopped");
            session
        })
    }

    /// The most recently finished session; `Closed` when it was closed
    /// without a stop ack.
    pub fn last_session(&self) -> Option<&RecordingSession> {
        self.last.as_ref()
    }

    async fn await_ack(&mut self, target: &Path, expected: AckKind) -> Result<(), RecordingError> {
        let stashed = self
            .stash
            .iter()
            .position(|a| a.target == target && Self::settle(a, target, &expected).is_some());
        if let Some(ack) = stashed.and_then(|pos| self.stash.remove(pos)) {
            if let Some(result) = Self::settle(&ack, target, &expected) {
                return result;
            }
        }

        let deadline = Instant::now() + self.ack_timeout;
        loop {
            let ack = match tokio::time::timeout_at(deadline, self.acks.recv()).await {
                Err(_) => {
                    return Err(RecordingError::AckTimeout {
                        target: target.to_path_buf(),
                        expected: match expected {
                            AckKind::Stopped => "stop",
                            _ => "start",
                        },
                        after: self.ack_timeout,
                    });
                }
                Ok(None) => return Err(RecordingError::LoggerClosed),
                Ok(Some(ack)) => ack,
            };

            if ack.target == target {
                if let Some(result) = Self::settle(&ack, target, &expected) {
                    return result;
                }
            }
            if self.reap(&ack) {
                continue;
            }
            debug!(target = %ack.target.display(), kind = ?ack.kind, "stashing ack for another session");
            self.stash.push_back(ack);
        }
    }

    fn settle(ack: &LogAck, target: &Path, expected: &AckKind) -> Option<Result<(), RecordingError>> {
        match &ack.kind {
            kind if kind == expected => Some(Ok(())),
            AckKind::Failed(reason) => Some(Err(RecordingError::LoggerFailed {
                target: target.to_path_buf(),
                reason: reason.clone(),
            })),
            _ => None,
        }
    }

    /// Handles late acks for sessions whose start timed out. A late start
    /// ack is answered with a stop so the logger does not keep the file open.
    fn reap(&mut self, ack: &LogAck) -> bool {
        let Some(pos) = self.abandoned.iter().position(|t| *t == ack.target) else {
            return false;
        };
        match ack.kind {
            AckKind::Started => {
                warn!(target = %ack.target.display(), "late start ack; closing abandoned recording");
                if self
                    .commands
                    .send(LogCommand::Stop {
                        target: ack.target.clone(),
                    })
                    .is_err()
                {
                    warn!(target = %ack.target.display(), "logger gone; abandoned recording left open");
                }
                true
            }
            AckKind::Stopped | AckKind::Failed(_) => {
                self.abandoned.remove(pos);
                true
            }
        }
    }
}
