//! Reference JSONL logger.
//!
//! Persists sample records for the currently open recording session and
//! acknowledges every start/stop with the target it was asked for. Each line
//! is one `Record`; a session begins with `_meta.session_start` and ends
//! with `_meta.session_stop`.

use crate::recording::{AckKind, LogAck};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum LogCommand {
    Start {
        target: PathBuf,
        header: serde_json::Value,
    },
    Append(Record),
    Stop {
        target: PathBuf,
    },
}

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A timestamped line in the session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unix timestamp in milliseconds.
    pub ts: i64,
    pub event: String,
    pub data: serde_json::Value,
}

impl Record {
    pub fn new(event: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
            event: event.into(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn session_start(header: serde_json::Value) -> Self {
        Self::new("_meta.session_start", header)
    }

    pub fn session_stop(samples: usize) -> Self {
        Self::new("_meta.session_stop", serde_json::json!({ "samples": samples }))
    }
}

struct OpenLog {
    target: PathBuf,
    writer: BufWriter<fs::File>,
    samples: usize,
}

impl OpenLog {
    async fn write(&mut self, record: &Record) -> Result<(), LoggerError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|source| LoggerError::Io {
                path: self.target.clone(),
                source,
            })
    }

    async fn close(mut self) -> Result<usize, LoggerError> {
        let stop = Record::session_stop(self.samples);
        self.write(&stop).await?;
        self.writer.flush().await.map_err(|source| LoggerError::Io {
            path: self.target.clone(),
            source,
        })?;
        Ok(self.samples)
    }
}

pub struct JsonlLogger {
    commands: mpsc::UnboundedReceiver<LogCommand>,
    acks: mpsc::UnboundedSender<LogAck>,
    open: Option<OpenLog>,
}

impl JsonlLogger {
    pub fn new(
        commands: mpsc::UnboundedReceiver<LogCommand>,
        acks: mpsc::UnboundedSender<LogAck>,
    ) -> Self {
        Self {
            commands,
            acks,
            open: None,
        }
    }

    /// Processes commands until every sender is gone. Pending commands are
    /// always handled, so stop requests issued during shutdown still get
    /// their ack.
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                LogCommand::Start { target, header } => self.start(target, header).await,
                LogCommand::Append(record) => self.append(record).await,
                LogCommand::Stop { target } => self.stop(target).await,
            }
        }
        if let Some(open) = self.open.take() {
            let target = open.target.clone();
            if let Err(err) = open.close().await {
                error!(target = %target.display(), error = %err, "failed to close log on exit");
            }
        }
        debug!("logger stopped");
    }

    async fn start(&mut self, target: PathBuf, header: serde_json::Value) {
        if let Some(previous) = self.open.take() {
            let previous_target = previous.target.clone();
            warn!(target = %previous_target.display(), "closing unfinished log before opening a new one");
            if let Err(err) = previous.close().await {
                warn!(target = %previous_target.display(), error = %err, "failed to close unfinished log");
            }
        }

        let kind = match Self::open(&target, header).await {
            Ok(open) => {
                info!(target = %target.display(), "log opened");
                self.open = Some(open);
                AckKind::Started
            }
            Err(err) => {
                error!(target = %target.display(), error = %err, "failed to open log");
                AckKind::Failed(err.to_string())
            }
        };
        self.ack(LogAck { target, kind });
    }

    fn ack(&self, ack: LogAck) {
        if let Err(err) = self.acks.send(ack) {
            warn!(target = %err.0.target.display(), "nobody is waiting for logger acks");
        }
    }

    /// Refuses to reuse an existing file; every session gets its own.
    async fn open(target: &PathBuf, header: serde_json::Value) -> Result<OpenLog, LoggerError> {
        let io_err = |source| LoggerError::Io {
            path: target.clone(),
            source,
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(target)
            .await
            .map_err(io_err)?;
        let mut open = OpenLog {
            target: target.clone(),
            writer: BufWriter::new(file),
            samples: 0,
        };
        open.write(&Record::session_start(header)).await?;
        Ok(open)
    }

    async fn append(&mut self, record: Record) {
        let Some(open) = self.open.as_mut() else {
            debug!(event = %record.event, "no open log; record dropped");
            return;
        };
        match open.write(&record).await {
            Ok(()) => open.samples += 1,
            Err(err) => error!(error = %err, "failed to append record"),
        }
    }

    async fn stop(&mut self, target: PathBuf) {
        let kind = match self.open.take_if(|o| o.target == target) {
            Some(open) => match open.close().await {
                Ok(samples) => {
                    info!(target = %target.display(), samples, "log closed");
                    AckKind::Stopped
                }
                Err(err) => {
                    error!(target = %target.display(), error = %err, "failed to close log");
                    AckKind::Failed(err.to_string())
                }
            },
            None => {
                // Nothing open under that name; it is already stopped.
                debug!(target = %target.display(), "stop for a log that is not open");
                AckKind::Stopped
            }
        };
        self.ack(LogAck { target, kind });
    }
}
