use crate::logger::{LogCommand, Record};
use crate::trigger::{Downstream, SinkError, TriggerSink};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use trialkit_core::TriggerEvent;
use trialkit_core::params::seconds;
use trialkit_timing::Timer;

pub const DEFAULT_BUFFER_SECONDS: f64 = 10.0;

/// One extracted window, as handed to the logger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub index: usize,
    pub trigger: TriggerEvent,
    /// Window bounds on the run clock, in seconds.
    pub window: (f64, f64),
}

/// Reference sampler: waits for each trigger's window to close, then emits a
/// sample record. Signal content is not modelled.
pub struct WindowSampler<T: Timer> {
    timer: T,
    buffer_seconds: f64,
    classes: Vec<String>,
    logger: Option<mpsc::UnboundedSender<LogCommand>>,
    samples: Option<mpsc::UnboundedSender<SampleRecord>>,
    extracted: usize,
}

impl<T: Timer> WindowSampler<T> {
    pub fn new(timer: T, buffer_seconds: f64) -> Self {
        Self {
            timer,
            buffer_seconds,
            classes: Vec::new(),
            logger: None,
            samples: None,
            extracted: 0,
        }
    }

    pub fn with_logger(mut self, logger: mpsc::UnboundedSender<LogCommand>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_subscriber(mut self, samples: mpsc::UnboundedSender<SampleRecord>) -> Self {
        self.samples = Some(samples);
        self
    }

    async fn extract(&mut self, trigger: TriggerEvent) -> Result<(), SinkError> {
        let (start, end) = trigger.absolute_window();
        if !self.classes.is_empty() && !self.classes.contains(&trigger.label) {
            warn!(label = %trigger.label, "trigger label not in current class set");
        }

        self.timer.sleep_until(seconds(end)).await;
        if self.timer.now_secs() - start > self.buffer_seconds {
            return Err(SinkError::Expired { start, end });
        }

        let record = SampleRecord {
            index: self.extracted,
            trigger,
            window: (start, end),
        };
        self.extracted += 1;
        debug!(index = record.index, label = %record.trigger.label, "sample extracted");

        if let Some(logger) = &self.logger {
            if logger
                .send(LogCommand::Append(Record::new("sample", &record)))
                .is_err()
            {
                warn!(index = record.index, "logger is gone; sample not recorded");
            }
        }
        if let Some(samples) = &self.samples {
            samples.send(record).map_err(|_| SinkError::Closed)?;
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Timer + 'static> TriggerSink for WindowSampler<T> {
    async fn deliver(&mut self, item: Downstream) -> Result<(), SinkError> {
        match item {
            Downstream::Classes(classes) => {
                debug!(?classes, "class set updated");
                self.classes = classes;
                Ok(())
            }
            Downstream::Trigger(trigger) => self.extract(trigger).await,
        }
    }
}
