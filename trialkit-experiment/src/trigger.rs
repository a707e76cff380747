use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use trialkit_core::TriggerEvent;

/// Items forwarded to the sampler, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Downstream {
    /// The class set of the run that is starting. Always precedes its triggers.
    Classes(Vec<String>),
    Trigger(TriggerEvent),
}

#[derive(Debug)]
enum Envelope {
    Item(Downstream),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("downstream closed")]
    Closed,

    #[error("window {start:.3}..{end:.3}s is no longer buffered")]
    Expired { start: f64, end: f64 },

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("trigger publisher has stopped")]
    Closed,
}

/// Consumer side of the publisher.
#[async_trait]
pub trait TriggerSink: Send {
    async fn deliver(&mut self, item: Downstream) -> Result<(), SinkError>;
}

/// Forwards into a plain channel; used where the consumer lives in another task.
#[derive(Debug, Clone)]
pub struct ChannelSink(pub mpsc::UnboundedSender<Downstream>);

#[async_trait]
impl TriggerSink for ChannelSink {
    async fn deliver(&mut self, item: Downstream) -> Result<(), SinkError> {
        self.0.send(item).map_err(|_| SinkError::Closed)
    }
}

/// Producer handle. Enqueueing never blocks.
#[derive(Debug, Clone)]
pub struct TriggerSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl TriggerSender {
    pub fn publish(&self, item: Downstream) -> Result<(), PublishError> {
        self.tx
            .send(Envelope::Item(item))
            .map_err(|_| PublishError::Closed)
    }

    /// Resolves once everything published before this call has been
    /// delivered to the sink.
    pub async fn flush(&self) -> Result<(), PublishError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Envelope::Flush(done_tx))
            .map_err(|_| PublishError::Closed)?;
        done_rx.await.map_err(|_| PublishError::Closed)
    }
}

/// Always-running forward loop between the sequencer and the sampler.
#[derive(Debug)]
pub struct TriggerPublisher {
    handle: JoinHandle<usize>,
}

impl TriggerPublisher {
    pub fn spawn<S>(sink: S, shutdown: CancellationToken) -> (TriggerSender, Self)
    where
        S: TriggerSink + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(forward(rx, sink, shutdown));
        (TriggerSender { tx }, Self { handle })
    }

    /// Waits for the loop to exit and returns how many items it delivered.
    pub async fn join(self) -> usize {
        self.handle.await.unwrap_or_default()
    }
}

async fn forward<S: TriggerSink>(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    mut sink: S,
    shutdown: CancellationToken,
) -> usize {
    let mut delivered = 0;
    loop {
        tokio::select! {
            biased;
            envelope = rx.recv() => match envelope {
                Some(envelope) => delivered += handle(&mut sink, envelope).await,
                None => break,
            },
            _ = shutdown.cancelled() => {
                // Deliver what was already queued before leaving.
                while let Ok(envelope) = rx.try_recv() {
                    delivered += handle(&mut sink, envelope).await;
                }
                break;
            }
        }
    }
    debug!(delivered, "trigger publisher stopped");
    delivered
}

async fn handle<S: TriggerSink>(sink: &mut S, envelope: Envelope) -> usize {
    match envelope {
        Envelope::Item(item) => match sink.deliver(item).await {
            Ok(()) => 1,
            Err(err) => {
                error!(error = %err, "failed to deliver downstream item");
                0
            }
        },
        Envelope::Flush(done) => {
            if done.send(()).is_err() {
                debug!("flush waiter gave up before the queue drained");
            }
            0
        }
    }
}
