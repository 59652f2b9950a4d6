//! Per-sink delivery task.
//!
//! Each attached sink gets its own writer task fed by a bounded queue, so a
//! slow or broken consumer only ever stalls itself.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use super::{ExitReason, Shared};
use crate::mux::{CodecError, Frame, OutputCodec};

/// Identifier of one attached sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(uuid::Uuid);

impl SinkId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("sink accepted no data within {0:?}")]
    BackpressureTimeout(Duration),
}

/// How a sink's delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOutcome {
    /// Broadcaster closed; queued bytes were flushed and the stream ended.
    Ended(ExitReason),
    /// Removed by `detach`.
    Detached,
    /// Detached because of its own write failure or backpressure.
    Failed(SinkError),
}

impl SinkOutcome {
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended(_))
    }
}

/// Write-once outcome cell shared by the writer task and the broadcaster.
#[derive(Debug, Clone)]
pub(crate) struct OutcomeSlot(Arc<watch::Sender<Option<SinkOutcome>>>);

impl OutcomeSlot {
    pub fn new() -> (Self, watch::Receiver<Option<SinkOutcome>>) {
        let (tx, rx) = watch::channel(None);
        (Self(Arc::new(tx)), rx)
    }

    /// Record the outcome unless one was already recorded.
    pub fn settle(&self, outcome: SinkOutcome) -> bool {
        self.0.send_if_modified(move |slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        })
    }
}

pub(crate) struct SinkWriter<W> {
    pub id: SinkId,
    pub framed: FramedWrite<W, OutputCodec>,
    pub replay: Vec<Frame>,
    pub rx: mpsc::Receiver<Frame>,
    pub cancel: CancellationToken,
    pub outcome: OutcomeSlot,
    pub shared: Weak<Shared>,
}

impl<W> SinkWriter<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub async fn run(self) {
        let SinkWriter {
            id,
            mut framed,
            replay,
            mut rx,
            cancel,
            outcome,
            shared,
        } = self;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = drive(&mut framed, replay, &mut rx) => Some(result),
        };

        match result {
            None => {
                // Any in-flight write was abandoned with the drive future.
                tracing::debug!(sink = %id, "Sink writer stopped after detach");
                outcome.settle(SinkOutcome::Detached);
            }
            Some(Ok(delivered)) => {
                let reason = shared
                    .upgrade()
                    .and_then(|shared| shared.exit_reason())
                    .unwrap_or_else(ExitReason::source_dropped);
                tracing::debug!(sink = %id, delivered, "Sink reached end of stream");
                outcome.settle(SinkOutcome::Ended(reason));
            }
            Some(Err(e)) => {
                tracing::warn!(sink = %id, error = %e, "Sink write failed, detaching");
                if let Some(shared) = shared.upgrade() {
                    shared.remove_sink(id);
                }
                outcome.settle(SinkOutcome::Failed(SinkError::Transport(e.to_string())));
            }
        }
    }
}

/// Replay the backlog, forward live frames until the queue closes, then end
/// the stream. Returns the number of frames written.
async fn drive<W>(
    framed: &mut FramedWrite<W, OutputCodec>,
    replay: Vec<Frame>,
    rx: &mut mpsc::Receiver<Frame>,
) -> Result<usize, CodecError>
where
    W: AsyncWrite + Unpin,
{
    let mut delivered = 0;

    if !replay.is_empty() {
        for frame in replay {
            framed.feed(frame).await?;
            delivered += 1;
        }
        framed.flush().await?;
    }

    while let Some(frame) = rx.recv().await {
        framed.feed(frame).await?;
        delivered += 1;
        while let Ok(frame) = rx.try_recv() {
            framed.feed(frame).await?;
            delivered += 1;
        }
        framed.flush().await?;
    }

    // Queue closed by the broadcaster: flush and shut the writer down once.
    framed.close().await?;
    Ok(delivered)
}
