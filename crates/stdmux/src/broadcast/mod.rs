//! Output broadcaster: one container output source, many attached sinks.
//!
//! Every chunk the container produces is appended to a bounded backlog and
//! queued to each attached sink whose stream selection includes it. A sink
//! attached later first receives the backlog, then live output, so each sink
//! sees every byte exactly once regardless of when it attached.
//!
//! The sink set lives behind a short mutex: it is held to append to the
//! backlog, snapshot the targets, or change the set, never across a write.
//! Writes happen in one task per sink (see [`sink`]), and a producer waits at
//! most `send_timeout` for a full sink queue before that sink alone is dropped.

mod backlog;
mod sink;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio_util::bytes::Bytes;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::mux::{Frame, OutputCodec, StreamKind, StreamMode, StreamSelection};
use backlog::Backlog;
use sink::{OutcomeSlot, SinkWriter};

pub use sink::{SinkError, SinkId, SinkOutcome};

/// Default replay buffer size per container.
pub const DEFAULT_BACKLOG_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Bytes of output kept for replay to late attachers.
    pub backlog_limit: usize,
    /// Chunks queued per sink before the producer has to wait.
    pub sink_queue_depth: usize,
    /// How long a producer waits on a full sink queue before dropping the sink.
    pub send_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            sink_queue_depth: 64,
            send_timeout: Duration::from_secs(10),
        }
    }
}

impl BroadcastConfig {
    pub fn with_backlog_limit(mut self, bytes: usize) -> Self {
        self.backlog_limit = bytes;
        self
    }

    pub fn with_sink_queue_depth(mut self, depth: usize) -> Self {
        self.sink_queue_depth = depth.max(1);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }
}

/// Why the output source ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReason {
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl ExitReason {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            error: None,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            error: Some(error.into()),
            finished_at: Utc::now(),
        }
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::exited(code),
            None => Self::failed(format!("process terminated: {status}")),
        }
    }

    pub(crate) fn source_dropped() -> Self {
        Self::failed("output source dropped without close")
    }

    /// Exit code as reported to clients; -1 when the process has none.
    pub fn status_code(&self) -> i64 {
        self.exit_code.map(i64::from).unwrap_or(-1)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("broadcaster is closed")]
pub struct BroadcasterClosed;

struct SinkEntry {
    tx: mpsc::Sender<Frame>,
    selection: StreamSelection,
    cancel: CancellationToken,
    outcome: OutcomeSlot,
}

struct State {
    backlog: Backlog,
    sinks: HashMap<SinkId, SinkEntry>,
    exit: Option<ExitReason>,
}

pub(crate) struct Shared {
    config: BroadcastConfig,
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Broadcaster state mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    fn exit_reason(&self) -> Option<ExitReason> {
        self.lock().exit.clone()
    }

    fn remove_sink(&self, id: SinkId) -> Option<SinkEntry> {
        self.lock().sinks.remove(&id)
    }
}

/// Fans one container's output out to any number of sinks.
///
/// Cheap to clone; clones share the same backlog and sink set.
#[derive(Clone)]
pub struct OutputBroadcaster {
    shared: Arc<Shared>,
}

impl Default for OutputBroadcaster {
    fn default() -> Self {
        Self::new(BroadcastConfig::default())
    }
}

impl std::fmt::Debug for OutputBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("OutputBroadcaster")
            .field("sinks", &state.sinks.len())
            .field("backlog_bytes", &state.backlog.bytes())
            .field("closed", &state.exit.is_some())
            .finish()
    }
}

impl OutputBroadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        let backlog = Backlog::new(config.backlog_limit);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State {
                    backlog,
                    sinks: HashMap::new(),
                    exit: None,
                }),
            }),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.shared.config
    }

    /// Register a sink. It receives the backlog, then live output, then one
    /// end-of-stream when the broadcaster closes.
    ///
    /// Attaching to a closed broadcaster replays the backlog and ends at once.
    /// Must be called within a tokio runtime.
    pub fn attach<W>(&self, sink: W, selection: StreamSelection, mode: StreamMode) -> SinkHandle
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let id = SinkId::new();
        let (tx, rx) = mpsc::channel(self.shared.config.sink_queue_depth.max(1));
        let cancel = CancellationToken::new();
        let (outcome, outcome_rx) = OutcomeSlot::new();

        let replay = {
            let mut state = self.shared.lock();
            let replay = state.backlog.snapshot(selection);
            if state.exit.is_none() {
                state.sinks.insert(
                    id,
                    SinkEntry {
                        tx,
                        selection,
                        cancel: cancel.clone(),
                        outcome: outcome.clone(),
                    },
                );
            } else {
                // No live output will follow; the writer ends after the replay.
                drop(tx);
            }
            replay
        };

        tracing::debug!(
            sink = %id,
            ?mode,
            stdout = selection.stdout,
            stderr = selection.stderr,
            replayed_frames = replay.len(),
            "Sink attached"
        );

        let writer = SinkWriter {
            id,
            framed: FramedWrite::new(sink, OutputCodec::new(mode)),
            replay,
            rx,
            cancel,
            outcome,
            shared: Arc::downgrade(&self.shared),
        };
        tokio::spawn(writer.run());

        SinkHandle {
            id,
            outcome: outcome_rx,
            broadcaster: self.clone(),
        }
    }

    /// Unregister a sink. Idempotent; returns whether the sink was attached.
    ///
    /// A write in flight to this sink is abandoned; other sinks are untouched.
    pub fn detach(&self, id: SinkId) -> bool {
        match self.shared.remove_sink(id) {
            Some(entry) => {
                entry.outcome.settle(SinkOutcome::Detached);
                entry.cancel.cancel();
                tracing::debug!(sink = %id, "Sink detached");
                true
            }
            None => false,
        }
    }

    fn fail_sink(&self, id: SinkId, error: SinkError) {
        if let Some(entry) = self.shared.remove_sink(id) {
            tracing::warn!(sink = %id, error = %error, "Dropping sink");
            entry.outcome.settle(SinkOutcome::Failed(error));
            entry.cancel.cancel();
        }
    }

    /// Record a chunk of output and queue it to every interested sink.
    ///
    /// Waits at most `send_timeout` for sinks with full queues, all sinks in
    /// parallel; a sink that stays full is dropped with `BackpressureTimeout`.
    pub async fn publish(&self, kind: StreamKind, payload: Bytes) -> Result<(), BroadcasterClosed> {
        if payload.is_empty() {
            return Ok(());
        }
        let frame = Frame::new(kind, payload);

        let targets: Vec<(SinkId, mpsc::Sender<Frame>)> = {
            let mut state = self.shared.lock();
            if state.exit.is_some() {
                return Err(BroadcasterClosed);
            }
            state.backlog.push(frame.clone());
            state
                .sinks
                .iter()
                .filter(|(_, entry)| entry.selection.includes(kind))
                .map(|(id, entry)| (*id, entry.tx.clone()))
                .collect()
        };

        if targets.is_empty() {
            return Ok(());
        }

        let timeout = self.shared.config.send_timeout;
        let sends = targets.into_iter().map(|(id, tx)| {
            let frame = frame.clone();
            async move { (id, tx.send_timeout(frame, timeout).await) }
        });

        for (id, result) in join_all(sends).await {
            match result {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    self.fail_sink(id, SinkError::BackpressureTimeout(timeout));
                }
                Err(SendTimeoutError::Closed(_)) => {
                    // Writer already gone; it recorded its own outcome.
                    tracing::trace!(sink = %id, "Sink queue closed");
                    self.shared.remove_sink(id);
                }
            }
        }
        Ok(())
    }

    /// End the stream. Queued output is flushed to every attached sink, each
    /// of which then receives exactly one end-of-stream.
    ///
    /// Only the first call has any effect; returns whether this call closed.
    pub fn close(&self, reason: ExitReason) -> bool {
        let sinks = {
            let mut state = self.shared.lock();
            if state.exit.is_some() {
                return false;
            }
            state.exit = Some(reason.clone());
            std::mem::take(&mut state.sinks)
        };

        tracing::info!(
            sinks = sinks.len(),
            exit_code = ?reason.exit_code,
            error = ?reason.error,
            "Closing output broadcaster"
        );
        // Dropping the senders lets each writer drain its queue and finish.
        drop(sinks);
        true
    }

    /// Copy of the backlog, for one-shot (non-streaming) consumers.
    pub fn snapshot(&self, selection: StreamSelection) -> Vec<Frame> {
        self.shared.lock().backlog.snapshot(selection)
    }

    pub fn sink_count(&self) -> usize {
        self.shared.lock().sinks.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().exit.is_some()
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.shared.exit_reason()
    }

    pub fn backlog_bytes(&self) -> usize {
        self.shared.lock().backlog.bytes()
    }
}

/// An attached sink's registration.
///
/// Dropping the handle does not detach the sink.
pub struct SinkHandle {
    id: SinkId,
    outcome: watch::Receiver<Option<SinkOutcome>>,
    broadcaster: OutputBroadcaster,
}

impl SinkHandle {
    pub fn id(&self) -> SinkId {
        self.id
    }

    /// The outcome, if delivery has finished.
    pub fn outcome(&self) -> Option<SinkOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait until delivery to this sink has finished.
    pub async fn finished(&mut self) -> SinkOutcome {
        let outcome = match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            SinkOutcome::Failed(SinkError::Transport(
                "sink writer exited without reporting an outcome".to_string(),
            ))
        })
    }

    pub fn detach(&self) -> bool {
        self.broadcaster.detach(self.id)
    }
}
