//! Attach sessions: one client's attachment to one container.
//!
//! ```text
//! Requested ──► WaitingForStart ──► Streaming ──► Closed
//!     │               │
//!     └───────────────┴──► Failed
//! ```
//!
//! A session attached before the container starts suspends on the container's
//! run-state watch. Once the container is running (or has already exited) the
//! session registers its transport's write half with the output broadcaster,
//! whose backlog covers anything produced before the attach.
//!
//! The read half is watched for the whole session: input goes to the
//! container's stdin when requested and is discarded otherwise, and end of
//! input from the client detaches the session.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::broadcast::{ExitReason, SinkError, SinkOutcome};
use crate::container::{ContainerIo, RunState};
use crate::mux::StreamSelection;
use crate::transport::AttachStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Requested,
    WaitingForStart,
    Streaming,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Streams a client asked for, and whether to keep the stream open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct AttachOptions {
    #[serde(default)]
    pub stdin: bool,
    #[serde(default)]
    pub stdout: bool,
    #[serde(default)]
    pub stderr: bool,
    #[serde(default)]
    pub stream: bool,
}

impl AttachOptions {
    /// Stream stdout and stderr, no input.
    pub fn output() -> Self {
        Self {
            stdin: false,
            stdout: true,
            stderr: true,
            stream: true,
        }
    }

    pub fn with_stdin(mut self, stdin: bool) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn with_streams(mut self, stdout: bool, stderr: bool) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn selection(&self) -> StreamSelection {
        StreamSelection::new(self.stdout, self.stderr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    #[error("no such container: {0}")]
    ContainerNotFound(String),
    #[error("container {0} was removed before it started")]
    ContainerRemoved(String),
    #[error("container {id} never started: {error}")]
    NeverStarted { id: String, error: String },
    #[error("attach cancelled")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("client accepted no output within {0:?}")]
    BackpressureTimeout(Duration),
}

impl From<SinkError> for AttachError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Transport(msg) => Self::Transport(msg),
            SinkError::BackpressureTimeout(timeout) => Self::BackpressureTimeout(timeout),
        }
    }
}

/// Why a streaming session ended normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ContainerExited(ExitReason),
    Detached,
    /// The client closed its side of the transport.
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub reason: CloseReason,
    pub stdin_bytes: u64,
}

pub struct AttachSession {
    id: SessionId,
    container: Arc<ContainerIo>,
    options: AttachOptions,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl AttachSession {
    pub fn new(container: Arc<ContainerIo>, options: AttachOptions) -> Self {
        let (state, _) = watch::channel(SessionState::Requested);
        Self {
            id: SessionId::new(),
            container,
            options,
            state,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn options(&self) -> AttachOptions {
        self.options
    }

    pub fn container(&self) -> &Arc<ContainerIo> {
        &self.container
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Token that detaches this session (or abandons its wait) when
    /// cancelled. Never affects the container process.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        tracing::debug!(
            session_id = %self.id,
            container_id = %self.container.id(),
            from = ?prev,
            to = ?next,
            "Attach session state change"
        );
    }

    fn fail(&self, err: AttachError) -> AttachError {
        self.set_state(SessionState::Failed);
        tracing::info!(
            session_id = %self.id,
            container_id = %self.container.id(),
            error = %err,
            "Attach failed"
        );
        err
    }

    /// `Ok(false)` while the container has yet to start.
    fn start_outcome(&self, state: &RunState) -> Result<bool, AttachError> {
        match state {
            RunState::Created => Ok(false),
            RunState::Running { .. } => Ok(true),
            RunState::Exited(_) if self.container.has_launched() => Ok(true),
            RunState::Exited(reason) => Err(AttachError::NeverStarted {
                id: self.container.id().to_string(),
                error: reason.error.clone().unwrap_or_default(),
            }),
            RunState::Removed => Err(AttachError::ContainerRemoved(
                self.container.id().to_string(),
            )),
        }
    }

    async fn wait_for_start(&self) -> Result<(), AttachError> {
        let mut states = self.container.subscribe();
        let current = states.borrow_and_update().clone();
        if self.start_outcome(&current).map_err(|e| self.fail(e))? {
            return Ok(());
        }

        self.set_state(SessionState::WaitingForStart);
        let settled = async {
            states
                .wait_for(|state| !matches!(state, RunState::Created))
                .await
                .map(|state| (*state).clone())
                .unwrap_or(RunState::Removed)
        };

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(AttachError::Cancelled),
            state = settled => self.start_outcome(&state).map(|_| ()),
        };
        outcome.map_err(|e| self.fail(e))
    }

    /// Drive the session over `transport` until the container's output ends,
    /// the session is cancelled, or the transport fails.
    pub async fn run<T: AttachStream>(self, transport: T) -> Result<SessionSummary, AttachError> {
        tracing::debug!(
            session_id = %self.id,
            container_id = %self.container.id(),
            options = ?self.options,
            "Attach requested"
        );
        self.wait_for_start().await?;

        let (reader, writer) = tokio::io::split(transport);
        let broadcaster = self.container.output().clone();
        self.set_state(SessionState::Streaming);
        let mut sink = broadcaster.attach(
            writer,
            self.options.selection(),
            self.container.stream_mode(),
        );
        let sink_id = sink.id();

        let forward = self.options.stdin && self.container.open_stdin();
        let input_done = CancellationToken::new();
        let hangup = CancellationToken::new();
        let input_task = tokio::spawn(read_client_input(
            Arc::clone(&self.container),
            reader,
            forward,
            input_done.clone(),
            hangup.clone(),
        ));

        let mut disconnected = false;
        let outcome = tokio::select! {
            biased;
            outcome = sink.finished() => outcome,
            _ = self.cancel.cancelled() => {
                broadcaster.detach(sink_id);
                SinkOutcome::Detached
            }
            _ = hangup.cancelled() => {
                broadcaster.detach(sink_id);
                disconnected = true;
                SinkOutcome::Detached
            }
        };

        input_done.cancel();
        let stdin_bytes = input_task.await.unwrap_or_default();

        self.set_state(SessionState::Closed);
        let reason = match outcome {
            SinkOutcome::Ended(exit) => CloseReason::ContainerExited(exit),
            SinkOutcome::Detached if disconnected => CloseReason::Disconnected,
            SinkOutcome::Detached => CloseReason::Detached,
            SinkOutcome::Failed(err) => {
                tracing::warn!(
                    session_id = %self.id,
                    container_id = %self.container.id(),
                    error = %err,
                    "Attach session closed by transport"
                );
                return Err(err.into());
            }
        };

        tracing::info!(
            session_id = %self.id,
            container_id = %self.container.id(),
            reason = ?reason,
            stdin_bytes,
            "Attach session closed"
        );
        Ok(SessionSummary {
            session_id: self.id,
            reason,
            stdin_bytes,
        })
    }
}

/// Read the client's side of the transport until the session ends.
///
/// With `forward` set, input is copied to the container's stdin until that
/// stops accepting it; anything else is discarded. End of input or a read
/// error cancels `hangup`. Returns the number of bytes forwarded.
async fn read_client_input<R>(
    container: Arc<ContainerIo>,
    reader: R,
    mut forward: bool,
    done: CancellationToken,
    hangup: CancellationToken,
) -> u64
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut input = FramedRead::new(reader, BytesCodec::new());
    let mut forwarded = 0u64;

    loop {
        let chunk = tokio::select! {
            _ = done.cancelled() => break,
            chunk = input.next() => chunk,
        };
        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                tracing::debug!(container_id = %container.id(), error = %e, "Reading client input failed");
                hangup.cancel();
                break;
            }
            None => {
                tracing::debug!(container_id = %container.id(), forwarded, "Client closed its input");
                hangup.cancel();
                break;
            }
        };
        if !forward {
            continue;
        }
        match container.write_stdin(&bytes).await {
            Ok(()) => forwarded += bytes.len() as u64,
            Err(e) => {
                tracing::debug!(container_id = %container.id(), error = %e, "Writing container stdin failed");
                forward = false;
            }
        }
    }
    forwarded
}
