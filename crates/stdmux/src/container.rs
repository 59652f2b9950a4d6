//! Per-container I/O state: output broadcaster, run state, stdin.
//!
//! A `ContainerIo` exists from creation, before any process runs, so attach
//! requests can be accepted at any point in the container's life. The run
//! state is published on a watch channel; sessions waiting for start suspend
//! on it instead of polling.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{BytesCodec, FramedRead};

use crate::broadcast::{BroadcastConfig, ExitReason, OutputBroadcaster};
use crate::mux::{StreamKind, StreamMode};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Container lifecycle as seen by attach sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunState {
    Created,
    Running { started_at: DateTime<Utc> },
    Exited(ExitReason),
    Removed,
}

impl RunState {
    /// Running or exited: the process has produced (or will produce) output.
    pub fn has_started(&self) -> bool {
        matches!(self, Self::Running { .. } | Self::Exited(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running { .. } => "running",
            Self::Exited(_) => "exited",
            Self::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Fixed at creation; selects raw or multiplexed output for every attach.
    pub tty: bool,
    pub open_stdin: bool,
    pub command: Vec<String>,
    pub broadcast: BroadcastConfig,
}

impl ContainerConfig {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    pub fn with_open_stdin(mut self, open_stdin: bool) -> Self {
        self.open_stdin = open_stdin;
        self
    }

    pub fn with_broadcast(mut self, broadcast: BroadcastConfig) -> Self {
        self.broadcast = broadcast;
        self
    }
}

/// Standard streams and exit of a launched process.
///
/// Under a TTY the process has one combined output; launchers may still
/// report two sources, both of which are then published as stdout. Chunks
/// from either source reach the broadcaster in a single sequence.
pub struct ProcessIo {
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
    pub stdin: Option<BoxedWriter>,
    pub exit: BoxFuture<'static, ExitReason>,
}

pub struct ContainerIo {
    id: String,
    config: ContainerConfig,
    output: OutputBroadcaster,
    state: watch::Sender<RunState>,
    stdin: Mutex<Option<BoxedWriter>>,
    start_claimed: AtomicBool,
    launched: AtomicBool,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for ContainerIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerIo")
            .field("id", &self.id)
            .field("tty", &self.config.tty)
            .field("state", &self.state.borrow().as_str())
            .finish()
    }
}

impl ContainerIo {
    pub fn new(id: impl Into<String>, config: ContainerConfig) -> Arc<Self> {
        let (state, _) = watch::channel(RunState::Created);
        Arc::new(Self {
            id: id.into(),
            output: OutputBroadcaster::new(config.broadcast.clone()),
            config,
            state,
            stdin: Mutex::new(None),
            start_claimed: AtomicBool::new(false),
            launched: AtomicBool::new(false),
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn tty(&self) -> bool {
        self.config.tty
    }

    pub fn open_stdin(&self) -> bool {
        self.config.open_stdin
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn stream_mode(&self) -> StreamMode {
        StreamMode::from_tty(self.config.tty)
    }

    pub fn output(&self) -> &OutputBroadcaster {
        &self.output
    }

    pub fn run_state(&self) -> RunState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Reserve the right to launch this container's process. Only the first
    /// caller on a `Created` container gets `true`; the state itself stays
    /// `Created` until the process is actually running.
    pub fn claim_start(&self) -> bool {
        matches!(*self.state.borrow(), RunState::Created)
            && !self.start_claimed.swap(true, Ordering::SeqCst)
    }

    /// Whether a process was ever running. False for a container whose launch
    /// failed, even once it reports `Exited`.
    pub fn has_launched(&self) -> bool {
        self.launched.load(Ordering::SeqCst)
    }

    /// `Created -> Running`. Returns false if the container was not in
    /// `Created`.
    pub fn mark_running(&self) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if matches!(state, RunState::Created) {
                self.launched.store(true, Ordering::SeqCst);
                *state = RunState::Running {
                    started_at: Utc::now(),
                };
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(container_id = %self.id, "Container running");
        }
        changed
    }

    pub fn mark_exited(&self, reason: ExitReason) -> bool {
        let exit_code = reason.exit_code;
        let changed = self.state.send_if_modified(move |state| {
            if matches!(state, RunState::Created | RunState::Running { .. }) {
                *state = RunState::Exited(reason);
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(container_id = %self.id, ?exit_code, "Container exited");
        }
        changed
    }

    /// `Created -> Exited` for a process that never ran. Output ends and
    /// sessions waiting for start fail.
    pub fn fail_start(&self, reason: ExitReason) -> bool {
        self.output.close(reason.clone());
        let failed = self.mark_exited(reason);
        if failed {
            tracing::warn!(container_id = %self.id, "Container never started");
        }
        failed
    }

    /// Mark removed and end all output. Sessions still waiting for start fail
    /// with `ContainerRemoved`.
    pub fn mark_removed(&self) {
        self.output.close(ExitReason::failed("container removed"));
        self.state.send_replace(RunState::Removed);
        tracing::info!(container_id = %self.id, "Container removed");
    }

    /// Wait for the process to exit. `None` if the container is removed first.
    pub async fn wait_exit(&self) -> Option<ExitReason> {
        let mut states = self.state.subscribe();
        let state = states
            .wait_for(|state| matches!(state, RunState::Exited(_) | RunState::Removed))
            .await
            .ok()
            .map(|state| state.clone());
        match state {
            Some(RunState::Exited(reason)) => Some(reason),
            _ => None,
        }
    }

    pub async fn write_stdin(&self, data: &[u8]) -> io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        let writer = stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stdin is not open"))?;
        writer.write_all(data).await?;
        writer.flush().await
    }

    /// Close the process's stdin, signalling end of input.
    pub async fn close_stdin(&self) {
        if let Some(mut writer) = self.stdin.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(container_id = %self.id, error = %e, "Closing stdin failed");
            }
        }
    }

    /// Take ownership of a launched process's streams.
    ///
    /// Marks the container running, pumps every output source into the
    /// broadcaster from one task, and once all sources are exhausted and the
    /// process has exited, closes the broadcaster and marks the container
    /// exited.
    pub async fn attach_process(self: &Arc<Self>, process: ProcessIo) -> JoinHandle<ExitReason> {
        let ProcessIo {
            stdout,
            stderr,
            stdin,
            exit,
        } = process;

        if self.config.open_stdin {
            *self.stdin.lock().await = stdin;
        }
        self.mark_running();

        // A TTY merges both streams into one.
        let stderr_kind = if self.config.tty {
            StreamKind::Stdout
        } else {
            StreamKind::Stderr
        };
        let sources: Vec<_> = [(stdout, StreamKind::Stdout), (stderr, stderr_kind)]
            .into_iter()
            .filter_map(|(source, kind)| source.map(|source| tagged(source, kind)))
            .collect();
        let pump = pump_output(
            self.output.clone(),
            futures::stream::select_all(sources),
            self.id.clone(),
        );

        let container = Arc::clone(self);
        tokio::spawn(async move {
            let pumped = pump.await;
            let reason = exit.await;
            container.stdin.lock().await.take();

            tracing::debug!(container_id = %container.id, pumped, "Output sources exhausted");
            container.output.close(reason.clone());
            container.mark_exited(reason.clone());
            reason
        })
    }
}

fn tagged(
    source: BoxedReader,
    kind: StreamKind,
) -> impl Stream<Item = (StreamKind, io::Result<BytesMut>)> + Send + Unpin {
    FramedRead::new(source, BytesCodec::new()).map(move |chunk| (kind, chunk))
}

/// Publish chunks from every source, in the order they are read, until all
/// sources end. A source that fails to read ends on its own.
async fn pump_output<S>(output: OutputBroadcaster, mut chunks: S, container_id: String) -> u64
where
    S: Stream<Item = (StreamKind, io::Result<BytesMut>)> + Unpin,
{
    let mut pumped = 0u64;

    while let Some((kind, chunk)) = chunks.next().await {
        match chunk {
            Ok(bytes) => {
                pumped += bytes.len() as u64;
                if output.publish(kind, bytes.freeze()).await.is_err() {
                    tracing::debug!(container_id, stream = %kind, "Broadcaster closed, stopping pump");
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(container_id, stream = %kind, error = %e, "Reading container output failed");
            }
        }
    }
    tracing::trace!(container_id, pumped, "Output pump finished");
    pumped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::StreamSelection;
    use crate::testing::{RecordingSink, fake_process, finished_process};
    use tokio::io::AsyncReadExt;

    fn joined(container: &ContainerIo, selection: StreamSelection) -> Vec<u8> {
        container
            .output()
            .snapshot(selection)
            .iter()
            .flat_map(|f| f.payload.to_vec())
            .collect()
    }

    #[test]
    fn run_state_serializes_with_status_tag() {
        insta::assert_json_snapshot!(
            [RunState::Created, RunState::Removed],
            @r#"
        [
          {
            "status": "created"
          },
          {
            "status": "removed"
          }
        ]
        "#
        );
    }

    #[test]
    fn start_guard_only_fires_once() {
        let container = ContainerIo::new("c1", ContainerConfig::default());
        assert!(container.mark_running());
        assert!(!container.mark_running());
        assert!(container.run_state().has_started());
    }

    #[test]
    fn start_is_claimed_once_and_only_while_created() {
        let container = ContainerIo::new("c1", ContainerConfig::default());
        assert!(container.claim_start());
        assert!(!container.claim_start());
        assert_eq!(container.run_state(), RunState::Created);

        let removed = ContainerIo::new("c2", ContainerConfig::default());
        removed.mark_removed();
        assert!(!removed.claim_start());
    }

    #[tokio::test]
    async fn failed_start_exits_without_launching() {
        let container = ContainerIo::new("c1", ContainerConfig::default());
        assert!(container.claim_start());
        assert!(container.fail_start(ExitReason::failed("no such program")));

        assert!(!container.has_launched());
        assert!(container.output().is_closed());
        let reason = container.wait_exit().await.unwrap();
        assert_eq!(reason.error.as_deref(), Some("no such program"));
    }

    #[test]
    fn exit_is_not_reported_after_removal() {
        let container = ContainerIo::new("c1", ContainerConfig::default());
        container.mark_removed();
        assert!(!container.mark_exited(ExitReason::exited(0)));
        assert_eq!(container.run_state(), RunState::Removed);
        assert!(container.output().is_closed());
    }

    #[tokio::test]
    async fn process_output_reaches_broadcaster_and_closes_it() {
        let container = ContainerIo::new("c1", ContainerConfig::default());
        let task = container
            .attach_process(finished_process(b"hello", b"oops", 4))
            .await;

        let reason = task.await.unwrap();
        assert_eq!(reason.exit_code, Some(4));
        assert!(container.output().is_closed());
        assert_eq!(joined(&container, StreamSelection::new(true, false)), b"hello");
        assert_eq!(joined(&container, StreamSelection::new(false, true)), b"oops");
        assert_eq!(container.wait_exit().await.unwrap().exit_code, Some(4));
    }

    #[tokio::test]
    async fn tty_publishes_stderr_as_stdout() {
        let container = ContainerIo::new("c1", ContainerConfig::default().with_tty(true));
        assert_eq!(container.stream_mode(), StreamMode::Raw);
        container
            .attach_process(finished_process(b"", b"merged", 0))
            .await
            .await
            .unwrap();

        assert_eq!(joined(&container, StreamSelection::new(true, false)), b"merged");
        assert!(joined(&container, StreamSelection::new(false, true)).is_empty());
    }

    #[tokio::test]
    async fn tty_live_output_matches_backlog_order() {
        let container = ContainerIo::new("c1", ContainerConfig::default().with_tty(true));
        let (sink, recorder) = RecordingSink::new();
        let mut handle = container
            .output()
            .attach(sink, StreamSelection::ALL, StreamMode::Raw);

        let (io, mut fake) = fake_process();
        let task = container.attach_process(io).await;
        assert!(container.has_launched());
        for i in 0..20 {
            if i % 2 == 0 {
                fake.stdout(&format!("o{i} ")).await;
            } else {
                fake.stderr(&format!("e{i} ")).await;
            }
            tokio::task::yield_now().await;
        }
        fake.exit(0);
        task.await.unwrap();

        assert!(handle.finished().await.is_ended());
        assert_eq!(recorder.bytes(), joined(&container, StreamSelection::ALL));
        assert_eq!(recorder.bytes().len(), 70);
    }

    #[tokio::test]
    async fn wait_exit_returns_none_on_removal() {
        let container = ContainerIo::new("c1", ContainerConfig::default());
        let waiter = {
            let container = Arc::clone(&container);
            tokio::spawn(async move { container.wait_exit().await })
        };
        tokio::task::yield_now().await;
        container.mark_removed();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stdin_is_forwarded_only_when_open() {
        let closed = ContainerIo::new("closed", ContainerConfig::default());
        let (io, _fake) = fake_process();
        let _task = closed.attach_process(io).await;
        let err = closed.write_stdin(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let open = ContainerIo::new("open", ContainerConfig::default().with_open_stdin(true));
        let (io, mut fake) = fake_process();
        let _task = open.attach_process(io).await;
        open.write_stdin(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        fake.stdin().read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        fake.exit(0);
    }
}
