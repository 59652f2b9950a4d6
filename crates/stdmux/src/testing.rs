//! In-memory sinks, processes and launchers for unit tests.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::oneshot;

use crate::broadcast::ExitReason;
use crate::container::ProcessIo;
use crate::launcher::{LaunchError, LaunchSpec, ProcessLauncher};

#[derive(Debug, Default)]
struct Recorded {
    bytes: Vec<u8>,
    shutdowns: usize,
    writes_after_shutdown: usize,
}

/// Read side of a [`RecordingSink`].
#[derive(Debug, Clone, Default)]
pub(crate) struct Recorder(Arc<Mutex<Recorded>>);

impl Recorder {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().bytes.clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.0.lock().unwrap().shutdowns
    }

    pub fn writes_after_shutdown(&self) -> usize {
        self.0.lock().unwrap().writes_after_shutdown
    }
}

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Record,
    Fail,
    Stall,
}

/// AsyncWrite sink that records everything, fails every write, or never
/// accepts a byte.
pub(crate) struct RecordingSink {
    recorder: Recorder,
    behavior: Behavior,
}

impl RecordingSink {
    pub fn new() -> (Self, Recorder) {
        Self::with_behavior(Behavior::Record)
    }

    pub fn failing() -> (Self, Recorder) {
        Self::with_behavior(Behavior::Fail)
    }

    pub fn stalled() -> (Self, Recorder) {
        Self::with_behavior(Behavior::Stall)
    }

    fn with_behavior(behavior: Behavior) -> (Self, Recorder) {
        let recorder = Recorder::default();
        (
            Self {
                recorder: recorder.clone(),
                behavior,
            },
            recorder,
        )
    }
}

impl AsyncWrite for RecordingSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.behavior {
            Behavior::Fail => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "client went away",
            ))),
            Behavior::Stall => Poll::Pending,
            Behavior::Record => {
                let mut recorded = self.recorder.0.lock().unwrap();
                if recorded.shutdowns > 0 {
                    recorded.writes_after_shutdown += 1;
                }
                recorded.bytes.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.recorder.0.lock().unwrap().shutdowns += 1;
        Poll::Ready(Ok(()))
    }
}

/// Reads as a client that stays connected and never sends input, so the
/// sink can stand in for a whole connection.
impl AsyncRead for RecordingSink {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

/// Test-side handles of a process built by [`fake_process`].
pub(crate) struct FakeProcess {
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    stdin: DuplexStream,
    exit: Option<oneshot::Sender<ExitReason>>,
}

/// A process whose output the test writes by hand.
pub(crate) fn fake_process() -> (ProcessIo, FakeProcess) {
    let (stdout_tx, stdout_rx) = tokio::io::duplex(64 * 1024);
    let (stderr_tx, stderr_rx) = tokio::io::duplex(64 * 1024);
    let (stdin_tx, stdin_rx) = tokio::io::duplex(64 * 1024);
    let (exit_tx, exit_rx) = oneshot::channel();

    let io = ProcessIo {
        stdout: Some(Box::new(stdout_rx)),
        stderr: Some(Box::new(stderr_rx)),
        stdin: Some(Box::new(stdin_tx)),
        exit: Box::pin(async move {
            exit_rx
                .await
                .unwrap_or_else(|_| ExitReason::failed("fake process dropped"))
        }),
    };
    let fake = FakeProcess {
        stdout: Some(stdout_tx),
        stderr: Some(stderr_tx),
        stdin: stdin_rx,
        exit: Some(exit_tx),
    };
    (io, fake)
}

impl FakeProcess {
    pub async fn stdout(&mut self, data: &str) {
        self.stdout
            .as_mut()
            .unwrap()
            .write_all(data.as_bytes())
            .await
            .unwrap();
    }

    pub async fn stderr(&mut self, data: &str) {
        self.stderr
            .as_mut()
            .unwrap()
            .write_all(data.as_bytes())
            .await
            .unwrap();
    }

    /// Reader for whatever the container receives on stdin.
    pub fn stdin(&mut self) -> &mut DuplexStream {
        &mut self.stdin
    }

    /// Close both output pipes and report the exit code.
    pub fn exit(&mut self, code: i32) {
        self.stdout.take();
        self.stderr.take();
        if let Some(exit) = self.exit.take() {
            let _ = exit.send(ExitReason::exited(code));
        }
    }
}

/// A process that has already written its output and exited.
pub(crate) fn finished_process(stdout: &[u8], stderr: &[u8], code: i32) -> ProcessIo {
    ProcessIo {
        stdout: Some(Box::new(io::Cursor::new(stdout.to_vec()))),
        stderr: Some(Box::new(io::Cursor::new(stderr.to_vec()))),
        stdin: None,
        exit: Box::pin(futures::future::ready(ExitReason::exited(code))),
    }
}

/// Launcher that hands out [`finished_process`]es and counts launches.
#[derive(Debug, Default)]
pub(crate) struct StaticLauncher {
    stdout: Vec<u8>,
    exit_code: i32,
    fail: bool,
    launches: AtomicUsize,
}

impl StaticLauncher {
    pub fn new(stdout: &[u8], exit_code: i32) -> Self {
        Self {
            stdout: stdout.to_vec(),
            exit_code,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessLauncher for StaticLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessIo, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(LaunchError::Spawn {
                program: spec.command.first().cloned().unwrap_or_default(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such program"),
            });
        }
        Ok(finished_process(&self.stdout, b"", self.exit_code))
    }
}
