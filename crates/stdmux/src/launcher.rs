//! Process launching for container start.
//!
//! The launcher is the extension point between the attach machinery and
//! whatever actually runs the container process. `CommandLauncher` runs the
//! command as a local child process with piped standard streams.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::broadcast::ExitReason;
use crate::container::{BoxedReader, BoxedWriter, ContainerIo, ProcessIo};

/// What to launch for a container.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub container_id: String,
    pub command: Vec<String>,
    pub tty: bool,
    pub open_stdin: bool,
}

impl LaunchSpec {
    pub fn for_container(container: &ContainerIo) -> Self {
        let config = container.config();
        Self {
            container_id: container.id().to_string(),
            command: config.command.clone(),
            tty: config.tty,
            open_stdin: config.open_stdin,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("container has no command to run")]
    EmptyCommand,
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessIo, LaunchError>;
}

/// Runs the container command as a local child process.
///
/// No pseudo-terminal is allocated: under TTY mode both pipes are read and
/// published as one stdout stream.
#[derive(Debug, Clone, Default)]
pub struct CommandLauncher {
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessIo, LaunchError> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or(LaunchError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.open_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: program.clone(),
            source,
        })?;

        tracing::info!(
            container_id = %spec.container_id,
            pid = ?child.id(),
            program = %program,
            "Launched container process"
        );

        let stdout = child.stdout.take().map(|s| Box::new(s) as BoxedReader);
        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxedReader);
        let stdin = child.stdin.take().map(|s| Box::new(s) as BoxedWriter);

        let container_id = spec.container_id.clone();
        let exit = Box::pin(async move {
            match child.wait().await {
                Ok(status) => ExitReason::from_status(status),
                Err(e) => {
                    tracing::error!(container_id, error = %e, "Failed to wait for container process");
                    ExitReason::failed(format!("wait failed: {e}"))
                }
            }
        });

        Ok(ProcessIo {
            stdout,
            stderr,
            stdin,
            exit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &[&str]) -> LaunchSpec {
        LaunchSpec {
            container_id: "test".to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let err = CommandLauncher::new().launch(&spec(&[])).await.err().unwrap();
        assert!(matches!(err, LaunchError::EmptyCommand));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = CommandLauncher::new()
            .launch(&spec(&["/nonexistent/stdmux-test-binary"]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LaunchError::Spawn { .. }), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_streams_and_exit_code_are_captured() {
        use tokio::io::AsyncReadExt;

        let process = CommandLauncher::new()
            .with_env("GREETING", "hello")
            .launch(&spec(&["sh", "-c", "printf \"$GREETING\"; printf oops >&2; exit 3"]))
            .await
            .unwrap();

        let mut stdout = String::new();
        process
            .stdout
            .unwrap()
            .read_to_string(&mut stdout)
            .await
            .unwrap();
        let mut stderr = String::new();
        process
            .stderr
            .unwrap()
            .read_to_string(&mut stderr)
            .await
            .unwrap();

        assert_eq!(stdout, "hello");
        assert_eq!(stderr, "oops");
        assert!(process.stdin.is_none());
        assert_eq!(process.exit.await.exit_code, Some(3));
    }
}
