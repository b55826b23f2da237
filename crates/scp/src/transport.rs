//! Command channel seam
//!
//! A session needs exactly one thing from the outside world: a way to start
//! a command on the remote side and talk to its stdin/stdout. Authentication
//! happens before this point and is not our concern.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long a finished command gets to exit before it is killed
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Releases the remote command behind a channel
#[async_trait]
pub trait ChannelCloser: Send {
    /// Must tolerate being called more than once
    async fn close(&mut self) -> io::Result<()>;
}

/// Byte streams of one running remote command
pub struct CommandChannel {
    /// Remote stdout
    pub reader: BoxedReader,
    /// Remote stdin
    pub writer: BoxedWriter,
    pub closer: Box<dyn ChannelCloser>,
}

impl CommandChannel {
    pub fn new<R, W, C>(reader: R, writer: W, closer: C) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        C: ChannelCloser + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            closer: Box::new(closer),
        }
    }
}

/// Starts commands on an already-authenticated remote shell
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn start(&self, command: &str) -> io::Result<CommandChannel>;
}

/// Closer for channels that own nothing beyond their streams
pub struct NoopCloser;

#[async_trait]
impl ChannelCloser for NoopCloser {
    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs commands as a child process
///
/// With an empty `via` the command goes through `sh -c` on this machine.
/// Otherwise `via` is used as the argv prefix and the command is appended as
/// the final argument, e.g. `["ssh", "-p", "2222", "alice@host"]`; the
/// `ssh` client then owns authentication.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    via: Vec<String>,
}

impl ProcessRunner {
    pub fn new(via: Vec<String>) -> Self {
        Self { via }
    }

    /// Run commands on this machine
    pub fn local() -> Self {
        Self::default()
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = match self.via.split_first() {
            Some((program, args)) => {
                let mut cmd = Command::new(program);
                cmd.args(args).arg(remote);
                cmd
            }
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(remote);
                cmd
            }
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn start(&self, command: &str) -> io::Result<CommandChannel> {
        let mut child = self.command(command).spawn()?;
        tracing::debug!(command, pid = ?child.id(), "remote command started");

        let missing = |what: &str| {
            io::Error::new(io::ErrorKind::BrokenPipe, format!("child {what} not captured"))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(stderr = %line, "remote command");
                }
            });
        }

        Ok(CommandChannel::new(
            stdout,
            stdin,
            ChildCloser { child: Some(child) },
        ))
    }
}

/// Waits for the child to exit, killing it if it lingers
struct ChildCloser {
    child: Option<Child>,
}

#[async_trait]
impl ChannelCloser for ChildCloser {
    async fn close(&mut self) -> io::Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let waited = tokio::time::timeout(EXIT_GRACE, child.wait()).await;
        let status = match waited {
            Ok(status) => status?,
            Err(_) => {
                tracing::debug!(pid = ?child.id(), "remote command did not exit, killing");
                child.kill().await?;
                child.wait().await?
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "remote command exited with {status}"
            )))
        }
    }
}
