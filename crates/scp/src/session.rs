//! Transfer sessions
//!
//! A [`Session`] drives exactly one remote command. Downloads run the
//! source side (`-f`) and consume tokens until the peer hangs up; uploads run
//! the sink side (`-t`) and turn caller-supplied entries into control lines.
//!
//! Every control line is answered by one status byte before anything else is
//! sent. Breaking that alternation corrupts the stream for good, so all
//! protocol logic runs on the caller's task and only the raw transport read
//! happens in the background.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::codec::{self, token, Direction, RemoteEntry};
use crate::config::ScpConfig;
use crate::error::{BoxError, Result, ScpError};
use crate::reader::{AsyncReader, BufferedReader, ReaderCloser};
use crate::reconcile::{self, Step};
use crate::transport::{BoxedWriter, ChannelCloser, CommandRunner};

/// Whether a download should keep going after a visit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Receives entries as a download announces them
///
/// `parent` is the slash-joined path of the entry's directory relative to
/// the download root (empty at the top). Directories arrive before their
/// children with empty `content`; files arrive with exactly their bytes.
#[async_trait]
pub trait Visitor: Send {
    async fn visit(
        &mut self,
        parent: &str,
        entry: &RemoteEntry,
        content: &[u8],
    ) -> std::result::Result<Flow, BoxError>;
}

/// One remote command invocation; not reusable
pub struct Session {
    direction: Direction,
    recursive: bool,
    timeout: Duration,
    preserve_times: bool,
    visit_count: u64,
    root_name: String,
    skip_root: bool,
    inbound: BufferedReader,
    writer: BoxedWriter,
    channel: Box<dyn ChannelCloser>,
    closed: bool,
}

impl Session {
    async fn start(
        runner: &dyn CommandRunner,
        config: &ScpConfig,
        direction: Direction,
        recursive: bool,
        root: &str,
    ) -> Result<Self> {
        let target = if root.is_empty() { "." } else { root };
        let command = codec::encode_command(
            &config.program,
            direction,
            config.preserve_times,
            recursive,
            target,
        );
        tracing::debug!(%command, "starting transfer session");

        let channel = runner.start(&command).await?;

        Ok(Self {
            direction,
            recursive,
            timeout: config.timeout(),
            preserve_times: config.preserve_times,
            visit_count: 0,
            root_name: last_segment(target).to_string(),
            skip_root: config.skip_root,
            inbound: BufferedReader::new(AsyncReader::spawn(channel.reader)),
            writer: channel.writer,
            channel: channel.closer,
            closed: false,
        })
    }

    /// Pull `root` from the remote side, handing every entry to `visitor`
    ///
    /// Returns once the peer closes the stream, the visitor stops, or any
    /// error occurs. The session is closed on every path.
    pub async fn download<V>(
        runner: &dyn CommandRunner,
        config: &ScpConfig,
        root: &str,
        recursive: bool,
        visitor: &mut V,
    ) -> Result<()>
    where
        V: Visitor + ?Sized,
    {
        let mut session = Self::start(runner, config, Direction::Source, recursive, root).await?;
        let result = session.pull(visitor).await;
        if let Err(e) = session.close().await {
            tracing::debug!(error = %e, "download teardown");
        }
        result
    }

    /// Start a sink on `root` and wait until it is ready for entries
    pub async fn upload(
        runner: &dyn CommandRunner,
        config: &ScpConfig,
        root: &str,
        recursive: bool,
    ) -> Result<Uploader> {
        let mut session = Self::start(runner, config, Direction::Sink, recursive, root).await?;
        if let Err(e) = session.await_ack().await {
            let _ = session.close().await;
            return Err(e);
        }
        Ok(Uploader {
            session,
            cursor: String::new(),
            failed: false,
        })
    }

    /// Handle for closing the read side from another task
    pub fn closer(&self) -> ReaderCloser {
        self.inbound.closer()
    }

    /// Stop the reader, hang up stdin and release the remote command
    ///
    /// Only the first call does anything. Reports the first teardown failure.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inbound.close();

        let shutdown = self.writer.shutdown().await;
        let released = self.channel.close().await;
        tracing::debug!(direction = ?self.direction, visits = self.visit_count, "session closed");
        shutdown?;
        released?;
        Ok(())
    }

    async fn pull<V>(&mut self, visitor: &mut V) -> Result<()>
    where
        V: Visitor + ?Sized,
    {
        let mut open_path: Vec<String> = Vec::new();
        let mut timestamp: Option<SystemTime> = None;

        loop {
            self.send_status(token::OK).await?;

            let line = match self.inbound.read_line(self.timeout).await {
                Ok(line) => line,
                Err(e) if e.is_end_of_stream() => return Ok(()),
                Err(e) => return Err(e),
            };
            tracing::trace!(line = %line.trim_end(), "control line");

            let first = line.as_bytes()[0];
            match first {
                token::FILE | token::DIR => {
                    let entry = codec::decode_entry(&line, timestamp.take())?;
                    if self.accept(&mut open_path, entry, visitor).await? == Flow::Stop {
                        tracing::debug!("download stopped by visitor");
                        return Ok(());
                    }
                }
                token::END_DIR => {
                    open_path.pop();
                }
                token::TIME => timestamp = Some(codec::decode_timestamp(&line)?),
                token::WARNING | token::ERROR => return Err(remote_failure(first, &line[1..])),
                other => return Err(ScpError::UnsupportedToken(other)),
            }
        }
    }

    async fn accept<V>(
        &mut self,
        open_path: &mut Vec<String>,
        entry: RemoteEntry,
        visitor: &mut V,
    ) -> Result<Flow>
    where
        V: Visitor + ?Sized,
    {
        self.visit_count += 1;
        let parent = open_path.join("/");

        if entry.is_dir() {
            if self.is_synthetic_root(&entry) {
                tracing::trace!(name = %entry.name, "skipping root entry");
                return Ok(Flow::Continue);
            }
            let flow = visitor
                .visit(&parent, &entry, &[])
                .await
                .map_err(ScpError::Visit)?;
            open_path.push(entry.name);
            return Ok(flow);
        }

        self.send_status(token::OK).await?;
        let content = self.receive_content(entry.size).await?;
        tracing::debug!(%parent, name = %entry.name, size = entry.size, "received file");
        visitor
            .visit(&parent, &entry, &content)
            .await
            .map_err(ScpError::Visit)
    }

    /// The remote lists the requested directory itself before its children
    fn is_synthetic_root(&self, entry: &RemoteEntry) -> bool {
        self.visit_count == 1 && self.recursive && self.skip_root && entry.name == self.root_name
    }

    /// Exactly `size` bytes followed by one OK byte
    async fn receive_content(&mut self, size: u64) -> Result<Bytes> {
        let len = usize::try_from(size)
            .ok()
            .and_then(|n| n.checked_add(1).map(|framed| (n, framed)));
        let Some((len, framed)) = len else {
            return Err(ScpError::Framing(format!(
                "announced size {size} is not addressable"
            )));
        };

        let mut block = self.inbound.read_exact(framed, self.timeout).await?;
        let status = block[len];
        if status != token::OK {
            return Err(ScpError::Framing(format!(
                "expected status byte after {size} content bytes, got {status:#04x}"
            )));
        }
        block.truncate(len);
        Ok(block)
    }

    async fn send_status(&mut self, status: u8) -> Result<()> {
        self.writer.write_all(&[status]).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        tracing::trace!(line = %line.trim_end(), "sending control line");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn await_ack(&mut self) -> Result<()> {
        match self.inbound.read_byte(self.timeout).await? {
            token::OK => Ok(()),
            status @ (token::WARNING | token::ERROR) => {
                let message = self.inbound.read_line(self.timeout).await?;
                Err(remote_failure(status, &message))
            }
            other => Err(ScpError::Framing(format!(
                "unexpected acknowledgment byte {other:#04x}"
            ))),
        }
    }

    async fn send_dir(&mut self, entry: &RemoteEntry) -> Result<()> {
        self.send_line(&codec::encode_create(entry)).await?;
        self.await_ack().await
    }

    async fn send_end_dir(&mut self) -> Result<()> {
        self.send_line(codec::encode_end_dir()).await?;
        self.await_ack().await
    }

    async fn send_file(
        &mut self,
        entry: &RemoteEntry,
        content: Option<&mut (dyn AsyncRead + Send + Unpin + '_)>,
    ) -> Result<()> {
        if self.preserve_times {
            self.send_line(&codec::encode_timestamp(entry)).await?;
            self.await_ack().await?;
        }
        self.send_line(&codec::encode_create(entry)).await?;
        self.await_ack().await?;

        let sent = match content {
            Some(reader) => tokio::io::copy(&mut reader.take(entry.size), &mut self.writer).await?,
            None => 0,
        };
        if sent != entry.size {
            return Err(ScpError::Framing(format!(
                "{}: content ended after {sent} of {} bytes",
                entry.name, entry.size
            )));
        }

        self.send_status(token::OK).await?;
        self.await_ack().await
    }
}

/// Push side of an upload session
///
/// Entries must arrive parent-before-child. The uploader keeps the remote
/// directory cursor in sync with each entry's parent, so callers never send
/// `D`/`E` lines themselves.
pub struct Uploader {
    session: Session,
    /// Directory the sink currently has open, relative to the root
    cursor: String,
    /// Set once any push fails; the stream is unusable after that
    failed: bool,
}

impl Uploader {
    /// Send one entry
    ///
    /// Directories are entered and stay open for their children. Files need
    /// `content` yielding at least `entry.size` bytes; only that many are
    /// read. After the first failed push every later push fails with
    /// [`ScpError::Closed`] and nothing more is written.
    pub async fn push(
        &mut self,
        parent: &str,
        entry: &RemoteEntry,
        content: Option<&mut (dyn AsyncRead + Send + Unpin + '_)>,
    ) -> Result<()> {
        if self.failed {
            return Err(ScpError::Closed);
        }
        let result = self.send_entry(parent, entry, content).await;
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    async fn send_entry(
        &mut self,
        parent: &str,
        entry: &RemoteEntry,
        content: Option<&mut (dyn AsyncRead + Send + Unpin + '_)>,
    ) -> Result<()> {
        check_name(&entry.name)?;
        let parent = reconcile::segments(parent).join("/");

        for step in reconcile::plan(&self.cursor, &parent) {
            match step {
                Step::Enter(name) => self.session.send_dir(&RemoteEntry::dir(name)).await?,
                Step::Leave => self.session.send_end_dir().await?,
            }
        }
        self.cursor = parent;
        self.session.visit_count += 1;

        if entry.is_dir() {
            self.session.send_dir(entry).await?;
            self.cursor = join(&self.cursor, &entry.name);
            tracing::debug!(path = %self.cursor, "pushed directory");
            return Ok(());
        }

        self.session.send_file(entry, content).await?;
        tracing::debug!(parent = %self.cursor, name = %entry.name, size = entry.size, "pushed file");
        Ok(())
    }

    /// Directory the remote side currently has open
    pub fn cursor(&self) -> &str {
        &self.cursor
    }

    pub fn closer(&self) -> ReaderCloser {
        self.session.closer()
    }

    /// Leave every open directory and close the session
    ///
    /// After a failed push the session is only closed.
    pub async fn finish(mut self) -> Result<()> {
        if self.failed {
            return self.session.close().await;
        }
        let unwound = self.unwind().await;
        let closed = self.session.close().await;
        unwound.and(closed)
    }

    /// Abort without unwinding
    pub async fn close(mut self) -> Result<()> {
        self.session.close().await
    }

    async fn unwind(&mut self) -> Result<()> {
        for _ in reconcile::plan(&self.cursor, "") {
            self.session.send_end_dir().await?;
        }
        self.cursor.clear();
        Ok(())
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\n', '\r']) {
        return Err(ScpError::Malformed(format!("entry name {name:?}")));
    }
    Ok(())
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn last_segment(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
}

fn remote_failure(status: u8, message: &str) -> ScpError {
    let message = message.trim().to_string();
    tracing::warn!(%message, status, "remote rejected transfer");
    if status == token::WARNING {
        ScpError::RemoteWarning(message)
    } else {
        ScpError::Remote(message)
    }
}
