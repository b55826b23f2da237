//! Timeout-bound reader over the remote command's output
//!
//! One background task pulls fixed-size chunks off the transport and hands
//! them over a small bounded queue, so a slow consumer throttles the reads.
//! The caller side waits on that queue with a deadline. Terminal errors go
//! through their own lane; closing is a one-shot cancellation.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ScpError};

/// Bytes requested from the transport per read
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Chunks buffered between the background task and the consumer
const IN_FLIGHT_CHUNKS: usize = 2;

/// Longest control line accepted before the stream is declared corrupt
const MAX_LINE_LEN: usize = 64 * 1024;

struct Shared {
    closed: AtomicBool,
    done: CancellationToken,
}

impl Shared {
    fn close(&self) -> bool {
        let won = self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.done.cancel();
        }
        won
    }
}

/// Reader side of a transfer session
pub struct AsyncReader {
    chunks: mpsc::Receiver<Bytes>,
    failure: Option<oneshot::Receiver<io::Error>>,
    shared: Arc<Shared>,
}

/// Handle that can close an [`AsyncReader`] from elsewhere
#[derive(Clone)]
pub struct ReaderCloser {
    shared: Arc<Shared>,
}

impl ReaderCloser {
    /// Close the reader. Returns true for the call that actually tore it down.
    pub fn close(&self) -> bool {
        self.shared.close()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl AsyncReader {
    /// Wrap `inner` and start the background task. Must be called inside a
    /// Tokio runtime.
    pub fn spawn<R>(inner: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (chunk_tx, chunks) = mpsc::channel(IN_FLIGHT_CHUNKS);
        let (failure_tx, failure) = oneshot::channel();
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            done: CancellationToken::new(),
        });

        tokio::spawn(pump(inner, chunk_tx, failure_tx, shared.done.clone()));

        Self {
            chunks,
            failure: Some(failure),
            shared,
        }
    }

    pub fn closer(&self) -> ReaderCloser {
        ReaderCloser {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Next chunk from the transport
    ///
    /// Returns the chunk, the transport's terminal error, [`ScpError::Closed`]
    /// once the reader is shut down, or [`ScpError::Timeout`] when nothing
    /// happens within `timeout`.
    pub async fn read(&mut self, timeout: Duration) -> Result<Bytes> {
        let Self {
            chunks,
            failure,
            shared,
        } = self;

        if shared.closed.load(Ordering::Acquire) {
            return Err(ScpError::Closed);
        }

        // Data before errors, errors before the close signal.
        tokio::select! {
            biased;
            Some(chunk) = chunks.recv() => Ok(chunk),
            Some(err) = recv_failure(failure) => Err(ScpError::Transport(err)),
            () = shared.done.cancelled() => Err(ScpError::Closed),
            () = tokio::time::sleep(timeout) => Err(ScpError::Timeout(timeout)),
        }
    }

    /// Idempotent; safe to race with [`ReaderCloser::close`]
    pub fn close(&self) -> bool {
        self.shared.close()
    }
}

impl Drop for AsyncReader {
    fn drop(&mut self) {
        self.shared.close();
    }
}

async fn recv_failure(lane: &mut Option<oneshot::Receiver<io::Error>>) -> Option<io::Error> {
    let Some(rx) = lane.as_mut() else {
        return std::future::pending().await;
    };
    let err = rx.await.ok();
    *lane = None;
    err
}

async fn pump<R>(
    mut inner: R,
    chunks: mpsc::Sender<Bytes>,
    failure: oneshot::Sender<io::Error>,
    done: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    let err = loop {
        buf.reserve(CHUNK_SIZE);
        let read = tokio::select! {
            () = done.cancelled() => return,
            read = inner.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => break io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream"),
            Ok(_) => {
                let chunk = buf.split().freeze();
                tokio::select! {
                    () = done.cancelled() => return,
                    sent = chunks.send(chunk) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => break e,
        }
    };

    tracing::trace!(error = %err, "transport reader stopped");
    // Nobody may be listening any more; both signals are fire-and-forget.
    let _ = failure.send(err);
    done.cancel();
}

/// Byte-level framing on top of [`AsyncReader`]
///
/// Holds whatever part of the last chunk has not been consumed yet, so lines
/// and fixed-size blocks can span chunk boundaries.
pub struct BufferedReader {
    inner: AsyncReader,
    pending: BytesMut,
}

impl BufferedReader {
    pub fn new(inner: AsyncReader) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
        }
    }

    pub fn closer(&self) -> ReaderCloser {
        self.inner.closer()
    }

    pub fn close(&self) -> bool {
        self.inner.close()
    }

    async fn fill(&mut self, timeout: Duration) -> Result<()> {
        let chunk = self.inner.read(timeout).await?;
        self.pending.extend_from_slice(&chunk);
        Ok(())
    }

    /// Read up to and including the next `\n`
    ///
    /// End of stream with nothing buffered is reported as is; end of stream
    /// in the middle of a line is a framing error.
    pub async fn read_line(&mut self, timeout: Duration) -> Result<String> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line = self.pending.split_to(pos + 1);
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if self.pending.len() > MAX_LINE_LEN {
                return Err(ScpError::Framing(format!(
                    "control line longer than {MAX_LINE_LEN} bytes"
                )));
            }
            match self.fill(timeout).await {
                Ok(()) => {}
                Err(e) if e.is_end_of_stream() && !self.pending.is_empty() => {
                    return Err(ScpError::Framing(format!(
                        "stream ended inside a control line: {:?}",
                        String::from_utf8_lossy(&self.pending)
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read exactly `n` bytes, accumulating across chunks
    pub async fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Bytes> {
        while self.pending.len() < n {
            match self.fill(timeout).await {
                Ok(()) => {}
                Err(e) if e.is_end_of_stream() => {
                    return Err(ScpError::Framing(format!(
                        "stream ended after {} of {n} bytes",
                        self.pending.len()
                    )));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(self.pending.split_to(n).freeze())
    }

    pub async fn read_byte(&mut self, timeout: Duration) -> Result<u8> {
        let byte = self.read_exact(1, timeout).await?;
        Ok(byte[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Instant;
    use tokio::io::{AsyncWriteExt, ReadBuf};

    /// Transport whose every read fails
    struct Reset;

    impl AsyncRead for Reset {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "peer reset the connection",
            )))
        }
    }

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_read_returns_written_chunk() {
        let (mut remote, local) = tokio::io::duplex(1024);
        let mut reader = AsyncReader::spawn(local);

        remote.write_all(b"hello").await.unwrap();
        let chunk = reader.read(LONG).await.unwrap();
        assert_eq!(&chunk[..], b"hello");
    }

    #[tokio::test]
    async fn test_read_times_out_without_data() {
        let (_remote, local) = tokio::io::duplex(1024);
        let mut reader = AsyncReader::spawn(local);

        let started = Instant::now();
        let err = reader.read(SHORT).await.unwrap_err();
        assert!(matches!(err, ScpError::Timeout(d) if d == SHORT));
        assert!(started.elapsed() < LONG);
    }

    #[tokio::test]
    async fn test_data_is_delivered_before_end_of_stream() {
        let (mut remote, local) = tokio::io::duplex(1024);
        let mut reader = AsyncReader::spawn(local);

        remote.write_all(b"last words").await.unwrap();
        drop(remote);

        let chunk = reader.read(LONG).await.unwrap();
        assert_eq!(&chunk[..], b"last words");
        let err = reader.read(LONG).await.unwrap_err();
        assert!(err.is_end_of_stream(), "{err}");
    }

    #[tokio::test]
    async fn test_transport_error_is_passed_through() {
        let mut reader = AsyncReader::spawn(Reset);

        match reader.read(LONG).await {
            Err(ScpError::Transport(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::ConnectionReset);
                assert_eq!(e.to_string(), "peer reset the connection");
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_buffered_line_keeps_transport_error() {
        let mut reader = BufferedReader::new(AsyncReader::spawn(Reset));

        let err = reader.read_line(LONG).await.unwrap_err();
        assert!(
            matches!(&err, ScpError::Transport(e) if e.kind() == io::ErrorKind::ConnectionReset),
            "{err}"
        );
        assert!(!err.is_end_of_stream());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_remote, local) = tokio::io::duplex(1024);
        let mut reader = AsyncReader::spawn(local);
        let closer = reader.closer();

        assert!(closer.close());
        assert!(!closer.close());
        assert!(!reader.close());
        assert!(matches!(reader.read(LONG).await, Err(ScpError::Closed)));
    }

    #[tokio::test]
    async fn test_concurrent_close_has_one_winner() {
        let (_remote, local) = tokio::io::duplex(1024);
        let reader = AsyncReader::spawn(local);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let closer = reader.closer();
                tokio::spawn(async move { closer.close() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_close_wakes_pending_read() {
        let (_remote, local) = tokio::io::duplex(1024);
        let mut reader = AsyncReader::spawn(local);
        let closer = reader.closer();

        let pending = tokio::spawn(async move { reader.read(LONG).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.close();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ScpError::Closed)));
    }

    #[tokio::test]
    async fn test_buffered_line_spans_chunks() {
        let (mut remote, local) = tokio::io::duplex(1024);
        let mut reader = BufferedReader::new(AsyncReader::spawn(local));

        remote.write_all(b"C0644 5 ").await.unwrap();
        remote.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        remote.write_all(b"a.txt\nhello\0").await.unwrap();

        assert_eq!(reader.read_line(LONG).await.unwrap(), "C0644 5 a.txt\n");
        assert_eq!(&reader.read_exact(5, LONG).await.unwrap()[..], b"hello");
        assert_eq!(reader.read_byte(LONG).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_buffered_short_content_is_framing_error() {
        let (mut remote, local) = tokio::io::duplex(1024);
        let mut reader = BufferedReader::new(AsyncReader::spawn(local));

        remote.write_all(b"abc").await.unwrap();
        drop(remote);

        let err = reader.read_exact(10, LONG).await.unwrap_err();
        assert!(matches!(err, ScpError::Framing(_)), "{err}");
    }

    #[tokio::test]
    async fn test_buffered_clean_eof_between_lines() {
        let (mut remote, local) = tokio::io::duplex(1024);
        let mut reader = BufferedReader::new(AsyncReader::spawn(local));

        remote.write_all(b"E\n").await.unwrap();
        drop(remote);

        assert_eq!(reader.read_line(LONG).await.unwrap(), "E\n");
        assert!(reader.read_line(LONG).await.unwrap_err().is_end_of_stream());
    }
}
