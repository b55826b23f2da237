//! Error taxonomy for transfer sessions
//!
//! Every variant aborts the current operation. Nothing here is retried; a
//! caller that wants retries wraps the whole session.

use std::io;
use std::time::Duration;

/// Boxed error produced by a caller-supplied callback
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum ScpError {
    /// A control line did not parse
    #[error("malformed line: {0:?}")]
    Malformed(String),

    /// Content length or trailing status byte did not match the announcement
    #[error("framing error: {0}")]
    Framing(String),

    /// Fatal rejection sent by the peer (status byte 0x2)
    #[error("{0}")]
    Remote(String),

    /// Warning sent by the peer (status byte 0x1), surfaced as a failure
    #[error("{0}")]
    RemoteWarning(String),

    /// No data arrived within the read bound
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// The reader was closed before or during the read
    #[error("reader closed")]
    Closed,

    /// First byte of a control line is not a recognised token
    #[error("unsupported token: {0:#04x}")]
    UnsupportedToken(u8),

    /// Underlying read/write failure, passed through unchanged
    #[error(transparent)]
    Transport(#[from] io::Error),

    /// A visit or content callback failed
    #[error("{0}")]
    Visit(#[source] BoxError),
}

impl ScpError {
    /// True when the peer closed the stream cleanly
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::Transport(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }

    /// True for explicit rejections from the peer
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::RemoteWarning(_))
    }
}

pub type Result<T> = std::result::Result<T, ScpError>;
