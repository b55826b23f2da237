//! Client side of the remote-shell file transfer protocol
//!
//! Talks to `scp -t` / `scp -f` over any command channel a [`CommandRunner`]
//! can open.

pub mod codec;
pub mod config;
pub mod error;
pub mod reader;
pub mod reconcile;
pub mod session;
pub mod transport;

pub use codec::{Direction, EntryKind, RemoteEntry};
pub use config::ScpConfig;
pub use error::{BoxError, Result, ScpError};
pub use reader::{AsyncReader, BufferedReader, ReaderCloser};
pub use reconcile::{adjust_path, plan, Step};
pub use session::{Flow, Session, Uploader, Visitor};
pub use transport::{ChannelCloser, CommandChannel, CommandRunner, NoopCloser, ProcessRunner};
