use std::fmt;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the runtime, either as `Result` values from the
/// public API or routed into a session pipeline via
/// [`EventHandler::on_cause`](crate::pipeline::EventHandler::on_cause).
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from a socket, the selector, or the spill file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Memory buffer pool exhausted or closed.
    #[error("buffer allocate: {0}")]
    BufferAllocate(&'static str),
    /// File store exhausted or closed.
    #[error("store allocate: {0}")]
    StoreAllocate(&'static str),
    /// Session slot table exhausted.
    #[error("session allocate: {0}")]
    SessionAllocate(String),
    /// A dial did not become connectable before its deadline.
    #[error("connection timed out: remote {0}")]
    ConnectTimeout(SocketAddr),
    /// A read or write interval exceeded its configured bound.
    #[error("{0} idle timeout")]
    IdleTimeout(IdleKind),
    /// The peer closed the connection or the channel is gone.
    #[error("channel closed")]
    ChannelClosed,
    /// A handler misused the pipeline (e.g. a non-byte payload reached
    /// the head sentinel).
    #[error("handler: {0}")]
    Handler(String),
    /// Invalid configuration value.
    #[error("config: {0}")]
    Config(String),
    /// The event loop has already terminated.
    #[error("event loop terminated")]
    Terminated,
}

impl Error {
    /// True when this error reports pool or store exhaustion.
    pub fn is_allocation(&self) -> bool {
        matches!(self, Error::BufferAllocate(_) | Error::StoreAllocate(_))
    }
}

/// Which direction of a session went idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleKind {
    Read,
    Write,
}

impl fmt::Display for IdleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdleKind::Read => f.write_str("read"),
            IdleKind::Write => f.write_str("write"),
        }
    }
}
