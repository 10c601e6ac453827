//! Engine error types
//!
//! Protocol errors and transient I/O never reach callers; they are logged
//! and absorbed by the poller. What remains here is what a caller of the
//! engine can observe.

use crate::connection::ConnectionId;
use std::io;
use std::time::Duration;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The write was rejected before any byte was sent
    #[error("Fatal write: {reason}")]
    FatalWrite {
        /// Why the write was rejected
        reason: String,
    },

    /// The socket failed while sending; the connection has been invalidated
    /// if the error was fatal
    #[error("Write to connection {id} failed: {source}")]
    WriteFailed {
        /// Target connection
        id: ConnectionId,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },

    /// The peer did not drain its receive buffer in time
    #[error("Write to connection {id} timed out after {waited:?}")]
    WriteTimeout {
        /// Target connection
        id: ConnectionId,
        /// Time spent waiting for buffer space
        waited: Duration,
    },

    /// The multiplexer could not be created
    #[error("Engine startup failed: {0}")]
    Startup(#[source] io::Error),

    /// Waiting on the multiplexer failed; the event loop stopped
    #[error("Multiplexer failure: {0}")]
    Multiplexer(#[source] io::Error),

    /// An upgraded socket could not be registered
    #[error("Failed to register upgraded socket: {0}")]
    Registration(#[source] io::Error),

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(#[from] wsplane_core::ConfigError),

    /// `start` was called twice
    #[error("Event loop already started")]
    AlreadyStarted,

    /// The engine is shutting down and accepts no new connections
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// The poller thread panicked
    #[error("Event loop panicked: {0}")]
    Panicked(String),
}

impl EngineError {
    pub(crate) fn fatal_write(reason: impl Into<String>) -> Self {
        EngineError::FatalWrite {
            reason: reason.into(),
        }
    }

    /// Whether the error means the connection is gone for good
    pub fn is_connection_lost(&self) -> bool {
        match self {
            EngineError::WriteFailed { source, .. } => is_fatal_socket_error(source),
            _ => false,
        }
    }
}

/// Errors raised at the dispatch boundary
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// The callback returned an error
    #[error("{operation} returned error: {message}")]
    Returned {
        /// Callback name
        operation: &'static str,
        /// Rendered error
        message: String,
    },

    /// The callback panicked
    #[error("{operation} panicked: {message}")]
    Panicked {
        /// Callback name
        operation: &'static str,
        /// Panic payload, when it was a string
        message: String,
    },
}

/// Socket errors after which the connection must be invalidated
pub(crate) fn is_fatal_socket_error(err: &io::Error) -> bool {
    const EBADF: i32 = 9;

    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero
            | io::ErrorKind::UnexpectedEof
    ) || err.raw_os_error() == Some(EBADF)
}
