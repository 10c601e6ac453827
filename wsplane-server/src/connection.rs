//! Per-socket connection records
//!
//! A [`ConnectionRecord`] is the unit the registry stores: the socket, its
//! validity, readiness flags and activity bookkeeping.

use bytes::Bytes;
use mio::Token;
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Identifier of a registered connection.
///
/// `slot` indexes the registry and doubles as the multiplexer token;
/// `serial` is never reused, so an id whose slot was recycled by a later
/// connection no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    slot: usize,
    serial: u64,
}

impl ConnectionId {
    pub(crate) fn new(slot: usize, serial: u64) -> Self {
        Self { slot, serial }
    }

    /// Registry slot of this connection
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Process-unique serial number
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.slot)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.serial, self.slot)
    }
}

/// Externally owned HTTP upgrade state.
///
/// The engine never inspects it; it only asks for a clean protocol
/// downgrade once the connection has been shut down.
pub trait UpgradeContext: Send + Sync + 'static {
    /// Called exactly once when the connection is removed
    fn downgrade(&self, id: ConnectionId);
}

/// Readiness flags tracked per record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateFlags(u8);

impl StateFlags {
    /// Data is waiting to be drained this iteration
    pub const READABLE: StateFlags = StateFlags(0b0000_0001);
    /// `on_connect` has not fired yet
    pub const CONNECT_PENDING: StateFlags = StateFlags(0b0000_0010);

    /// Empty flag set
    pub const fn empty() -> Self {
        StateFlags(0)
    }

    /// Check whether every bit of `other` is set
    pub fn contains(&self, other: StateFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`
    pub fn insert(&mut self, other: StateFlags) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`
    pub fn remove(&mut self, other: StateFlags) {
        self.0 &= !other.0;
    }
}

/// Socket shared between the poller and writer threads.
///
/// The stream is non-blocking. `valid` only ever goes from `true` to
/// `false`, and it flips under `send_guard`: once
/// [`invalidate`](Self::invalidate) returns, no further byte is written.
#[derive(Debug)]
pub(crate) struct Socket {
    stream: TcpStream,
    valid: AtomicBool,
    send_guard: Mutex<()>,
}

impl Socket {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            valid: AtomicBool::new(true),
            send_guard: Mutex::new(()),
        }
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Returns `true` if this call flipped the flag. Waits for a write in
    /// progress to finish.
    pub(crate) fn invalidate(&self) -> bool {
        let _guard = self.send_guard.lock();
        self.valid.swap(false, Ordering::AcqRel)
    }

    /// One non-blocking write, or `None` if the socket was invalidated
    pub(crate) fn write_if_valid(&self, buf: &[u8]) -> Option<io::Result<usize>> {
        let _guard = self.send_guard.lock();
        if !self.is_valid() {
            return None;
        }
        Some((&self.stream).write(buf))
    }
}

/// Registry entry for one upgraded socket
pub struct ConnectionRecord {
    pub(crate) id: ConnectionId,
    pub(crate) socket: Arc<Socket>,
    pub(crate) flags: StateFlags,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) established_at: Instant,
    pub(crate) last_activity: Instant,
    pub(crate) last_error: Option<io::ErrorKind>,
    pub(crate) upgrade: Option<Arc<dyn UpgradeContext>>,
    pub(crate) leftover: Bytes,
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("valid", &self.socket.is_valid())
            .field("flags", &self.flags)
            .field("peer_addr", &self.peer_addr)
            .field("last_error", &self.last_error)
            .field("upgrade", &self.upgrade.as_ref().map(|_| "<context>"))
            .field("leftover", &self.leftover.len())
            .finish()
    }
}

impl ConnectionRecord {
    pub(crate) fn new(
        id: ConnectionId,
        stream: TcpStream,
        upgrade: Option<Arc<dyn UpgradeContext>>,
        leftover: Bytes,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer_addr: stream.peer_addr().ok(),
            socket: Arc::new(Socket::new(stream)),
            flags: StateFlags::CONNECT_PENDING,
            established_at: now,
            last_activity: now,
            last_error: None,
            upgrade,
            leftover,
        }
    }

    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the record may still be read from or written to
    pub fn is_valid(&self) -> bool {
        self.socket.is_valid()
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            valid: self.is_valid(),
            peer_addr: self.peer_addr,
            uptime: self.established_at.elapsed(),
            idle: self.last_activity.elapsed(),
            last_error: self.last_error,
        }
    }

    /// Shut the socket down and hand the upgrade context back.
    pub(crate) fn close(self) {
        if let Err(err) = self.socket.stream().shutdown(Shutdown::Both) {
            // NotConnected is the normal outcome once the peer has gone
            if err.kind() != io::ErrorKind::NotConnected {
                tracing::debug!(connection_id = %self.id, error = %err, "Socket shutdown failed");
            }
        }
        if let Some(upgrade) = &self.upgrade {
            upgrade.downgrade(self.id);
        }
    }
}

/// Point-in-time view of a connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Connection identifier
    pub id: ConnectionId,
    /// Whether the connection is still usable
    pub valid: bool,
    /// Remote address, if the socket reported one
    pub peer_addr: Option<SocketAddr>,
    /// Time since upgrade
    pub uptime: std::time::Duration,
    /// Time since the last successful read or write
    pub idle: std::time::Duration,
    /// Kind of the most recent I/O error
    pub last_error: Option<io::ErrorKind>,
}
