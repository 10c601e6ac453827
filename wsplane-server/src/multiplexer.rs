//! Readiness multiplexer adapter
//!
//! Owns the single [`mio::Poll`] handle of an engine. Registration goes
//! through a cloneable [`Registrar`] so that upgrades arriving on other
//! threads can register sockets; waiting is reserved to the poller.

use crate::connection::ConnectionRecord;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Token reserved for the engine's waker
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// Initial event buffer capacity
const INITIAL_CAPACITY: usize = 64;

/// Registers and unregisters sockets with the engine's multiplexer
#[derive(Debug)]
pub struct Registrar {
    registry: Registry,
    registered: Arc<AtomicUsize>,
}

impl Registrar {
    /// Watch the record's socket for readability (hang-up and error are
    /// always reported)
    pub(crate) fn register(&self, record: &ConnectionRecord) -> io::Result<()> {
        let fd = record.socket.stream().as_raw_fd();
        self.registry
            .register(&mut SourceFd(&fd), record.id.token(), Interest::READABLE)?;
        self.registered.fetch_add(1, Ordering::AcqRel);
        trace!(connection_id = %record.id, fd, "Registered socket");
        Ok(())
    }

    /// Stop watching the record's socket
    pub(crate) fn unregister(&self, record: &ConnectionRecord) -> io::Result<()> {
        let fd = record.socket.stream().as_raw_fd();
        self.registered.fetch_sub(1, Ordering::AcqRel);
        self.registry.deregister(&mut SourceFd(&fd))?;
        trace!(connection_id = %record.id, fd, "Unregistered socket");
        Ok(())
    }

    /// Number of sockets currently registered
    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::Acquire)
    }
}

/// Owner of the engine's multiplexer handle and event buffer
#[derive(Debug)]
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    capacity: usize,
    registered: Arc<AtomicUsize>,
}

impl Multiplexer {
    /// Create the multiplexer, its registrar and the waker used to
    /// interrupt a pending wait.
    pub fn new() -> io::Result<(Self, Registrar, Waker)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let registered = Arc::new(AtomicUsize::new(0));

        let multiplexer = Self {
            poll,
            events: Events::with_capacity(INITIAL_CAPACITY),
            capacity: INITIAL_CAPACITY,
            registered: registered.clone(),
        };
        let registrar = Registrar {
            registry,
            registered,
        };
        Ok((multiplexer, registrar, waker))
    }

    /// Grow the event buffer so it can hold one event per registered
    /// socket plus the waker. Never shrinks.
    pub fn ensure_capacity(&mut self) {
        let needed = self.registered.load(Ordering::Acquire) + 1;
        if needed > self.capacity {
            let capacity = needed.next_power_of_two();
            trace!(from = self.capacity, to = capacity, "Growing event buffer");
            self.events = Events::with_capacity(capacity);
            self.capacity = capacity;
        }
    }

    /// Current event buffer capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block for up to `timeout` and return the number of fired events.
    ///
    /// The waker stays registered, so even with no sockets the call blocks
    /// on a non-empty set for the timeout and a wake ends it early.
    /// Interrupted system calls are retried.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        self.ensure_capacity();
        loop {
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => return Ok(self.events.iter().count()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Events fired by the last [`wait`](Self::wait)
    pub fn events(&self) -> &Events {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    fn record(slot: usize) -> (ConnectionRecord, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let id = crate::connection::ConnectionId::new(slot, slot as u64 + 1);
        (ConnectionRecord::new(id, server, None, Bytes::new()), client)
    }

    #[test]
    fn test_wait_honors_timeout_when_empty() {
        let (mut mux, _registrar, _waker) = Multiplexer::new().unwrap();
        let started = Instant::now();
        let fired = mux.wait(Duration::from_millis(30)).unwrap();
        assert_eq!(fired, 0);
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_waker_interrupts_wait_when_empty() {
        let (mut mux, registrar, waker) = Multiplexer::new().unwrap();
        assert_eq!(registrar.registered(), 0);

        let wake = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
            // closing the waker would drop its pending event
            waker
        });
        let started = Instant::now();
        let fired = mux.wait(Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(fired, 1);
        assert_eq!(mux.events().iter().next().unwrap().token(), WAKE_TOKEN);
        drop(wake.join().unwrap());
    }

    #[test]
    fn test_readable_event_fires() {
        let (mut mux, registrar, _waker) = Multiplexer::new().unwrap();
        let (record, mut client) = record(5);
        registrar.register(&record).unwrap();
        assert_eq!(registrar.registered(), 1);

        client.write_all(&[0x81, 0x00]).unwrap();
        let mut fired = 0;
        for _ in 0..20 {
            fired = mux.wait(Duration::from_millis(50)).unwrap();
            if fired > 0 {
                break;
            }
        }
        assert!(fired > 0);
        let event = mux.events().iter().next().unwrap();
        assert_eq!(event.token(), Token(5));
        assert!(event.is_readable());

        registrar.unregister(&record).unwrap();
        assert_eq!(registrar.registered(), 0);
    }

    #[test]
    fn test_capacity_grows_and_never_shrinks() {
        let (mut mux, registrar, _waker) = Multiplexer::new().unwrap();
        let records: Vec<_> = (0..INITIAL_CAPACITY + 1).map(record).collect();
        for (record, _) in &records {
            registrar.register(record).unwrap();
        }
        mux.ensure_capacity();
        assert!(mux.capacity() > INITIAL_CAPACITY);
        let grown = mux.capacity();

        for (record, _) in &records {
            registrar.unregister(record).unwrap();
        }
        mux.ensure_capacity();
        assert_eq!(mux.capacity(), grown);
    }

    #[test]
    fn test_waker_interrupts_wait() {
        let (mut mux, registrar, waker) = Multiplexer::new().unwrap();
        let (record, _client) = record(0);
        registrar.register(&record).unwrap();

        waker.wake().unwrap();
        let started = Instant::now();
        let fired = mux.wait(Duration::from_secs(5)).unwrap();
        assert!(fired >= 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(mux.events().iter().any(|e| e.token() == WAKE_TOKEN));
    }
}
