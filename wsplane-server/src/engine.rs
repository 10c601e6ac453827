//! Engine facade
//!
//! [`Engine`] owns the poller thread. [`EngineHandle`] is the cloneable
//! view application threads use to upgrade sockets, write and broadcast.

use crate::config::{EngineConfig, KeyValueStore};
use crate::connection::{ConnectionId, ConnectionInfo, UpgradeContext};
use crate::error::{EngineError, Result};
use crate::event_loop::{EventLoop, LoopState};
use crate::handler::Handler;
use crate::multiplexer::Multiplexer;
use crate::registry::Registry;
use crate::stats::{Counters, EngineStats};
use crate::writer::Writer;
use bytes::Bytes;
use mio::Waker;
use parking_lot::Mutex;
use std::fmt;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Name of the poller thread
pub const POLLER_THREAD_NAME: &str = "wsplane-poller";

/// State shared by the poller and every handle
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) registry: Registry,
    pub(crate) writer: Writer,
    pub(crate) counters: Counters,
    waker: Waker,
    shutdown: AtomicBool,
    state: AtomicU8,
}

/// Cloneable handle to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("state", &self.state())
            .field("connections", &self.shared.registry.len())
            .finish()
    }
}

impl EngineHandle {
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Take over an already upgraded socket.
    ///
    /// `leftover` holds bytes the HTTP layer read past the handshake; they
    /// are decoded right after `on_connect` fires.
    #[cfg_attr(feature = "logging", tracing::instrument(skip(self, stream, context, leftover)))]
    pub fn upgrade(
        &self,
        stream: TcpStream,
        context: Option<Arc<dyn UpgradeContext>>,
        leftover: impl Into<Bytes>,
    ) -> Result<ConnectionId> {
        if self.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }

        stream
            .set_nonblocking(true)
            .map_err(EngineError::Registration)?;
        let id = self
            .shared
            .registry
            .add(stream, context, leftover.into())
            .map_err(EngineError::Registration)?;
        self.shared.counters.connection_opened();

        if let Err(err) = self.shared.waker.wake() {
            warn!(connection_id = %id, error = %err, "Failed to wake poller");
        }
        info!(connection_id = %id, "Connection upgraded");
        Ok(id)
    }

    /// Send one text frame to `id`.
    ///
    /// Fails with [`EngineError::FatalWrite`] when the payload exceeds the
    /// MTU or the connection is no longer valid.
    pub fn write(&self, id: ConnectionId, payload: &str) -> Result<()> {
        let shared = &self.shared;
        shared
            .writer
            .write(&shared.registry, &shared.counters, id, payload)
    }

    /// Send one text frame to every valid connection; returns how many
    /// connections were reached
    pub fn broadcast(&self, payload: &str) -> Result<usize> {
        let shared = &self.shared;
        shared
            .writer
            .broadcast(&shared.registry, &shared.counters, payload)
    }

    /// Mark a connection dead; it is removed on the next sweep
    pub fn invalidate(&self, id: ConnectionId) -> bool {
        self.shared.registry.invalidate(id)
    }

    /// Whether `id` is registered and valid
    pub fn is_valid(&self, id: ConnectionId) -> bool {
        self.shared.registry.is_valid(id)
    }

    /// Ids of every valid connection
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.shared.registry.snapshot_handles()
    }

    /// Number of valid connections
    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// Snapshot of one connection, while it is present
    pub fn connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.shared.registry.info(id)
    }

    /// Engine statistics
    pub fn stats(&self) -> EngineStats {
        let shared = &self.shared;
        shared
            .counters
            .snapshot(shared.registry.counters(), self.connection_count())
    }

    /// Configuration the engine runs with
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Current event loop state
    pub fn state(&self) -> LoopState {
        LoopState::from(self.shared.state.load(Ordering::Acquire))
    }

    /// Ask the poller to stop after its current iteration
    pub fn terminate(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.state() != LoopState::Stopped {
            self.set_state(LoopState::ShuttingDown);
        }
        if let Err(err) = self.shared.waker.wake() {
            warn!(error = %err, "Failed to wake poller");
        }
        info!("Engine termination requested");
    }

    /// Whether [`terminate`](Self::terminate) was called or the loop died
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: LoopState) {
        let state = if state != LoopState::Stopped && self.is_shutting_down() {
            LoopState::ShuttingDown
        } else {
            state
        };
        self.shared.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn mark_stopped(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.set_state(LoopState::Stopped);
    }
}

/// WebSocket data-plane engine
///
/// ```rust,no_run
/// use std::net::TcpListener;
/// use wsplane_server::prelude::*;
///
/// # fn main() -> wsplane_server::Result<()> {
/// let engine = Engine::new(EngineConfig::default(), EchoHandler::new())?;
/// engine.start()?;
///
/// let listener = TcpListener::bind("127.0.0.1:9001").map_err(EngineError::Startup)?;
/// for stream in listener.incoming() {
///     // the HTTP upgrade happens elsewhere
///     let stream = stream.map_err(EngineError::Startup)?;
///     engine.upgrade(stream, None, Bytes::new())?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    handle: EngineHandle,
    event_loop: Mutex<Option<EventLoop>>,
    poller: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("handle", &self.handle)
            .field("started", &self.event_loop.lock().is_none())
            .finish()
    }
}

impl Engine {
    /// Create an engine; the poller does not run until [`start`](Self::start)
    pub fn new<H: Handler>(config: EngineConfig, handler: H) -> Result<Self> {
        config.validate()?;

        let (mux, registrar, waker) = Multiplexer::new().map_err(EngineError::Startup)?;
        let shared = Arc::new(Shared {
            registry: Registry::new(registrar),
            writer: Writer::new(&config),
            counters: Counters::default(),
            waker,
            shutdown: AtomicBool::new(false),
            state: AtomicU8::new(LoopState::Idle as u8),
            config,
        });
        let handle = EngineHandle { shared };
        let event_loop = EventLoop::new(handle.clone(), mux, Arc::new(handler));

        debug!(config = ?handle.config(), "Engine created");
        Ok(Self {
            handle,
            event_loop: Mutex::new(Some(event_loop)),
            poller: Mutex::new(None),
        })
    }

    /// Create an engine configured from a key/value store
    pub fn from_store<S, H>(store: &S, handler: H) -> Result<Self>
    where
        S: KeyValueStore + ?Sized,
        H: Handler,
    {
        Self::new(EngineConfig::from_store(store)?, handler)
    }

    /// Spawn the poller thread
    pub fn start(&self) -> Result<()> {
        let event_loop = self
            .event_loop
            .lock()
            .take()
            .ok_or(EngineError::AlreadyStarted)?;

        let join = thread::Builder::new()
            .name(POLLER_THREAD_NAME.to_string())
            .spawn(move || event_loop.run())
            .map_err(EngineError::Startup)?;
        *self.poller.lock() = Some(join);
        Ok(())
    }

    /// Block until the poller thread has stopped.
    ///
    /// Returns the loop's fatal error, if it died of one. Returns `Ok`
    /// immediately when the poller was never started or already joined.
    pub fn wait_for(&self) -> Result<()> {
        let Some(join) = self.poller.lock().take() else {
            return Ok(());
        };
        match join.join() {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(EngineError::Panicked(message))
            }
        }
    }

    /// Cloneable handle for application threads
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// See [`EngineHandle::upgrade`]
    pub fn upgrade(
        &self,
        stream: TcpStream,
        context: Option<Arc<dyn UpgradeContext>>,
        leftover: impl Into<Bytes>,
    ) -> Result<ConnectionId> {
        self.handle.upgrade(stream, context, leftover)
    }

    /// See [`EngineHandle::write`]
    pub fn write(&self, id: ConnectionId, payload: &str) -> Result<()> {
        self.handle.write(id, payload)
    }

    /// See [`EngineHandle::broadcast`]
    pub fn broadcast(&self, payload: &str) -> Result<usize> {
        self.handle.broadcast(payload)
    }

    /// See [`EngineHandle::invalidate`]
    pub fn invalidate(&self, id: ConnectionId) -> bool {
        self.handle.invalidate(id)
    }

    /// See [`EngineHandle::terminate`]
    pub fn terminate(&self) {
        self.handle.terminate()
    }

    /// See [`EngineHandle::state`]
    pub fn state(&self) -> LoopState {
        self.handle.state()
    }

    /// See [`EngineHandle::connection_count`]
    pub fn connection_count(&self) -> usize {
        self.handle.connection_count()
    }

    /// See [`EngineHandle::connection_info`]
    pub fn connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.handle.connection_info(id)
    }

    /// See [`EngineHandle::stats`]
    pub fn stats(&self) -> EngineStats {
        self.handle.stats()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.handle.terminate();

        if let Err(err) = self.wait_for() {
            error!(error = %err, "Event loop ended with error");
        }

        // never started: nobody else will release the sockets
        if self.event_loop.get_mut().take().is_some() {
            self.handle.shared().registry.close_all();
            self.handle.mark_stopped();
        }
    }
}
