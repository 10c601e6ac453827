//! Poller event loop
//!
//! One iteration: size the event buffer, wait, admit new connections,
//! classify fired events, drain readable sockets, then sweep.

use crate::connection::ConnectionId;
use crate::engine::EngineHandle;
use crate::error::{EngineError, Result};
use crate::handler::{dispatch, Context, Handler};
use crate::multiplexer::{Multiplexer, WAKE_TOKEN};
use crate::reader::Reader;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Event loop state, as observed from other threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoopState {
    /// Between iterations, or not started
    Idle = 0,
    /// Blocked on the multiplexer
    Waiting = 1,
    /// Processing fired events
    Dispatching = 2,
    /// Termination requested
    ShuttingDown = 3,
    /// The poller has exited
    Stopped = 4,
}

impl From<u8> for LoopState {
    fn from(value: u8) -> Self {
        match value {
            1 => LoopState::Waiting,
            2 => LoopState::Dispatching,
            3 => LoopState::ShuttingDown,
            4 => LoopState::Stopped,
            _ => LoopState::Idle,
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "idle",
            LoopState::Waiting => "waiting",
            LoopState::Dispatching => "dispatching",
            LoopState::ShuttingDown => "shutting down",
            LoopState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

pub(crate) struct EventLoop {
    handle: EngineHandle,
    mux: Multiplexer,
    reader: Reader,
    handler: Arc<dyn Handler>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("capacity", &self.mux.capacity())
            .field("reader", &self.reader)
            .finish()
    }
}

impl EventLoop {
    pub(crate) fn new(handle: EngineHandle, mux: Multiplexer, handler: Arc<dyn Handler>) -> Self {
        let reader = Reader::new(handle.config());
        Self {
            handle,
            mux,
            reader,
            handler,
        }
    }

    /// Iterate until termination is requested or the multiplexer fails
    pub(crate) fn run(mut self) -> Result<()> {
        info!(timeout = ?self.handle.config().timeout, "Event loop started");

        let result = loop {
            if self.handle.is_shutting_down() {
                break Ok(());
            }
            if let Err(err) = self.run_once() {
                error!(error = %err, "Event loop failed");
                break Err(err);
            }
        };

        self.shutdown();
        info!("Event loop stopped");
        result
    }

    pub(crate) fn run_once(&mut self) -> Result<()> {
        let timeout = self.handle.config().timeout;

        self.mux.ensure_capacity();
        self.handle.set_state(LoopState::Waiting);
        let fired = self.mux.wait(timeout).map_err(EngineError::Multiplexer)?;
        self.handle.set_state(LoopState::Dispatching);

        self.admit_new();
        let ready = self.classify();
        if fired > 0 {
            debug!(fired, ready = ready.len(), "Events classified");
        }
        self.expire_idle();
        self.reader
            .drain(&self.handle, self.handler.as_ref(), &ready);
        self.sweep();

        self.handle.set_state(LoopState::Idle);
        Ok(())
    }

    /// Fire `on_connect` for connections upgraded since the last
    /// iteration, then decode their leftover bytes
    fn admit_new(&mut self) {
        let registry = &self.handle.shared().registry;
        for (id, leftover) in registry.take_new_connections() {
            let ctx = Context::new(id, &self.handle);
            let _ = dispatch("on_connect", id, || self.handler.on_connect(&ctx));

            if !leftover.is_empty() {
                self.reader
                    .ingest(&self.handle, self.handler.as_ref(), id, &leftover);
            }
        }
    }

    /// Queue readable records and invalidate those whose events are
    /// terminal
    fn classify(&self) -> Vec<ConnectionId> {
        let registry = &self.handle.shared().registry;
        let mut ready = Vec::new();

        for event in self.mux.events().iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }

            if event.is_error() {
                debug!(slot = token.0, "Error event");
                registry.invalidate_slot(token.0);
            } else if event.is_readable() {
                // a hang-up with data pending is drained first; the reader
                // sees end-of-file and invalidates
                if let Some(id) = registry.mark_readable(token.0) {
                    ready.push(id);
                }
            } else if event.is_read_closed() || event.is_write_closed() {
                debug!(slot = token.0, "Hang-up event");
                registry.invalidate_slot(token.0);
            }
        }

        ready
    }

    fn expire_idle(&self) {
        let Some(timeout) = self.handle.config().idle_timeout else {
            return;
        };
        for id in self.handle.shared().registry.invalidate_idle(timeout) {
            info!(connection_id = %id, ?timeout, "Idle connection invalidated");
        }
    }

    fn sweep(&mut self) {
        let shared = self.handle.shared();
        let removed = shared.registry.sweep();
        if removed.is_empty() {
            return;
        }

        shared.counters.connections_swept(removed.len());
        for id in removed {
            self.reader.forget(id);
            self.disconnected(id);
        }
    }

    fn disconnected(&self, id: ConnectionId) {
        let ctx = Context::new(id, &self.handle);
        let _ = dispatch("on_disconnect", id, || self.handler.on_disconnect(&ctx));
    }

    /// Close every remaining connection and publish the stopped state
    fn shutdown(&mut self) {
        self.sweep();

        let shared = self.handle.shared();
        // connections that never saw on_connect get no on_disconnect
        let pending: HashSet<ConnectionId> = shared
            .registry
            .take_new_connections()
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        let closed = shared.registry.close_all();
        shared.counters.connections_swept(closed.len());
        for id in closed {
            self.reader.forget(id);
            if !pending.contains(&id) {
                self.disconnected(id);
            }
        }

        self.handle.mark_stopped();
    }
}
