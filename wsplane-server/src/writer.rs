//! Unicast and multicast writes
//!
//! Every send goes through one lock so frames from concurrent callers never
//! interleave on a socket. The registry lock is only taken for lookups,
//! never across a send.

use crate::config::EngineConfig;
use crate::connection::{ConnectionId, Socket};
use crate::error::{is_fatal_socket_error, EngineError, Result};
use crate::logging::log_traffic;
use crate::registry::Registry;
use crate::stats::Counters;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Pause between attempts when the socket send buffer is full
const WRITE_BACKOFF: Duration = Duration::from_micros(200);

/// Serialized frame writer
#[derive(Debug)]
pub(crate) struct Writer {
    lock: Mutex<()>,
    mtu: usize,
    write_timeout: Duration,
    verbose: bool,
}

impl Writer {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            lock: Mutex::new(()),
            mtu: config.mtu,
            write_timeout: config.write_timeout,
            verbose: config.debug,
        }
    }

    /// Send `payload` as one text frame to `id`
    pub(crate) fn write(
        &self,
        registry: &Registry,
        counters: &Counters,
        id: ConnectionId,
        payload: &str,
    ) -> Result<()> {
        let frame = self.encode(payload)?;
        self.send_frame(registry, counters, id, &frame)
    }

    /// Send `payload` to every valid connection; returns how many were
    /// reached. Failing recipients are logged and skipped.
    pub(crate) fn broadcast(
        &self,
        registry: &Registry,
        counters: &Counters,
        payload: &str,
    ) -> Result<usize> {
        let frame = self.encode(payload)?;
        let _guard = self.lock.lock();

        let mut delivered = 0;
        for id in registry.snapshot_handles() {
            let Some(socket) = registry.socket(id) else {
                continue;
            };
            match self.send_all(registry, id, &socket, &frame) {
                Ok(()) => {
                    registry.touch(id);
                    delivered += 1;
                }
                Err(err) => {
                    warn!(connection_id = %id, error = %err, "Broadcast skipped recipient");
                }
            }
        }

        counters.frames_sent(delivered as u64);
        log_traffic!(self.verbose, delivered, len = payload.len(), "Broadcast sent");
        Ok(delivered)
    }

    /// Send an already encoded frame, e.g. a pong
    pub(crate) fn send_frame(
        &self,
        registry: &Registry,
        counters: &Counters,
        id: ConnectionId,
        frame: &[u8],
    ) -> Result<()> {
        let _guard = self.lock.lock();
        let socket = registry
            .socket(id)
            .ok_or_else(|| EngineError::fatal_write(format!("connection {} is not valid", id)))?;

        self.send_all(registry, id, &socket, frame)?;
        registry.touch(id);
        counters.frames_sent(1);
        log_traffic!(self.verbose, connection_id = %id, len = frame.len(), "Frame sent");
        Ok(())
    }

    fn encode(&self, payload: &str) -> Result<Bytes> {
        if payload.len() > self.mtu {
            return Err(EngineError::fatal_write(format!(
                "payload of {} bytes exceeds MTU {}",
                payload.len(),
                self.mtu
            )));
        }
        wsplane_core::encode(payload.as_bytes(), false)
            .map_err(|err| EngineError::fatal_write(err.to_string()))
    }

    /// Blocking-retry send loop over a non-blocking socket
    fn send_all(
        &self,
        registry: &Registry,
        id: ConnectionId,
        socket: &Socket,
        frame: &[u8],
    ) -> Result<()> {
        let started = Instant::now();
        let mut written = 0;

        while written < frame.len() {
            let Some(result) = socket.write_if_valid(&frame[written..]) else {
                return Err(EngineError::fatal_write(format!(
                    "connection {} was invalidated",
                    id
                )));
            };

            match result {
                Ok(0) => return Err(fail(registry, id, io::ErrorKind::WriteZero.into())),
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let waited = started.elapsed();
                    if waited >= self.write_timeout {
                        registry.record_error(id, err.kind());
                        return Err(EngineError::WriteTimeout { id, waited });
                    }
                    std::thread::sleep(WRITE_BACKOFF);
                }
                Err(err) => return Err(fail(registry, id, err)),
            }
        }

        Ok(())
    }
}

fn fail(registry: &Registry, id: ConnectionId, err: io::Error) -> EngineError {
    registry.record_error(id, err.kind());
    if is_fatal_socket_error(&err) {
        registry.invalidate(id);
        info!(connection_id = %id, error = %err, "Connection lost while writing");
    } else {
        warn!(connection_id = %id, error = %err, "Write failed");
    }
    EngineError::WriteFailed { id, source: err }
}
