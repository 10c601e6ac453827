//! Round-robin reader
//!
//! Each pass gives every still-readable connection exactly one read into
//! the poller's scratch buffer. Passes repeat while any connection yielded
//! data, so a burst on one socket cannot starve the others. This replaces
//! reading one socket until a short read: a message larger than the
//! scratch buffer is still assembled, one pass at a time.
//!
//! Bytes that end in an incomplete frame are kept per connection and
//! prefixed to the next read. When a frame is dropped before all of it has
//! arrived, the rest of it is discarded as it comes in.

use crate::config::EngineConfig;
use crate::connection::ConnectionId;
use crate::engine::EngineHandle;
use crate::handler::{dispatch, Context, Handler};
use crate::logging::log_traffic;
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::io::{self, Read};
use tracing::{debug, warn};
use wsplane_core::Decoded;

pub(crate) struct Reader {
    scratch: Vec<u8>,
    inbound: HashMap<ConnectionId, BytesMut>,
    // bytes of a dropped frame still to arrive
    discard: HashMap<ConnectionId, usize>,
    max_message_size: usize,
    verbose: bool,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("scratch", &self.scratch.len())
            .field("buffered", &self.inbound.len())
            .field("discarding", &self.discard.len())
            .finish()
    }
}

impl Reader {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            scratch: vec![0; config.read_buffer_size],
            inbound: HashMap::new(),
            discard: HashMap::new(),
            max_message_size: config.max_message_size,
            verbose: config.debug,
        }
    }

    /// Drain every connection in `ready` until none yields more data
    pub(crate) fn drain(
        &mut self,
        handle: &EngineHandle,
        handler: &dyn Handler,
        ready: &[ConnectionId],
    ) {
        let mut passes = 0usize;
        loop {
            let mut yielded = false;
            for &id in ready {
                if let Some(n) = self.read_once(handle, id) {
                    yielded = true;
                    self.inbound
                        .entry(id)
                        .or_default()
                        .extend_from_slice(&self.scratch[..n]);
                    self.process(handle, handler, id);
                }
            }
            passes += 1;
            if !yielded {
                break;
            }
        }
        log_traffic!(self.verbose, passes, connections = ready.len(), "Drain finished");
    }

    /// Decode bytes that arrived outside the read path, e.g. leftover
    /// bytes from the upgrade
    pub(crate) fn ingest(
        &mut self,
        handle: &EngineHandle,
        handler: &dyn Handler,
        id: ConnectionId,
        bytes: &[u8],
    ) {
        self.inbound.entry(id).or_default().extend_from_slice(bytes);
        self.process(handle, handler, id);
    }

    /// Drop buffered bytes of a removed connection
    pub(crate) fn forget(&mut self, id: ConnectionId) {
        self.inbound.remove(&id);
        self.discard.remove(&id);
    }

    /// One read; `Some(n)` when bytes arrived
    fn read_once(&mut self, handle: &EngineHandle, id: ConnectionId) -> Option<usize> {
        let registry = &handle.shared().registry;
        let socket = registry.readable_socket(id)?;
        let mut stream = socket.stream();

        loop {
            match stream.read(&mut self.scratch) {
                Ok(0) => {
                    debug!(connection_id = %id, "Peer closed connection");
                    registry.invalidate(id);
                    return None;
                }
                Ok(n) => {
                    registry.touch(id);
                    log_traffic!(self.verbose, connection_id = %id, bytes = n, "Read");
                    return Some(n);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    registry.clear_readable(id);
                    return None;
                }
                Err(err) => {
                    // left to the multiplexer's error class
                    debug!(connection_id = %id, error = %err, "Read failed");
                    registry.record_error(id, err.kind());
                    registry.clear_readable(id);
                    return None;
                }
            }
        }
    }

    /// Decode and dispatch every complete frame buffered for `id`
    fn process(&mut self, handle: &EngineHandle, handler: &dyn Handler, id: ConnectionId) {
        let Some(mut buf) = self.inbound.remove(&id) else {
            return;
        };
        let mut skip = self.discard.remove(&id).unwrap_or(0);
        let shared = handle.shared();

        while !buf.is_empty() {
            if !shared.registry.is_valid(id) {
                buf.clear();
                skip = 0;
                break;
            }

            if skip > 0 {
                let n = skip.min(buf.len());
                buf.advance(n);
                skip -= n;
                continue;
            }

            match wsplane_core::decode(&buf) {
                Ok(Decoded::Incomplete { needed }) if needed > self.max_message_size => {
                    warn!(
                        connection_id = %id,
                        needed,
                        max = self.max_message_size,
                        "Frame exceeds maximum message size, dropping"
                    );
                    shared.counters.protocol_error();
                    skip = needed;
                }
                Ok(Decoded::Incomplete { .. }) => break,
                Ok(Decoded::Text { payload, consumed }) => {
                    buf.advance(consumed);
                    shared.counters.frame_received();
                    match std::str::from_utf8(&payload) {
                        Ok(text) => deliver(handle, handler, id, text),
                        Err(err) => {
                            warn!(connection_id = %id, error = %err, "Text frame is not valid UTF-8, dropping");
                            shared.counters.protocol_error();
                        }
                    }
                }
                Ok(Decoded::Ping { frame }) => {
                    buf.advance(frame.len());
                    shared.counters.frame_received();
                    log_traffic!(self.verbose, connection_id = %id, "Ping received");
                    match wsplane_core::encode_pong(&frame) {
                        Ok(pong) => {
                            let sent = shared.writer.send_frame(
                                &shared.registry,
                                &shared.counters,
                                id,
                                &pong,
                            );
                            if let Err(err) = sent {
                                debug!(connection_id = %id, error = %err, "Pong not sent");
                            }
                        }
                        Err(err) => warn!(connection_id = %id, error = %err, "Malformed ping"),
                    }
                }
                Ok(Decoded::Close { .. }) => {
                    shared.counters.frame_received();
                    debug!(connection_id = %id, "Close frame received");
                    shared.registry.invalidate(id);
                    buf.clear();
                    break;
                }
                Err(err) => {
                    warn!(connection_id = %id, error = %err, "Protocol error, dropping frame");
                    shared.counters.protocol_error();
                    match err.skip_len() {
                        Some(n) => skip = n,
                        None => buf.clear(),
                    }
                }
            }
        }

        if skip > 0 {
            log_traffic!(self.verbose, connection_id = %id, remaining = skip, "Discarding rest of dropped frame");
            self.discard.insert(id, skip);
        }
        if !buf.is_empty() {
            self.inbound.insert(id, buf);
        }
    }
}

/// Hand one text frame to the application: `on_data`, then
/// `on_structured` when the text parses as JSON
fn deliver(handle: &EngineHandle, handler: &dyn Handler, id: ConnectionId, text: &str) {
    let ctx = Context::new(id, handle);
    let _ = dispatch("on_data", id, || handler.on_data(&ctx, text));

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        let _ = dispatch("on_structured", id, || handler.on_structured(&ctx, &value));
    }
}
