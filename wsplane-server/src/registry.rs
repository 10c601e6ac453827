//! Connection registry
//!
//! Records live in a [`Slab`] guarded by one mutex. Removal is two-phase:
//! [`Registry::invalidate`] only flips the record's validity flag, and
//! [`Registry::sweep`] later compacts every invalidated record, unregisters
//! it from the multiplexer and shuts its socket down.
//!
//! A record is registered with the multiplexer exactly while it is present
//! in the slab; both transitions happen under the registry lock.

use crate::connection::{
    ConnectionId, ConnectionInfo, ConnectionRecord, Socket, StateFlags, UpgradeContext,
};
use crate::multiplexer::Registrar;
use bytes::Bytes;
use parking_lot::Mutex;
use slab::Slab;
use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Inner {
    records: Slab<ConnectionRecord>,
    next_serial: u64,
    /// Invalidations since the last sweep
    pending_invalid: usize,
    /// Set by `add`, cleared when the poller admits new connections
    changed: bool,
    total_connections: u64,
    peak_connections: usize,
    swept_connections: u64,
}

impl Inner {
    fn get(&self, id: ConnectionId) -> Option<&ConnectionRecord> {
        self.records.get(id.slot()).filter(|r| r.id == id)
    }

    fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionRecord> {
        self.records.get_mut(id.slot()).filter(|r| r.id == id)
    }

    fn invalidate(&mut self, slot: usize) -> bool {
        let Some(record) = self.records.get_mut(slot) else {
            return false;
        };
        record.flags.remove(StateFlags::READABLE);
        if record.socket.invalidate() {
            self.pending_invalid += 1;
            true
        } else {
            false
        }
    }
}

/// Counters kept by the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounters {
    /// Records currently present (valid or awaiting sweep)
    pub present: usize,
    /// Records added since creation
    pub total_connections: u64,
    /// Highest number of records present at once
    pub peak_connections: usize,
    /// Records removed by sweeps
    pub swept_connections: u64,
}

/// Mutex-guarded collection of connection records
#[derive(Debug)]
pub struct Registry {
    inner: Mutex<Inner>,
    sweep_lock: Mutex<()>,
    registrar: Registrar,
}

impl Registry {
    /// Create an empty registry bound to a multiplexer registrar
    pub fn new(registrar: Registrar) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            sweep_lock: Mutex::new(()),
            registrar,
        }
    }

    /// Insert a freshly upgraded socket and register it for readability.
    ///
    /// The stream must already be non-blocking.
    pub fn add(
        &self,
        stream: TcpStream,
        upgrade: Option<Arc<dyn UpgradeContext>>,
        leftover: Bytes,
    ) -> io::Result<ConnectionId> {
        let mut inner = self.inner.lock();
        inner.next_serial += 1;
        let serial = inner.next_serial;

        let entry = inner.records.vacant_entry();
        let id = ConnectionId::new(entry.key(), serial);
        let record = ConnectionRecord::new(id, stream, upgrade, leftover);
        self.registrar.register(&record)?;
        entry.insert(record);

        inner.changed = true;
        inner.total_connections += 1;
        inner.peak_connections = inner.peak_connections.max(inner.records.len());
        debug!(connection_id = %id, "Connection added");
        Ok(id)
    }

    /// Mark a connection dead. Idempotent; returns `true` on the first call.
    pub fn invalidate(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.lock();
        if inner.get(id).is_none() {
            return false;
        }
        let flipped = inner.invalidate(id.slot());
        if flipped {
            debug!(connection_id = %id, "Connection invalidated");
        }
        flipped
    }

    /// Mark whatever record occupies `slot` dead (used for multiplexer tokens)
    pub(crate) fn invalidate_slot(&self, slot: usize) -> bool {
        self.inner.lock().invalidate(slot)
    }

    /// Remove every invalidated record, unregister it and close its socket.
    ///
    /// Returns the removed ids. A no-op when nothing was invalidated since
    /// the previous sweep.
    pub fn sweep(&self) -> Vec<ConnectionId> {
        let _sweeping = self.sweep_lock.lock();

        let removed: Vec<ConnectionRecord> = {
            let mut inner = self.inner.lock();
            if inner.pending_invalid == 0 {
                return Vec::new();
            }

            let dead: Vec<usize> = inner
                .records
                .iter()
                .filter(|(_, record)| !record.is_valid())
                .map(|(slot, _)| slot)
                .collect();

            let mut removed = Vec::with_capacity(dead.len());
            for slot in dead {
                let record = inner.records.remove(slot);
                if let Err(err) = self.registrar.unregister(&record) {
                    warn!(connection_id = %record.id, error = %err, "Failed to unregister socket");
                }
                removed.push(record);
            }
            inner.pending_invalid = 0;
            inner.swept_connections += removed.len() as u64;
            removed
        };

        // shutdown and downgrade run without the registry lock
        removed
            .into_iter()
            .map(|record| {
                let id = record.id;
                record.close();
                debug!(connection_id = %id, "Connection swept");
                id
            })
            .collect()
    }

    /// Invalidate every record and sweep them all
    pub fn close_all(&self) -> Vec<ConnectionId> {
        {
            let mut inner = self.inner.lock();
            let slots: Vec<usize> = inner.records.iter().map(|(slot, _)| slot).collect();
            for slot in slots {
                inner.invalidate(slot);
            }
            // force the sweep even if every record was already dead
            inner.pending_invalid = inner.pending_invalid.max(1);
        }
        self.sweep()
    }

    /// Ids of every currently valid record
    pub fn snapshot_handles(&self) -> Vec<ConnectionId> {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|(_, record)| record.is_valid())
            .map(|(_, record)| record.id)
            .collect()
    }

    pub(crate) fn socket(&self, id: ConnectionId) -> Option<Arc<Socket>> {
        self.inner
            .lock()
            .get(id)
            .filter(|record| record.is_valid())
            .map(|record| record.socket.clone())
    }

    /// Socket of a valid record whose `READABLE` flag is still set
    pub(crate) fn readable_socket(&self, id: ConnectionId) -> Option<Arc<Socket>> {
        self.inner
            .lock()
            .get(id)
            .filter(|record| record.is_valid() && record.flags.contains(StateFlags::READABLE))
            .map(|record| record.socket.clone())
    }

    /// Flag the record at `slot` for draining and return its id
    pub(crate) fn mark_readable(&self, slot: usize) -> Option<ConnectionId> {
        let mut inner = self.inner.lock();
        let record = inner.records.get_mut(slot)?;
        if !record.is_valid() {
            return None;
        }
        record.flags.insert(StateFlags::READABLE);
        Some(record.id)
    }

    pub(crate) fn clear_readable(&self, id: ConnectionId) {
        if let Some(record) = self.inner.lock().get_mut(id) {
            record.flags.remove(StateFlags::READABLE);
        }
    }

    /// Record successful traffic on a connection
    pub(crate) fn touch(&self, id: ConnectionId) {
        if let Some(record) = self.inner.lock().get_mut(id) {
            record.last_activity = Instant::now();
        }
    }

    pub(crate) fn record_error(&self, id: ConnectionId, kind: io::ErrorKind) {
        if let Some(record) = self.inner.lock().get_mut(id) {
            record.last_error = Some(kind);
        }
    }

    /// Connections whose `on_connect` has not fired yet, with any bytes
    /// buffered during the upgrade.
    pub(crate) fn take_new_connections(&self) -> Vec<(ConnectionId, Bytes)> {
        let mut inner = self.inner.lock();
        if !inner.changed {
            return Vec::new();
        }
        inner.changed = false;
        inner
            .records
            .iter_mut()
            .filter(|(_, record)| record.flags.contains(StateFlags::CONNECT_PENDING))
            .map(|(_, record)| {
                record.flags.remove(StateFlags::CONNECT_PENDING);
                (record.id, std::mem::take(&mut record.leftover))
            })
            .collect()
    }

    /// Invalidate every valid record idle for longer than `timeout`
    pub(crate) fn invalidate_idle(&self, timeout: Duration) -> Vec<ConnectionId> {
        let mut inner = self.inner.lock();
        let idle: Vec<(usize, ConnectionId)> = inner
            .records
            .iter()
            .filter(|(_, record)| record.is_valid() && record.last_activity.elapsed() > timeout)
            .map(|(slot, record)| (slot, record.id))
            .collect();
        for (slot, _) in &idle {
            inner.invalidate(*slot);
        }
        idle.into_iter().map(|(_, id)| id).collect()
    }

    /// Whether `id` refers to a present and valid record
    pub fn is_valid(&self, id: ConnectionId) -> bool {
        self.inner
            .lock()
            .get(id)
            .map(|record| record.is_valid())
            .unwrap_or(false)
    }

    /// Snapshot of one connection
    pub fn info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.inner.lock().get(id).map(ConnectionRecord::info)
    }

    /// Number of records present, including invalidated ones awaiting sweep
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Whether no records are present
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registry counters
    pub fn counters(&self) -> RegistryCounters {
        let inner = self.inner.lock();
        RegistryCounters {
            present: inner.records.len(),
            total_connections: inner.total_connections,
            peak_connections: inner.peak_connections,
            swept_connections: inner.swept_connections,
        }
    }

    /// Registrar shared with the multiplexer
    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }
}
