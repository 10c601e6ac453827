//! Engine statistics
//!
//! Counters are plain atomics; with the `metrics` feature each increment is
//! mirrored to the global `metrics` recorder.

use crate::registry::RegistryCounters;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    protocol_errors: AtomicU64,
}

impl Counters {
    pub(crate) fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!("wsplane_frames_received_total").increment(1);
    }

    pub(crate) fn frames_sent(&self, count: u64) {
        self.frames_sent.fetch_add(count, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!("wsplane_frames_sent_total").increment(count);
    }

    pub(crate) fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!("wsplane_protocol_errors_total").increment(1);
    }

    pub(crate) fn connection_opened(&self) {
        #[cfg(feature = "metrics")]
        metrics::counter!("wsplane_connections_opened_total").increment(1);
    }

    pub(crate) fn connections_swept(&self, _count: usize) {
        #[cfg(feature = "metrics")]
        metrics::counter!("wsplane_connections_swept_total").increment(_count as u64);
    }

    pub(crate) fn snapshot(&self, registry: RegistryCounters, active: usize) -> EngineStats {
        EngineStats {
            active_connections: active,
            present_connections: registry.present,
            total_connections: registry.total_connections,
            peak_connections: registry.peak_connections,
            swept_connections: registry.swept_connections,
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

/// Engine statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Valid connections
    pub active_connections: usize,
    /// Records present, including invalidated ones awaiting sweep
    pub present_connections: usize,
    /// Connections upgraded since the engine was created
    pub total_connections: u64,
    /// Highest number of records present at once
    pub peak_connections: usize,
    /// Records removed by sweeps
    pub swept_connections: u64,
    /// Frames decoded (text, ping and close)
    pub frames_received: u64,
    /// Frames written, pongs included
    pub frames_sent: u64,
    /// Frames dropped as malformed or unsupported
    pub protocol_errors: u64,
}
