//! Traffic statistics
//!
//! The relay's serial context owns one [`StatsCollector`] per tunnel
//! instance; nothing else writes to it, so it carries no locks. Inbound
//! batches shed before reaching that context are tallied in a shared
//! [`DropCounter`] and folded in later. Callers only ever see [`WgStats`]
//! snapshots.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Byte counters for one tunnel instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WgStats {
    /// Bytes written to peer UDP sessions
    pub bytes_sent: u64,
    /// Bytes received from peer UDP sessions
    pub bytes_received: u64,
}

impl fmt::Display for WgStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent {}, received {}",
            format_bytes(self.bytes_sent),
            format_bytes(self.bytes_received)
        )
    }
}

/// Accumulates counters for the lifetime of one tunnel instance
#[derive(Debug)]
pub struct StatsCollector {
    stats: WgStats,
    dropped_batches: u64,
    dropped_bytes: u64,
    inbound_dropped_batches: u64,
    inbound_dropped_bytes: u64,
    started_at: Instant,
}

impl StatsCollector {
    /// Fresh collector with all counters at zero
    pub fn new() -> Self {
        Self {
            stats: WgStats::default(),
            dropped_batches: 0,
            dropped_bytes: 0,
            inbound_dropped_batches: 0,
            inbound_dropped_bytes: 0,
            started_at: Instant::now(),
        }
    }

    /// Record a completed write to a peer session
    pub fn add_sent(&mut self, bytes: usize) {
        self.stats.bytes_sent = self.stats.bytes_sent.saturating_add(bytes as u64);
    }

    /// Record datagrams received from a peer session
    pub fn add_received(&mut self, bytes: usize) {
        self.stats.bytes_received = self.stats.bytes_received.saturating_add(bytes as u64);
    }

    /// Record a batch discarded because its session was not ready
    pub fn add_dropped(&mut self, bytes: usize) {
        self.dropped_batches += 1;
        self.dropped_bytes = self.dropped_bytes.saturating_add(bytes as u64);
        trace!("Dropped batch of {} bytes ({} total)", bytes, self.dropped_batches);
    }

    /// Move whatever `counter` has tallied into this collector
    pub fn absorb_inbound_drops(&mut self, counter: &DropCounter) {
        let (batches, bytes) = counter.take();
        if batches > 0 {
            trace!("Inbound queue shed {} batch(es), {} bytes", batches, bytes);
        }
        self.inbound_dropped_batches += batches;
        self.inbound_dropped_bytes = self.inbound_dropped_bytes.saturating_add(bytes);
    }

    /// Current counters
    pub fn snapshot(&self) -> WgStats {
        self.stats
    }

    /// Batches discarded so far
    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches
    }

    /// Bytes discarded so far
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Inbound batches shed because the relay was behind
    pub fn inbound_dropped_batches(&self) -> u64 {
        self.inbound_dropped_batches
    }

    /// Inbound bytes shed because the relay was behind
    pub fn inbound_dropped_bytes(&self) -> u64 {
        self.inbound_dropped_bytes
    }

    /// Time since the tunnel instance started
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop tally shared with producers outside the serial context
#[derive(Debug, Default)]
pub struct DropCounter {
    batches: AtomicU64,
    bytes: AtomicU64,
}

impl DropCounter {
    /// Empty counter
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one dropped batch of `bytes`
    pub fn record(&self, bytes: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Reset to zero, returning `(batches, bytes)`
    pub fn take(&self) -> (u64, u64) {
        (
            self.batches.swap(0, Ordering::Relaxed),
            self.bytes.swap(0, Ordering::Relaxed),
        )
    }
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
