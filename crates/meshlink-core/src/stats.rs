//! Traffic counters and snapshots
//!
//! Counters are plain atomics; nothing here takes a lock. `rx` counts
//! packets read from the virtual interface (host toward the mesh), `tx`
//! counts packets written to it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared counter registry
#[derive(Debug, Default)]
pub struct Stats {
    rx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    p2p_sent: AtomicU64,
    relay_sent: AtomicU64,
    dropped: AtomicU64,
    /// Unix seconds of the most recent connect; 0 when never connected
    connect_time: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn inc_p2p_sent(&self) {
        self.p2p_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_relay_sent(&self) {
        self.relay_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Stamp the connect time with the current wall clock
    pub fn mark_connected(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.connect_time.store(now, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let connect_time = self.connect_time.load(Ordering::Relaxed);
        StatsSnapshot {
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            p2p_sent: self.p2p_sent.load(Ordering::Relaxed),
            relay_sent: self.relay_sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            connect_time: (connect_time != 0).then_some(connect_time),
        }
    }
}

/// Read-only view of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub p2p_sent: u64,
    pub relay_sent: u64,
    pub dropped: u64,
    /// Unix seconds of the most recent connect
    pub connect_time: Option<u64>,
}
