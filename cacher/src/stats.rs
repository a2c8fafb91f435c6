//! Optional traffic counters for the client-facing socket.

use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Packet and byte counters, ticked by the dispatcher for every received
/// datagram and drained once a second by the reporter task. Disabled
/// counters cost a single branch per packet.
#[derive(Debug)]
pub struct Stats {
    pps_enabled: bool,
    bps_enabled: bool,
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl Stats {
    pub fn new(pps_enabled: bool, bps_enabled: bool) -> Self {
        Self {
            pps_enabled,
            bps_enabled,
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.pps_enabled || self.bps_enabled
    }

    pub fn record(&self, len: usize) {
        if self.pps_enabled {
            self.packets.fetch_add(1, Ordering::Relaxed);
        }
        if self.bps_enabled {
            self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        }
    }

    fn take_packets(&self) -> u64 {
        self.packets.swap(0, Ordering::Relaxed)
    }

    fn take_bytes(&self) -> u64 {
        self.bytes.swap(0, Ordering::Relaxed)
    }
}

/// Logs and resets the enabled counters once a second until shutdown.
pub async fn run_reporter(stats: Arc<Stats>, mut shutdown: watch::Receiver<bool>) {
    let mut timer = tokio::time::interval(Duration::from_secs(1));
    // Skip the first tick since it fires immediately
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                if stats.pps_enabled {
                    info!("Packets/s: {}", stats.take_packets());
                }
                if stats.bps_enabled {
                    info!("Bits/s: {}", stats.take_bytes() * 8);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_counts_when_enabled() {
        let stats = Stats::new(true, true);

        stats.record(25);
        stats.record(9);
        stats.record(29);

        assert_eq!(stats.take_packets(), 3);
        assert_eq!(stats.take_bytes(), 63);
    }

    #[test]
    fn test_take_resets_counters() {
        let stats = Stats::new(true, true);

        stats.record(100);
        assert_eq!(stats.take_packets(), 1);
        assert_eq!(stats.take_packets(), 0);
        assert_eq!(stats.take_bytes(), 0);
    }

    #[test]
    fn test_disabled_counters_stay_zero() {
        let stats = Stats::new(false, false);

        stats.record(25);
        stats.record(25);

        assert!(!stats.enabled());
        assert_eq!(stats.take_packets(), 0);
        assert_eq!(stats.take_bytes(), 0);
    }

    #[test]
    fn test_partially_enabled() {
        let stats = Stats::new(true, false);

        stats.record(42);

        assert!(stats.enabled());
        assert_eq!(stats.take_packets(), 1);
        assert_eq!(stats.take_bytes(), 0);
    }
}
