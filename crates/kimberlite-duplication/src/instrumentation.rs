//! Lightweight production counters for the duplication pipeline.
//!
//! Scaled down from `kimberlite-vsr::instrumentation`'s histogram-and-gauge
//! metrics registry to the handful of counters this crate's much smaller
//! surface actually needs: no latency histograms, just atomic throughput
//! and failure counters safe to read from any thread without locking.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-duplicator or per-host counter block. Create one per
/// [`crate::duplicator::Duplicator`] or [`crate::host::DuplicationHost`]
/// instance rather than sharing a single global — unlike VSR's
/// process-wide protocol metrics, duplication counters are naturally
/// scoped per relationship.
#[derive(Debug, Default)]
pub struct DuplicationMetrics {
    mutations_read_total: AtomicU64,
    messages_shipped_total: AtomicU64,
    ship_attempts_total: AtomicU64,
    ship_failures_total: AtomicU64,
    corrupt_blocks_total: AtomicU64,
    rotations_total: AtomicU64,
    sync_ticks_total: AtomicU64,
    sync_skipped_in_flight_total: AtomicU64,
    sync_failures_total: AtomicU64,
}

impl DuplicationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_mutations_read(&self, count: u64) {
        self.mutations_read_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_ship_attempt(&self) {
        self.ship_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ship_success(&self, messages: u64) {
        self.messages_shipped_total.fetch_add(messages, Ordering::Relaxed);
    }

    pub fn record_ship_failure(&self) {
        self.ship_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt_block(&self) {
        self.corrupt_blocks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        self.rotations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_tick(&self) {
        self.sync_ticks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_skipped_in_flight(&self) {
        self.sync_skipped_in_flight_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_failure(&self) {
        self.sync_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of every counter for a command-manager-style dump.
    pub fn snapshot(&self) -> DuplicationMetricsSnapshot {
        DuplicationMetricsSnapshot {
            mutations_read_total: self.mutations_read_total.load(Ordering::Relaxed),
            messages_shipped_total: self.messages_shipped_total.load(Ordering::Relaxed),
            ship_attempts_total: self.ship_attempts_total.load(Ordering::Relaxed),
            ship_failures_total: self.ship_failures_total.load(Ordering::Relaxed),
            corrupt_blocks_total: self.corrupt_blocks_total.load(Ordering::Relaxed),
            rotations_total: self.rotations_total.load(Ordering::Relaxed),
            sync_ticks_total: self.sync_ticks_total.load(Ordering::Relaxed),
            sync_skipped_in_flight_total: self.sync_skipped_in_flight_total.load(Ordering::Relaxed),
            sync_failures_total: self.sync_failures_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DuplicationMetricsSnapshot {
    pub mutations_read_total: u64,
    pub messages_shipped_total: u64,
    pub ship_attempts_total: u64,
    pub ship_failures_total: u64,
    pub corrupt_blocks_total: u64,
    pub rotations_total: u64,
    pub sync_ticks_total: u64,
    pub sync_skipped_in_flight_total: u64,
    pub sync_failures_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = DuplicationMetrics::new();
        assert_eq!(metrics.snapshot(), DuplicationMetricsSnapshot::default());
    }

    #[test]
    fn recording_accumulates() {
        let metrics = DuplicationMetrics::new();
        metrics.record_mutations_read(5);
        metrics.record_ship_attempt();
        metrics.record_ship_success(5);
        metrics.record_ship_failure();
        metrics.record_corrupt_block();
        metrics.record_rotation();
        metrics.record_sync_tick();
        metrics.record_sync_skipped_in_flight();
        metrics.record_sync_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.mutations_read_total, 5);
        assert_eq!(snapshot.messages_shipped_total, 5);
        assert_eq!(snapshot.ship_attempts_total, 1);
        assert_eq!(snapshot.ship_failures_total, 1);
        assert_eq!(snapshot.corrupt_blocks_total, 1);
        assert_eq!(snapshot.rotations_total, 1);
        assert_eq!(snapshot.sync_ticks_total, 1);
        assert_eq!(snapshot.sync_skipped_in_flight_total, 1);
        assert_eq!(snapshot.sync_failures_total, 1);
    }
}
