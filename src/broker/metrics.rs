//! Broker counters.
//!
//! Every counter is an independent atomic scoped to one `Broker`, updated
//! off the registry lock. A snapshot reads each counter once; counters only
//! grow, so a snapshot never shows a value lower than an earlier one.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    circuit_trips: AtomicU64,
    dlq_size: AtomicU64,
}

/// Point-in-time copy of the broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub failed: u64,
    pub retries: u64,
    pub circuit_trips: u64,
    pub dlq_size: u64,
}

impl Metrics {
    /// Create a metrics collector with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// A publish call was accepted.
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// A handler call returned success.
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// A pending delivery was acked.
    pub fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    /// A failed attempt was scheduled for another try.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// A subscription's circuit moved to open.
    pub fn record_circuit_trip(&self) {
        self.circuit_trips.fetch_add(1, Ordering::Relaxed);
    }

    /// A message ended in the dead-letter sink.
    pub fn record_dead_letter(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.dlq_size.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter once.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            circuit_trips: self.circuit_trips.load(Ordering::Relaxed),
            dlq_size: self.dlq_size.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_bumps_failed_and_size() {
        let metrics = Metrics::new();
        metrics.record_dead_letter();
        metrics.record_dead_letter();
        metrics.record_published();

        let snap = metrics.snapshot();
        assert_eq!(snap.failed, 2);
        assert_eq!(snap.dlq_size, 2);
        assert_eq!(snap.published, 1);
        assert_eq!(snap.delivered, 0);
    }

    #[test]
    fn snapshot_serializes_snake_case() {
        let metrics = Metrics::new();
        metrics.record_circuit_trip();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["circuit_trips"], 1);
        assert_eq!(json["dlq_size"], 0);
    }
}
