//! Classifier Statistics
//!
//! Lock-free counters for the delivery hot path; relaxed increments, read
//! through a non-atomic snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-classifier counters (cache-line aligned).
#[derive(Debug, Default)]
#[repr(C, align(64))]
pub struct ClassifierStats {
    /// Frames pushed onto a flow ring.
    pub delivered: AtomicU64,
    /// Frames claimed but dropped on ring overflow.
    pub dropped: AtomicU64,
    /// Frames rejected before the IP header was readable.
    pub unclaimed_short: AtomicU64,
    /// Frames rejected as non-TCP or truncated before the TCP header.
    pub unclaimed_not_tcp: AtomicU64,
    /// TCP frames with no registered flow.
    pub unclaimed_no_match: AtomicU64,
    /// Control messages applied.
    pub control_processed: AtomicU64,
    /// Consumer wakeups issued after delivery.
    pub consumer_wakes: AtomicU64,
    /// Poller wakeups issued.
    pub poll_wakes: AtomicU64,
}

impl ClassifierStats {
    #[inline(always)]
    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_unclaimed_short(&self) {
        self.unclaimed_short.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_unclaimed_not_tcp(&self) {
        self.unclaimed_not_tcp.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_unclaimed_no_match(&self) {
        self.unclaimed_no_match.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_control(&self) {
        self.control_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_consumer_wake(&self) {
        self.consumer_wakes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_poll_wake(&self) {
        self.poll_wakes.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough point-in-time view of all counters.
    pub fn snapshot(&self) -> ClassifierStatsSnapshot {
        ClassifierStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            unclaimed_short: self.unclaimed_short.load(Ordering::Relaxed),
            unclaimed_not_tcp: self.unclaimed_not_tcp.load(Ordering::Relaxed),
            unclaimed_no_match: self.unclaimed_no_match.load(Ordering::Relaxed),
            control_processed: self.control_processed.load(Ordering::Relaxed),
            consumer_wakes: self.consumer_wakes.load(Ordering::Relaxed),
            poll_wakes: self.poll_wakes.load(Ordering::Relaxed),
        }
    }
}

/// Non-atomic counter snapshot.
#[derive(Debug, Clone, Default)]
pub struct ClassifierStatsSnapshot {
    /// Frames pushed onto a flow ring.
    pub delivered: u64,
    /// Frames claimed but dropped on ring overflow.
    pub dropped: u64,
    /// Frames rejected before the IP header was readable.
    pub unclaimed_short: u64,
    /// Frames rejected as non-TCP or truncated before the TCP header.
    pub unclaimed_not_tcp: u64,
    /// TCP frames with no registered flow.
    pub unclaimed_no_match: u64,
    /// Control messages applied.
    pub control_processed: u64,
    /// Consumer wakeups issued after delivery.
    pub consumer_wakes: u64,
    /// Poller wakeups issued.
    pub poll_wakes: u64,
}

impl ClassifierStatsSnapshot {
    /// All frames the classifier claimed (delivered or dropped).
    pub fn claimed(&self) -> u64 {
        self.delivered + self.dropped
    }

    /// All frames returned to the caller unclaimed.
    pub fn unclaimed(&self) -> u64 {
        self.unclaimed_short + self.unclaimed_not_tcp + self.unclaimed_no_match
    }

    /// Fraction of seen frames that were claimed.
    pub fn claim_rate(&self) -> f64 {
        let total = self.claimed() + self.unclaimed();
        if total == 0 {
            return 0.0;
        }
        self.claimed() as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = ClassifierStats::default();
        stats.record_delivered();
        stats.record_delivered();
        stats.record_dropped();
        stats.record_unclaimed_no_match();

        let snap = stats.snapshot();
        assert_eq!(snap.delivered, 2);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.claimed(), 3);
        assert_eq!(snap.unclaimed(), 1);
        assert!((snap.claim_rate() - 0.75).abs() < f64::EPSILON);
    }
}
