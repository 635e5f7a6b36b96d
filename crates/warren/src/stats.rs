// Dispatch statistics
//
// Counters are owned and mutated exclusively by the dispatcher's control
// task; everyone else sees immutable snapshot copies. All counters are
// monotonically non-decreasing for the lifetime of a run.

use serde::{Deserialize, Serialize};

/// Live counters maintained by the dispatcher.
#[derive(Debug, Default, Clone)]
pub struct StatCounters {
    consumed: u64,
    processed: u64,
    peak_num_workers: u64,
    peak_num_cached: u64,
    max_message_length: u64,
}

impl StatCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one message consumed from the broker.
    pub fn record_consumed(&mut self, message_length: usize) {
        self.consumed += 1;
        self.max_message_length = self.max_message_length.max(message_length as u64);
    }

    /// Record one message fully processed and acknowledged.
    pub fn record_processed(&mut self) {
        self.processed += 1;
    }

    /// Observe the current live worker count.
    pub fn observe_workers(&mut self, live: usize) {
        self.peak_num_workers = self.peak_num_workers.max(live as u64);
    }

    /// Observe the current cache depth.
    pub fn observe_cached(&mut self, cached: usize) {
        self.peak_num_cached = self.peak_num_cached.max(cached as u64);
    }

    /// Take an immutable snapshot copy.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            consumed: self.consumed,
            processed: self.processed,
            peak_num_workers: self.peak_num_workers,
            peak_num_cached: self.peak_num_cached,
            max_message_length: self.max_message_length,
        }
    }
}

/// Immutable point-in-time copy of the dispatcher's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Messages consumed from the broker.
    pub consumed: u64,
    /// Messages processed and acknowledged.
    pub processed: u64,
    /// Highest live worker count observed.
    pub peak_num_workers: u64,
    /// Deepest inbound cache observed.
    pub peak_num_cached: u64,
    /// Longest message body observed, in bytes.
    pub max_message_length: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let snapshot = StatCounters::new().snapshot();
        assert_eq!(snapshot, StatsSnapshot::default());
    }

    #[test]
    fn test_consumed_tracks_max_length() {
        let mut counters = StatCounters::new();
        counters.record_consumed(10);
        counters.record_consumed(512);
        counters.record_consumed(64);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.consumed, 3);
        assert_eq!(snapshot.max_message_length, 512);
    }

    #[test]
    fn test_peaks_are_monotone() {
        let mut counters = StatCounters::new();
        counters.observe_workers(4);
        counters.observe_workers(2);
        counters.observe_cached(9);
        counters.observe_cached(3);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.peak_num_workers, 4);
        assert_eq!(snapshot.peak_num_cached, 9);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut counters = StatCounters::new();
        counters.record_processed();
        let before = counters.snapshot();
        counters.record_processed();

        assert_eq!(before.processed, 1);
        assert_eq!(counters.snapshot().processed, 2);
    }
}
