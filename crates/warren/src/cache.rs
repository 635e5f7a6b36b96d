// Inbound cache
//
// Decouples the consumption rate from the processing rate. Structurally
// unbounded, bounded by policy: the broker-side prefetch window is the
// primary backpressure knob, while an optional soft limit here pauses
// polling to protect memory even when prefetch is set high.
//
// Strict FIFO: an envelope leaves the cache exactly once, at the instant
// it is handed to a worker or flushed on shutdown.

use std::collections::VecDeque;

use crate::message::Envelope;

/// FIFO queue of consumed-but-unassigned envelopes.
#[derive(Debug, Default)]
pub struct InboundCache {
    entries: VecDeque<Envelope>,
    soft_limit: Option<usize>,
}

impl InboundCache {
    /// Create an empty cache without a local cap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cache that reports pressure above `soft_limit`.
    pub fn with_soft_limit(soft_limit: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            soft_limit,
        }
    }

    /// Append a newly consumed envelope.
    pub fn push(&mut self, envelope: Envelope) {
        self.entries.push_back(envelope);
    }

    /// Pop the oldest envelope for assignment.
    pub fn pop(&mut self) -> Option<Envelope> {
        self.entries.pop_front()
    }

    /// Current depth.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the soft limit is exceeded and polling should pause.
    ///
    /// Always false when no limit is configured; the prefetch window is
    /// then the only bound.
    pub fn over_limit(&self) -> bool {
        match self.soft_limit {
            Some(limit) => self.entries.len() >= limit,
            None => false,
        }
    }

    /// Remove and return every cached envelope, oldest first.
    ///
    /// Used on shutdown to requeue unassigned messages with the broker.
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.entries.drain(..).collect()
    }
}
