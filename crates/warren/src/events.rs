// Dispatch lifecycle events
//
// Observer hooks fired on dispatch milestones. Delivery is synchronous on
// the dispatcher's own control task: callbacks must not block for long,
// as they delay the next control-loop iteration. Registration is a plain
// map from event kind to an ordered list of callbacks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatcher::ControlHandle;
use crate::message::DeliveryTag;
use crate::stats::StatsSnapshot;

/// Recognized lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A worker completed a message and the broker was acked.
    Processed,
    /// A worker exited, cleanly or by crash.
    WorkerExit,
    /// A recoverable or fatal error was observed.
    Error,
    /// The dispatcher reached its stopped state.
    Shutdown,
}

impl EventKind {
    /// Canonical event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Processed => "processed",
            EventKind::WorkerExit => "workerExit",
            EventKind::Error => "error",
            EventKind::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted during dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DispatcherEvent {
    /// A worker processed a message; the delivery was acknowledged.
    Processed {
        worker_id: String,
        delivery_tag: DeliveryTag,
        redelivered: bool,
        timestamp: DateTime<Utc>,
    },

    /// A worker exited.
    WorkerExit {
        worker_id: String,
        /// True for a crash or liveness timeout, false for a clean exit.
        crashed: bool,
        /// Whether an in-flight message was requeued with the broker.
        requeued: bool,
        timestamp: DateTime<Utc>,
    },

    /// An error surfaced to the operator.
    Error {
        reason: String,
        /// Whether this error ends the running phase.
        fatal: bool,
        timestamp: DateTime<Utc>,
    },

    /// Final event of a run, carrying the closing stats snapshot.
    Shutdown {
        stats: StatsSnapshot,
        timestamp: DateTime<Utc>,
    },
}

impl DispatcherEvent {
    /// Create a processed event.
    pub fn processed(
        worker_id: impl Into<String>,
        delivery_tag: DeliveryTag,
        redelivered: bool,
    ) -> Self {
        DispatcherEvent::Processed {
            worker_id: worker_id.into(),
            delivery_tag,
            redelivered,
            timestamp: Utc::now(),
        }
    }

    /// Create a worker-exit event.
    pub fn worker_exit(worker_id: impl Into<String>, crashed: bool, requeued: bool) -> Self {
        DispatcherEvent::WorkerExit {
            worker_id: worker_id.into(),
            crashed,
            requeued,
            timestamp: Utc::now(),
        }
    }

    /// Create an error event.
    pub fn error(reason: impl Into<String>, fatal: bool) -> Self {
        DispatcherEvent::Error {
            reason: reason.into(),
            fatal,
            timestamp: Utc::now(),
        }
    }

    /// Create a shutdown event.
    pub fn shutdown(stats: StatsSnapshot) -> Self {
        DispatcherEvent::Shutdown {
            stats,
            timestamp: Utc::now(),
        }
    }

    /// The kind this event is dispatched under.
    pub fn kind(&self) -> EventKind {
        match self {
            DispatcherEvent::Processed { .. } => EventKind::Processed,
            DispatcherEvent::WorkerExit { .. } => EventKind::WorkerExit,
            DispatcherEvent::Error { .. } => EventKind::Error,
            DispatcherEvent::Shutdown { .. } => EventKind::Shutdown,
        }
    }
}

/// Context handed to every callback alongside the event.
///
/// Carries a point-in-time stats snapshot and a control handle, so a
/// callback can inspect progress or request shutdown without touching
/// dispatcher internals.
pub struct EventContext<'a> {
    stats: StatsSnapshot,
    live_workers: usize,
    control: &'a ControlHandle,
}

impl<'a> EventContext<'a> {
    pub(crate) fn new(
        stats: StatsSnapshot,
        live_workers: usize,
        control: &'a ControlHandle,
    ) -> Self {
        Self {
            stats,
            live_workers,
            control,
        }
    }

    /// Stats snapshot taken when the event fired.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats
    }

    /// Live worker count when the event fired.
    pub fn count_workers(&self) -> usize {
        self.live_workers
    }

    /// Request a graceful shutdown of the dispatcher.
    pub fn shutdown(&self) {
        self.control.shutdown();
    }
}

/// Callback invoked synchronously on the dispatcher's control task.
pub type EventCallback = Box<dyn FnMut(&DispatcherEvent, &EventContext<'_>) + Send>;

/// Registration table mapping event kinds to ordered callback lists.
#[derive(Default)]
pub struct EventRegistry {
    callbacks: HashMap<EventKind, Vec<EventCallback>>,
}

impl EventRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for an event kind.
    ///
    /// Callbacks for the same kind fire in registration order.
    pub fn on(&mut self, kind: EventKind, callback: EventCallback) {
        self.callbacks.entry(kind).or_default().push(callback);
    }

    /// Invoke every callback registered for the event's kind.
    pub fn emit(&mut self, event: &DispatcherEvent, context: &EventContext<'_>) {
        if let Some(callbacks) = self.callbacks.get_mut(&event.kind()) {
            for callback in callbacks.iter_mut() {
                callback(event, context);
            }
        }
    }

    /// Number of callbacks registered for a kind.
    pub fn count(&self, kind: EventKind) -> usize {
        self.callbacks.get(&kind).map_or(0, Vec::len)
    }
}
