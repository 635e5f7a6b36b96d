// Dispatcher configuration
//
// Plain configuration value with builder-style setters. Worker
// construction options (pool size, liveness timeout) and flow-control
// knobs (prefetch, cache soft limit) live together here; the handler
// capability is passed separately when the dispatcher is created.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Queues to consume from.
    pub queues: Vec<String>,

    /// Number of worker units to keep alive.
    pub num_workers: usize,

    /// Broker prefetch window (0 = unlimited).
    pub prefetch: u16,

    /// Local cache depth at which polling pauses (None = prefetch only).
    pub cache_soft_limit: Option<usize>,

    /// Messages polled from the broker per control-loop cycle.
    pub poll_batch: usize,

    /// How long a busy worker may go silent before it is treated as dead.
    #[serde(with = "duration_millis")]
    pub response_timeout: Duration,

    /// Control-loop tick when nothing is immediately runnable.
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,

    /// Hard deadline for draining; stragglers are force-killed after it.
    #[serde(default, with = "opt_duration_millis")]
    pub drain_deadline: Option<Duration>,

    /// Requeue the in-flight message of a crashed worker.
    pub requeue_on_crash: bool,

    /// Requeue messages the handler explicitly rejected.
    pub requeue_on_failure: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queues: vec![],
            num_workers: 4,
            prefetch: 0,
            cache_soft_limit: None,
            poll_batch: 64,
            response_timeout: Duration::from_secs(60),
            tick_interval: Duration::from_millis(20),
            drain_deadline: Some(Duration::from_secs(30)),
            requeue_on_crash: true,
            requeue_on_failure: false,
        }
    }
}

impl DispatcherConfig {
    /// Create a configuration for the given queues.
    pub fn new(queues: Vec<String>) -> Self {
        Self {
            queues,
            ..Default::default()
        }
    }

    /// Set the worker pool size (minimum 1).
    pub fn with_num_workers(mut self, num: usize) -> Self {
        self.num_workers = num.max(1);
        self
    }

    /// Set the broker prefetch window.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set the local cache soft limit.
    pub fn with_cache_soft_limit(mut self, limit: usize) -> Self {
        self.cache_soft_limit = Some(limit);
        self
    }

    /// Set the per-cycle poll batch (minimum 1).
    pub fn with_poll_batch(mut self, batch: usize) -> Self {
        self.poll_batch = batch.max(1);
        self
    }

    /// Set the worker liveness timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the control-loop tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set or clear the hard drain deadline.
    pub fn with_drain_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.drain_deadline = deadline;
        self
    }

    /// Choose whether a crashed worker's message is requeued.
    pub fn with_requeue_on_crash(mut self, requeue: bool) -> Self {
        self.requeue_on_crash = requeue;
        self
    }

    /// Choose whether handler-rejected messages are requeued.
    pub fn with_requeue_on_failure(mut self, requeue: bool) -> Self {
        self.requeue_on_failure = requeue;
        self
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
mod opt_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
