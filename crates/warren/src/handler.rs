// Message handler seam
//
// The user's business logic is supplied as a [`Handler`] capability and
// invoked once per message inside a worker unit. Handlers report failure
// as a value; a panicking handler kills its worker task instead, which
// the dispatcher observes as a crash and handles separately.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::message::Envelope;

/// Outcome of handling one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Message processed; the dispatcher will acknowledge it.
    Done,
    /// Message rejected with a reason; the dispatcher will nack it.
    Failed(String),
}

impl HandlerOutcome {
    /// Create a failure outcome.
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerOutcome::Failed(reason.into())
    }

    /// Whether this outcome is `Done`.
    pub fn is_done(&self) -> bool {
        matches!(self, HandlerOutcome::Done)
    }
}

/// User-supplied message-handling logic.
///
/// Executed inside a worker unit, one envelope at a time. Implementations
/// must be shareable across workers.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Process one message.
    async fn handle(&self, envelope: Envelope) -> HandlerOutcome;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send,
{
    async fn handle(&self, envelope: Envelope) -> HandlerOutcome {
        (self.0)(envelope).await
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```
/// use warren::handler::{handler_fn, HandlerOutcome};
///
/// let handler = handler_fn(|envelope| async move {
///     if envelope.is_empty() {
///         HandlerOutcome::failed("empty payload")
///     } else {
///         HandlerOutcome::Done
///     }
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
