// Broker connection seam
//
// The dispatcher never speaks a wire protocol itself; it drives whatever
// implements [`Connection`]. A real AMQP client slots in behind this
// trait, and [`InMemoryConnection`] backs tests and demos with the same
// prefetch-window semantics a broker channel would enforce.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Result, WarrenError};
use crate::message::{DeliveryTag, Envelope};

/// Consumed capability giving the dispatcher access to the broker.
///
/// Contract:
/// - `poll_message` is non-blocking: `Ok(None)` means nothing is
///   deliverable right now (queue empty or prefetch window full).
/// - A delivered envelope stays unacknowledged, and counts against the
///   prefetch window, until `ack` or `nack` resolves its tag.
/// - `nack` with `requeue` makes the message deliverable again with the
///   `redelivered` flag set.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Register the queues to consume from.
    async fn subscribe(&self, queues: &[String]) -> Result<()>;

    /// Cap the number of unacknowledged deliveries (0 = unlimited).
    async fn set_prefetch(&self, prefetch: u16) -> Result<()>;

    /// Poll for one deliverable message.
    async fn poll_message(&self) -> Result<Option<Envelope>>;

    /// Acknowledge a delivery.
    async fn ack(&self, tag: DeliveryTag) -> Result<()>;

    /// Negatively acknowledge a delivery, optionally requeueing it.
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()>;

    /// Close the broker session.
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct InMemoryState {
    ready: VecDeque<Envelope>,
    unacked: HashMap<DeliveryTag, Envelope>,
    queues: Vec<String>,
    prefetch: u16,
    next_tag: u64,
    closed: bool,
    lost: bool,
}

/// In-memory [`Connection`] with broker-like prefetch accounting.
///
/// Messages are published locally, delivered FIFO, and held in an
/// unacked set until resolved. `nack(requeue = true)` puts the message
/// back at the head of the queue flagged as redelivered, so redelivery
/// and at-least-once behavior can be exercised without a broker.
#[derive(Debug, Default)]
pub struct InMemoryConnection {
    state: Mutex<InMemoryState>,
}

impl InMemoryConnection {
    /// Create an empty in-memory connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message body, making it deliverable.
    pub fn publish(&self, body: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().unwrap();
        state.next_tag += 1;
        let tag = DeliveryTag(state.next_tag);
        state.ready.push_back(Envelope::new(body, tag));
    }

    /// Simulate the broker dropping the connection mid-run.
    pub fn sever(&self) {
        self.state.lock().unwrap().lost = true;
    }

    /// Number of deliverable messages.
    pub fn ready_len(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    /// Number of unacknowledged deliveries.
    pub fn unacked_len(&self) -> usize {
        self.state.lock().unwrap().unacked.len()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn check_open(state: &InMemoryState) -> Result<()> {
        if state.lost {
            return Err(WarrenError::connection_lost("connection severed"));
        }
        if state.closed {
            return Err(WarrenError::connection_lost("connection closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn subscribe(&self, queues: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        state.queues = queues.to_vec();
        Ok(())
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        state.prefetch = prefetch;
        Ok(())
    }

    async fn poll_message(&self) -> Result<Option<Envelope>> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;

        // Prefetch window full: withhold delivery until something resolves.
        if state.prefetch > 0 && state.unacked.len() >= state.prefetch as usize {
            return Ok(None);
        }

        match state.ready.pop_front() {
            Some(envelope) => {
                state.unacked.insert(envelope.delivery_tag, envelope.clone());
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        state
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or_else(|| WarrenError::protocol(format!("ack of unknown delivery tag {tag}")))
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        let envelope = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| WarrenError::protocol(format!("nack of unknown delivery tag {tag}")))?;

        if requeue {
            state
                .ready
                .push_front(Envelope::redelivery(envelope.body, envelope.delivery_tag));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_delivery() {
        let conn = InMemoryConnection::new();
        conn.publish(b"a".to_vec());
        conn.publish(b"b".to_vec());

        let first = conn.poll_message().await.unwrap().unwrap();
        let second = conn.poll_message().await.unwrap().unwrap();
        assert_eq!(first.body, b"a");
        assert_eq!(second.body, b"b");
        assert!(conn.poll_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prefetch_window_withholds_delivery() {
        let conn = InMemoryConnection::new();
        conn.set_prefetch(2).await.unwrap();
        for _ in 0..3 {
            conn.publish(b"m".to_vec());
        }

        let first = conn.poll_message().await.unwrap().unwrap();
        let _second = conn.poll_message().await.unwrap().unwrap();

        // Window full: third message withheld.
        assert!(conn.poll_message().await.unwrap().is_none());

        // Resolving one delivery reopens the window.
        conn.ack(first.delivery_tag).await.unwrap();
        assert!(conn.poll_message().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers_first() {
        let conn = InMemoryConnection::new();
        conn.publish(b"a".to_vec());
        conn.publish(b"b".to_vec());

        let first = conn.poll_message().await.unwrap().unwrap();
        conn.nack(first.delivery_tag, true).await.unwrap();

        let redelivered = conn.poll_message().await.unwrap().unwrap();
        assert_eq!(redelivered.body, b"a");
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_drops() {
        let conn = InMemoryConnection::new();
        conn.publish(b"a".to_vec());

        let envelope = conn.poll_message().await.unwrap().unwrap();
        conn.nack(envelope.delivery_tag, false).await.unwrap();

        assert_eq!(conn.ready_len(), 0);
        assert_eq!(conn.unacked_len(), 0);
    }

    #[tokio::test]
    async fn test_ack_unknown_tag_is_protocol_violation() {
        let conn = InMemoryConnection::new();
        let err = conn.ack(DeliveryTag(99)).await.unwrap_err();
        assert!(matches!(err, WarrenError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_severed_connection_is_fatal() {
        let conn = InMemoryConnection::new();
        conn.publish(b"a".to_vec());
        conn.sever();

        let err = conn.poll_message().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
