// Message envelope
//
// The envelope is the internal representation of one consumed message:
// the payload plus the delivery identity needed to ack or nack it later.
// It is created when the connection yields a message and is never mutated
// afterwards.

use serde::{Deserialize, Serialize};

/// Opaque delivery identity assigned by the broker.
///
/// Only the connection that produced a tag knows how to resolve it back
/// to an unacknowledged delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One consumed message plus its delivery identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Raw message payload as handed over by the broker.
    pub body: Vec<u8>,
    /// Identity used for acknowledgment.
    pub delivery_tag: DeliveryTag,
    /// Whether the broker flagged this delivery as a redelivery.
    pub redelivered: bool,
}

impl Envelope {
    /// Create an envelope for a first-time delivery.
    pub fn new(body: impl Into<Vec<u8>>, delivery_tag: DeliveryTag) -> Self {
        Self {
            body: body.into(),
            delivery_tag,
            redelivered: false,
        }
    }

    /// Create an envelope flagged as redelivered.
    pub fn redelivery(body: impl Into<Vec<u8>>, delivery_tag: DeliveryTag) -> Self {
        Self {
            body: body.into(),
            delivery_tag,
            redelivered: true,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_envelope_is_not_redelivered() {
        let env = Envelope::new(b"payload".to_vec(), DeliveryTag(1));
        assert_eq!(env.body, b"payload");
        assert_eq!(env.delivery_tag, DeliveryTag(1));
        assert!(!env.redelivered);
        assert_eq!(env.len(), 7);
    }

    #[test]
    fn test_redelivery_sets_flag() {
        let env = Envelope::redelivery(b"again".to_vec(), DeliveryTag(7));
        assert!(env.redelivered);
    }

    #[test]
    fn test_delivery_tag_display() {
        assert_eq!(DeliveryTag(42).to_string(), "42");
    }
}
